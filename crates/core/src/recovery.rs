use openai_realtime_types::events::server::{ACTIVE_RESPONSE_EXISTS, CANCEL_NOT_ACTIVE};
use std::time::Duration;
use tokio::time::Instant;

/// Codes produced by harmless races between our cancels/creates and the server.
pub fn is_benign(code: &str) -> bool {
    code == CANCEL_NOT_ACTIVE || code == ACTIVE_RESPONSE_EXISTS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Surface as a notice; nothing else changes.
    Benign,
    /// Replay the active chunk on the existing connection.
    Recover { attempt: u32 },
    /// Too many errors in a short span; give up.
    Fatal { attempts: u32 },
}

/// Counts non-benign protocol errors that arrive close together.
#[derive(Debug, Clone)]
pub struct ErrorRecoveryPolicy {
    window: Duration,
    threshold: u32,
    attempts: u32,
    last_error_at: Option<Instant>,
}

impl ErrorRecoveryPolicy {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            attempts: 0,
            last_error_at: None,
        }
    }

    pub fn observe(&mut self, code: &str, now: Instant) -> RecoveryDecision {
        if is_benign(code) {
            return RecoveryDecision::Benign;
        }

        self.attempts = match self.last_error_at {
            Some(last) if now.saturating_duration_since(last) < self.window => self.attempts + 1,
            _ => 1,
        };
        self.last_error_at = Some(now);

        if self.attempts >= self.threshold {
            let attempts = self.attempts;
            self.reset();
            RecoveryDecision::Fatal { attempts }
        } else {
            RecoveryDecision::Recover {
                attempt: self.attempts,
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error_at = None;
    }
}
