use std::time::Duration;

pub const DEFAULT_RESUME_PHRASE: &str = "forge ahead";

/// Timing and threshold knobs for one playback session.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    /// Seconds of narration kept in the rolling context window.
    pub context_window_secs: u32,
    /// Lower bound on how long a chunk response may take before it is treated as done.
    pub min_chunk_timeout: Duration,
    pub question_timeout: Duration,
    /// Quiet period after the last recognized utterance before a question is dispatched.
    pub question_debounce: Duration,
    /// Backoff between checks while a previous response is still in flight.
    pub inflight_poll: Duration,
    /// How long the chunk loop waits on a lingering response before cancelling it.
    pub inflight_limit: Duration,
    pub error_window: Duration,
    pub fatal_error_threshold: u32,
    pub resume_phrase: String,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            context_window_secs: 30,
            min_chunk_timeout: Duration::from_secs(30),
            question_timeout: Duration::from_secs(45),
            question_debounce: Duration::from_millis(600),
            inflight_poll: Duration::from_millis(250),
            inflight_limit: Duration::from_secs(10),
            error_window: Duration::from_secs(15),
            fatal_error_threshold: 3,
            resume_phrase: DEFAULT_RESUME_PHRASE.to_string(),
        }
    }
}

impl PlaybackSettings {
    pub fn with_resume_phrase(mut self, phrase: &str) -> Self {
        self.resume_phrase = phrase.to_string();
        self
    }

    pub fn with_question_debounce(mut self, debounce: Duration) -> Self {
        self.question_debounce = debounce;
        self
    }

    /// Twice the spoken length plus slack, never below `min_chunk_timeout`.
    pub fn chunk_timeout(&self, approx_seconds: u32) -> Duration {
        let scaled = Duration::from_secs(u64::from(approx_seconds) * 2 + 10);
        scaled.max(self.min_chunk_timeout)
    }
}
