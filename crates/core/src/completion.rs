use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Identifies one outstanding wait. A new wait always gets a fresh token, so a timer or
/// completion that fires for an older one can be recognized and ignored.
pub type WaitToken = u64;

/// Single-slot store for "wait until the model finishes its current response".
///
/// Issuing a new wait abandons the previous one. Resolution is idempotent: it clears the
/// slot, fires the waiter (if any) and stops the timeout timer.
#[derive(Debug, Default)]
pub struct CompletionSlot {
    next_token: WaitToken,
    current: Option<WaitToken>,
    waiter: Option<oneshot::Sender<()>>,
    timer: Option<AbortHandle>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, waiter: Option<oneshot::Sender<()>>) -> WaitToken {
        self.abandon();
        self.next_token += 1;
        self.current = Some(self.next_token);
        self.waiter = waiter;
        self.next_token
    }

    /// Attach the timeout task for `token`. Ignored (and the task aborted) if the token
    /// is no longer current.
    pub fn arm_timer(&mut self, token: WaitToken, timer: AbortHandle) {
        if self.current == Some(token) {
            if let Some(previous) = self.timer.replace(timer) {
                previous.abort();
            }
        } else {
            timer.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_current(&self, token: WaitToken) -> bool {
        self.current == Some(token)
    }

    /// Resolve the outstanding wait. Returns false if nothing was pending.
    pub fn resolve(&mut self) -> bool {
        if self.current.take().is_none() {
            return false;
        }
        if let Some(waiter) = self.waiter.take() {
            // receiver gone means the waiting loop was cancelled
            let _ = waiter.send(());
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        true
    }

    /// Drop the outstanding wait without signalling it.
    pub fn abandon(&mut self) {
        self.current = None;
        self.waiter = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_signals_the_waiter_once() {
        let mut slot = CompletionSlot::new();
        let (tx, rx) = oneshot::channel();
        let token = slot.issue(Some(tx));

        assert!(slot.is_current(token));
        assert!(slot.resolve());
        assert!(!slot.resolve(), "second resolve must be a no-op");
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn stale_tokens_are_ignored() {
        let mut slot = CompletionSlot::new();
        let first = slot.issue(None);
        let (tx, rx) = oneshot::channel();
        let second = slot.issue(Some(tx));

        assert_ne!(first, second);
        assert!(!slot.is_current(first));
        assert!(slot.is_current(second));
        assert!(slot.resolve());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn abandon_drops_the_waiter_and_timer() {
        let mut slot = CompletionSlot::new();
        let (tx, rx) = oneshot::channel();
        let token = slot.issue(Some(tx));
        let timer = tokio::spawn(std::future::pending::<()>());
        slot.arm_timer(token, timer.abort_handle());

        slot.abandon();

        assert!(!slot.is_pending());
        assert!(rx.await.is_err(), "waiter should see the sender dropped");
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
