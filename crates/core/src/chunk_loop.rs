use crate::content::{Chunk, ContentService};
use crate::error::ContentError;
use crate::orchestrator::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What the loop should do once a delivered chunk's response has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// Sleep out the rest of the chunk, then advance.
    Pace,
    /// Go straight back to the top; a rollback is pending.
    Replay,
    Stop,
}

/// Questions the loop asks the orchestrator. The loop owns no session state; every
/// decision is made on the orchestrator's side and answered through the reply channel.
/// A dropped reply means the loop is stale and must exit.
#[derive(Debug)]
pub(crate) enum LoopRequest {
    /// Apply any rollback and hand out the next index, or `None` when playback is over.
    NextIndex { reply: oneshot::Sender<Option<usize>> },
    Activate {
        index: usize,
        chunk: Chunk,
        reply: oneshot::Sender<bool>,
    },
    ResponseInFlight { reply: oneshot::Sender<bool> },
    /// A previous response has lingered past the limit. The first request cancels it,
    /// a repeat forgets it.
    CancelStale { reply: oneshot::Sender<()> },
    /// Send the active chunk; the receiver fires when its response completes.
    Deliver {
        index: usize,
        reply: oneshot::Sender<Option<oneshot::Receiver<()>>>,
    },
    Delivered {
        index: usize,
        reply: oneshot::Sender<ChunkOutcome>,
    },
    /// Commit the chunk; `false` means stop.
    Advance {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    FetchFailed { index: usize, error: ContentError },
}

/// One run of the sequential narration loop. A new run is spawned for every start,
/// resume and recovery; the previous run is cancelled first.
pub(crate) struct ChunkLoop {
    pub(crate) id: u64,
    pub(crate) lecture_id: String,
    pub(crate) content: Arc<dyn ContentService>,
    pub(crate) inbox: mpsc::Sender<Event>,
    pub(crate) cancel: CancellationToken,
    pub(crate) inflight_poll: Duration,
    pub(crate) inflight_limit: Duration,
}

impl ChunkLoop {
    pub(crate) async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(loop_id = self.id, "chunk loop cancelled");
            }
            _ = self.drive() => {
                tracing::debug!(loop_id = self.id, "chunk loop exited");
            }
        }
    }

    async fn drive(&self) {
        loop {
            let Some(index) = self
                .request(|reply| LoopRequest::NextIndex { reply })
                .await
                .flatten()
            else {
                return;
            };

            let chunk = match self.content.fetch_chunk(&self.lecture_id, index).await {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.post(LoopRequest::FetchFailed { index, error }).await;
                    return;
                }
            };
            let spoken = Duration::from_secs(u64::from(chunk.approx_seconds));

            let activated = self
                .request(|reply| LoopRequest::Activate { index, chunk, reply })
                .await;
            if activated != Some(true) {
                return;
            }

            if !self.wait_for_idle_channel().await {
                return;
            }

            let Some(completion) = self
                .request(|reply| LoopRequest::Deliver { index, reply })
                .await
                .flatten()
            else {
                return;
            };
            let sent_at = Instant::now();
            // An abandoned wait drops the sender; the Delivered check below sorts it out.
            let _ = completion.await;

            match self
                .request(|reply| LoopRequest::Delivered { index, reply })
                .await
            {
                Some(ChunkOutcome::Pace) => {}
                Some(ChunkOutcome::Replay) => continue,
                Some(ChunkOutcome::Stop) | None => return,
            }

            if let Some(remaining) = spoken.checked_sub(sent_at.elapsed()) {
                tokio::time::sleep(remaining).await;
            }

            let keep_going = self
                .request(|reply| LoopRequest::Advance { index, reply })
                .await;
            if keep_going != Some(true) {
                return;
            }
        }
    }

    /// Poll until no response is in flight. A response that lingers past the limit is
    /// cancelled, and dropped outright if it outlives the cancel by another full limit.
    /// Returns false if the orchestrator went away.
    async fn wait_for_idle_channel(&self) -> bool {
        let mut started = Instant::now();
        loop {
            match self
                .request(|reply| LoopRequest::ResponseInFlight { reply })
                .await
            {
                Some(false) => return true,
                Some(true) => {}
                None => return false,
            }
            if started.elapsed() >= self.inflight_limit {
                tracing::warn!(
                    loop_id = self.id,
                    "previous response still in flight after {:?}, cancelling it",
                    self.inflight_limit
                );
                if self
                    .request(|reply| LoopRequest::CancelStale { reply })
                    .await
                    .is_none()
                {
                    return false;
                }
                started = Instant::now();
                continue;
            }
            tokio::time::sleep(self.inflight_poll).await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> LoopRequest,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await;
        rx.await.ok()
    }

    async fn post(&self, request: LoopRequest) {
        let event = Event::Loop {
            loop_id: self.id,
            request,
        };
        if self.inbox.send(event).await.is_err() {
            tracing::debug!(loop_id = self.id, "orchestrator gone, chunk loop stopping");
        }
    }
}
