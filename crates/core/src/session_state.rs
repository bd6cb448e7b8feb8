use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Connecting,
    Playing,
    Paused,
    Interrupted,
    Answering,
    WaitingToResume,
    Finished,
    Error,
}

impl PlaybackState {
    /// States in which a live realtime session is required. Losing the connection in one
    /// of these is fatal.
    pub fn needs_connection(self) -> bool {
        matches!(
            self,
            PlaybackState::Playing
                | PlaybackState::Interrupted
                | PlaybackState::Answering
                | PlaybackState::WaitingToResume
        )
    }

    pub fn can_start(self) -> bool {
        matches!(
            self,
            PlaybackState::Idle | PlaybackState::Paused | PlaybackState::Finished | PlaybackState::Error
        )
    }

    /// The listener is talking to the model rather than listening to narration.
    pub fn in_dialog(self) -> bool {
        matches!(
            self,
            PlaybackState::Interrupted | PlaybackState::Answering | PlaybackState::WaitingToResume
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting => "connecting",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Interrupted => "interrupted",
            PlaybackState::Answering => "answering",
            PlaybackState::WaitingToResume => "waiting_to_resume",
            PlaybackState::Finished => "finished",
            PlaybackState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Playback position. Only the orchestrator mutates this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub state: PlaybackState,
    /// Next chunk to play; also the value persisted as progress.
    pub chunk_index: usize,
    /// Chunk currently being narrated, if any.
    pub active_chunk_index: Option<usize>,
    /// Chunk the next loop iteration must restart at.
    pub rollback_chunk_index: Option<usize>,
    pub total_chunks: usize,
}

impl Session {
    /// Where playback continues: the rollback target if one is set, the cursor otherwise.
    pub fn resume_index(&self) -> usize {
        self.rollback_chunk_index.unwrap_or(self.chunk_index)
    }

    /// Arrange for the chunk being narrated (or the cursor) to be replayed.
    pub fn mark_for_replay(&mut self) {
        self.rollback_chunk_index = Some(self.active_chunk_index.unwrap_or(self.chunk_index));
    }

    /// Consume a pending rollback, moving the cursor back to it.
    pub fn apply_rollback(&mut self) {
        if let Some(index) = self.rollback_chunk_index.take() {
            self.chunk_index = index;
        }
    }

    pub fn reset_transient(&mut self) {
        self.active_chunk_index = None;
        self.rollback_chunk_index = None;
    }
}

/// Snapshot published to the UI after every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub state: PlaybackState,
    pub lecture_title: Option<String>,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk_text: Option<String>,
    pub section_name: Option<String>,
    pub context_text: String,
    pub last_transcript: Option<String>,
    pub assistant_text: String,
    pub error_message: Option<String>,
    pub notice: Option<String>,
    pub mic_enabled: bool,
}
