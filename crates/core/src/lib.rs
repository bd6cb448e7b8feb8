pub mod completion;
pub mod content;
pub mod context;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod question;
pub mod recovery;
pub mod session_state;
pub mod settings;
pub mod transport;

mod chunk_loop;

pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use session_state::{PlaybackState, SessionView};
pub use settings::PlaybackSettings;

/// Imperative operations the UI layer issues to a running orchestrator.
///
/// Every command is queued onto the orchestrator's single control loop, so the order
/// commands are sent in is the order they take effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Connect and play. `resume` restores the persisted cursor instead of starting at 0.
    Start { resume: bool },
    /// Forget persisted progress and play from the first chunk.
    Restart,
    Pause,
    Stop,
    /// Halt narration so the listener can ask a question.
    Interrupt,
    /// A typed question; interrupts playback first if needed.
    SendQuestion(String),
    Resume,
    SetMicrophone(bool),
}
