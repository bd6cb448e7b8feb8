//now people using the types library can use these types
pub mod audio;
pub mod events;
pub mod session;
mod content;

//re-export types for easier access
pub use content::items::Item;
pub use content::message::*;
pub use events::ClientEvent;
pub use session::Session;
