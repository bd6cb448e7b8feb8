mod client;

pub use client::config::{Config, ConfigBuilder};
pub use client::{Client, ServerMessage, ServerRx, connect, connect_with_config};
pub use openai_realtime_types as types;
