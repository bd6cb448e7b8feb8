pub mod config;
pub mod console;
pub mod ws_transport;
