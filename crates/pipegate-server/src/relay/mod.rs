//! Relay engine: binds each client stream to one worker process.

mod engine;

pub use engine::{OpenedSession, RelayEngine, message_path};
