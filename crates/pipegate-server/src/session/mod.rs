//! Session state and the registry of live sessions.

mod registry;
mod types;

pub use registry::SessionRegistry;
pub use types::{Session, SessionState, StreamEvent, TeardownReason};
