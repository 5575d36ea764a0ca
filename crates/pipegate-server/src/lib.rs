//! pipegate server library.
//!
//! Bridges SSE clients to line-oriented worker processes:
//! - `worker`: process spawn, stdio pumps, graceful then forced termination
//! - `session`: session state and the live-session registry
//! - `relay`: admission, message relay, idempotent teardown
//! - `cleanup` / `shutdown`: idle sweeps and drain on exit
//! - `server`: axum router and middleware

pub mod cleanup;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod worker;
