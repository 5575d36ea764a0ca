//! pipegate Core Library
//!
//! Shared functionality for the pipegate server:
//! - Admission control (bearer secret, command allow-list, env filtering)
//! - Per-caller token bucket rate limiting
//! - NDJSON line framing for worker stdio
//! - Configuration loading and validation
//! - Common error types

pub mod admission;
pub mod config;
pub mod error;
pub mod ndjson;
pub mod rate_limit;
pub mod tracing_init;

pub use admission::{Admission, AdmittedRequest};
pub use config::{GatewayConfig, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use rate_limit::{RateLimitConfig, RateLimiter};
