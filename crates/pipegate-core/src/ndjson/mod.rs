//! NDJSON framing for worker stdio.
//!
//! Tolerant reader: lines that are not valid JSON are reported to the caller,
//! which decides whether to drop them.

pub mod framer;

pub use framer::{DEFAULT_MAX_LINE_BYTES, LineFramer, encode_line, parse_line};
