//! Transport layer for sttpool.
//!
//! Raw TCP only: PCM in, transcript lines out, no framing.

pub mod tcp;

pub use tcp::{ServerConfig, TransportError, serve, serve_listener};
