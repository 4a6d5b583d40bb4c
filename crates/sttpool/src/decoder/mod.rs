//! Decoder pool: a fixed set of engine instances with exclusive checkout.
//!
//! - `DecoderPool::acquire` claims an idle handle and returns a [`DecoderLease`]
//! - `DecoderLease::release` drains the engine, resets it, and frees the handle
//! - `DecoderLease::poison` retires the handle for good (engine state unknown)
//!
//! Handles are owned by the pool for its whole lifetime; a lease only carries the
//! handle's index. Nothing but the per-handle atomics is shared between sessions.

mod handle;
mod pool;

pub use handle::HandleId;
pub use pool::{DecoderLease, DecoderPool, PoolConfig, PoolError, PoolSnapshot};
