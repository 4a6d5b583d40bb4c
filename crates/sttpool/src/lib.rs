//! sttpool: pooled streaming speech recognition over raw TCP.
//!
//! A fixed pool of recognizer instances is shared by many connections. Each
//! connection binds one decoder for its lifetime or is refused outright.

mod version;

pub mod codec;
pub mod decoder;
pub mod dispatcher;
pub mod engine;
pub mod pcm;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use codec::TranscriptCodec;
pub use decoder::{DecoderLease, DecoderPool, HandleId, PoolConfig, PoolError, PoolSnapshot};
pub use dispatcher::{DispatchError, Dispatcher, SessionInfo};
pub use engine::{Engine, EngineConfig, EngineError, EngineFactory, ModelPaths};
pub use session::{
    ChunkOutcome, CloseReason, ConnectionId, DropReason, Session, SessionConfig, SessionError,
    SessionState,
};
pub use transport::{ServerConfig, TransportError, serve, serve_listener};
pub use version::{ENGINE_BACKEND, STTPOOL_VERSION, VersionInfo};

#[cfg(feature = "sherpa")]
pub use engine::sherpa::SherpaFactory;
