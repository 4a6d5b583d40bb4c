//! Per-connection streaming session.
//!
//! ```text
//! Accepted ──bind ok──▶ Bound ──▶ Streaming ──eof/error/idle/shutdown──▶ Closing ──▶ Closed
//!     │                                                                     ▲
//!     └──────────────────────────── pool exhausted ─────────────────────────┘
//! ```
//!
//! A session owns at most one [`DecoderLease`]. `close()` gives it back exactly once,
//! whichever exit path gets there first. Everything here is synchronous; the
//! dispatcher runs the blocking calls off the reactor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::decoder::{DecoderLease, DecoderPool, HandleId};
use crate::engine::EngineError;
use crate::pcm;

/// 200 ms of 16 kHz s16le audio.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 6400;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serial number of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic connection ids, wrapping within 31 bits.
#[derive(Debug, Default)]
pub struct ConnectionIds {
    next: AtomicU32,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest chunk that will be decoded. Larger chunks are dropped.
    pub max_chunk_bytes: usize,
    /// Close the session after this long without inbound data. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl SessionConfig {
    /// Transport read size: the chunk limit rounded down to whole samples.
    ///
    /// Reads never exceed the limit, so a chunk from the socket is never oversized.
    pub fn read_buffer_len(&self) -> usize {
        (self.max_chunk_bytes & !1).max(pcm::BYTES_PER_SAMPLE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Accepted,
    Bound,
    Streaming,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Accepted => "accepted",
            SessionState::Bound => "bound",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No free decoder at accept time.
    Rejected,
    /// Peer finished sending.
    EndOfInput,
    IdleTimeout,
    Transport(std::io::ErrorKind),
    DecodeFailed,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Rejected => f.write_str("rejected"),
            CloseReason::EndOfInput => f.write_str("end of input"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Transport(kind) => write!(f, "transport error ({kind})"),
            CloseReason::DecodeFailed => f.write_str("decode failed"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Why a chunk produced no transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OddLength(usize),
    Oversized(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Text for the peer, without line terminator.
    Transcript(String),
    Dropped(DropReason),
    /// Zero-length chunk; the session is now closing.
    EndOfInput,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no decoder available")]
    PoolExhausted,
    #[error("session is {0}, not streaming")]
    NotStreaming(SessionState),
    #[error("decode failed: {0}")]
    Decode(#[from] EngineError),
}

/// Counters logged when the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub chunks: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub transcripts: u64,
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    lease: Option<DecoderLease>,
    /// Reused across chunks; empty between calls.
    samples: Vec<f32>,
    max_chunk_bytes: usize,
    close_reason: Option<CloseReason>,
    stats: SessionStats,
}

impl Session {
    pub fn new(id: ConnectionId, config: &SessionConfig) -> Self {
        Self {
            id,
            state: SessionState::Accepted,
            lease: None,
            samples: Vec::with_capacity(config.max_chunk_bytes / pcm::BYTES_PER_SAMPLE),
            max_chunk_bytes: config.max_chunk_bytes,
            close_reason: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.lease.as_ref().map(DecoderLease::id)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Take a decoder from the pool and start streaming.
    ///
    /// On exhaustion the session goes straight to Closing without ever holding a
    /// decoder.
    pub fn bind(&mut self, pool: &Arc<DecoderPool>) -> Result<HandleId, SessionError> {
        if self.state != SessionState::Accepted {
            return Err(SessionError::NotStreaming(self.state));
        }
        let Some(lease) = pool.acquire() else {
            self.begin_close(CloseReason::Rejected);
            return Err(SessionError::PoolExhausted);
        };
        let handle = lease.id();
        self.lease = Some(lease);
        self.state = SessionState::Bound;
        tracing::debug!(conn = %self.id, handle = %handle, "Session bound");
        self.state = SessionState::Streaming;
        Ok(handle)
    }

    /// Process one inbound chunk. Blocking when the chunk is decoded.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> Result<ChunkOutcome, SessionError> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::NotStreaming(self.state));
        }
        if bytes.is_empty() {
            self.begin_close(CloseReason::EndOfInput);
            return Ok(ChunkOutcome::EndOfInput);
        }

        self.stats.chunks += 1;
        self.stats.bytes += bytes.len() as u64;

        if bytes.len() % pcm::BYTES_PER_SAMPLE != 0 {
            self.stats.dropped += 1;
            tracing::debug!(conn = %self.id, bytes = bytes.len(), "Dropping odd-length chunk");
            return Ok(ChunkOutcome::Dropped(DropReason::OddLength(bytes.len())));
        }
        if bytes.len() > self.max_chunk_bytes {
            self.stats.dropped += 1;
            tracing::warn!(
                conn = %self.id,
                bytes = bytes.len(),
                max = self.max_chunk_bytes,
                "Dropping oversized chunk"
            );
            return Ok(ChunkOutcome::Dropped(DropReason::Oversized(bytes.len())));
        }

        let Some(lease) = self.lease.as_mut() else {
            return Err(SessionError::NotStreaming(self.state));
        };

        pcm::decode_s16le_into(bytes, &mut self.samples);
        let result = lease.decode(&self.samples);
        self.samples.clear();

        match result {
            Ok(text) => {
                self.stats.transcripts += 1;
                tracing::trace!(conn = %self.id, bytes = bytes.len(), text = %text, "Decoded chunk");
                Ok(ChunkOutcome::Transcript(text))
            }
            Err(e) => {
                lease.poison();
                self.begin_close(CloseReason::DecodeFailed);
                Err(SessionError::Decode(e))
            }
        }
    }

    /// Move to Closing. The first reason sticks; returns whether this call changed state.
    pub fn begin_close(&mut self, reason: CloseReason) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        tracing::debug!(conn = %self.id, from = %self.state, reason = %reason, "Session closing");
        self.state = SessionState::Closing;
        self.close_reason = Some(reason);
        true
    }

    /// Give the decoder back and finish. Blocking while the engine drains.
    ///
    /// Safe to call from any state and any number of times; the lease is released
    /// once. Returns whether this call did the teardown.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        if self.state != SessionState::Closing {
            self.begin_close(CloseReason::Shutdown);
        }
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
        self.state = SessionState::Closed;
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("handle", &self.handle())
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}
