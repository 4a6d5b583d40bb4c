//! Connection dispatcher: admits connections against the pool and drives each
//! session over its socket.
//!
//! One task per connection. Engine work (decode, drain) runs on the blocking pool;
//! the session is moved in and handed back so each connection keeps strictly one
//! call in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;

use crate::codec::TranscriptCodec;
use crate::decoder::{DecoderPool, HandleId};
use crate::session::{
    ChunkOutcome, CloseReason, ConnectionId, ConnectionIds, Session, SessionConfig, SessionError,
};

/// How long the final flush and socket shutdown may take before the stream is
/// dropped anyway.
pub const CLOSE_LINGER: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Registry entry for a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub handle: HandleId,
    pub started: Instant,
}

pub struct Dispatcher {
    pool: Arc<DecoderPool>,
    config: SessionConfig,
    ids: ConnectionIds,
    sessions: DashMap<ConnectionId, SessionInfo>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<DecoderPool>, config: SessionConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            pool,
            config,
            ids: ConnectionIds::new(),
            sessions: DashMap::new(),
            shutdown_tx,
        })
    }

    pub fn pool(&self) -> &Arc<DecoderPool> {
        &self.pool
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session for a new connection and bind it to a decoder.
    ///
    /// `None` means the pool is exhausted; the caller closes the connection
    /// without writing anything.
    pub fn admit(&self, peer: SocketAddr) -> Option<Session> {
        let mut session = Session::new(self.ids.next(), &self.config);
        match session.bind(&self.pool) {
            Ok(handle) => {
                self.sessions.insert(
                    session.id(),
                    SessionInfo {
                        peer,
                        handle,
                        started: Instant::now(),
                    },
                );
                tracing::info!(conn = %session.id(), peer = %peer, handle = %handle, "Session opened");
                Some(session)
            }
            Err(SessionError::PoolExhausted) => {
                let snapshot = self.pool.snapshot();
                tracing::warn!(
                    conn = %session.id(),
                    peer = %peer,
                    capacity = snapshot.capacity,
                    busy = snapshot.busy,
                    poisoned = snapshot.poisoned,
                    "No decoder available, rejecting connection"
                );
                session.close();
                None
            }
            Err(e) => {
                tracing::error!(conn = %session.id(), error = %e, "Failed to bind session");
                session.close();
                None
            }
        }
    }

    /// Run a bound session until it closes, then release its decoder and drop the
    /// stream.
    pub async fn drive<S>(self: Arc<Self>, session: Session, stream: S) -> Option<CloseReason>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = session.id();
        let (reader, writer) = tokio::io::split(stream);
        let mut writer = FramedWrite::new(writer, TranscriptCodec::new());

        let result = self.stream_chunks(session, reader, &mut writer).await;
        let reason = match result {
            Ok(session) => self.finish(session).await,
            Err(e) => {
                // The session was lost with its task; its lease released on unwind.
                tracing::error!(conn = %id, error = %e, "Session task failed");
                None
            }
        };

        if self.pool.healthy() == 0 && !self.is_shutting_down() {
            tracing::error!(conn = %id, capacity = self.pool.capacity(), "No healthy decoder left, shutting down");
            self.trigger_shutdown();
        }

        if let Some((_, info)) = self.sessions.remove(&id) {
            let reason_label = reason.map_or_else(|| "unknown".to_string(), |r| r.to_string());
            tracing::info!(
                conn = %id,
                peer = %info.peer,
                handle = %info.handle,
                elapsed_ms = info.started.elapsed().as_millis() as u64,
                reason = %reason_label,
                "Session closed"
            );
        }
        match tokio::time::timeout(CLOSE_LINGER, SinkExt::<String>::close(&mut writer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(conn = %id, error = %e, "Socket shutdown failed"),
            Err(_) => tracing::debug!(conn = %id, "Peer not reading, dropping socket"),
        }
        reason
    }

    async fn stream_chunks<R, W>(
        &self,
        mut session: Session,
        mut reader: R,
        writer: &mut FramedWrite<W, TranscriptCodec>,
    ) -> Result<Session, DispatchError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let id = session.id();
        let mut buf = vec![0u8; self.config.read_buffer_len()];
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let read = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    session.begin_close(CloseReason::Shutdown);
                    break;
                }
                read = bounded(self.config.idle_timeout, reader.read(&mut buf)) => read,
            };

            let n = match read {
                Ok(n) => n,
                Err(IoWait::Idle(after)) => {
                    tracing::info!(conn = %id, idle_ms = after.as_millis() as u64, "Idle timeout");
                    session.begin_close(CloseReason::IdleTimeout);
                    break;
                }
                Err(IoWait::Io(e)) => {
                    tracing::debug!(conn = %id, error = %e, "Read failed");
                    session.begin_close(CloseReason::Transport(e.kind()));
                    break;
                }
            };
            tracing::trace!(conn = %id, bytes = n, "Chunk received");

            let (returned, returned_buf, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = session.on_chunk(&buf[..n]);
                (session, buf, outcome)
            })
            .await?;
            session = returned;
            buf = returned_buf;

            match outcome {
                Ok(ChunkOutcome::Transcript(text)) => {
                    // A peer that stops reading stalls the send; it is held to the
                    // same idle limit as reads and still yields to shutdown.
                    let sent = tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown_rx) => {
                            session.begin_close(CloseReason::Shutdown);
                            break;
                        }
                        sent = bounded(self.config.idle_timeout, writer.send(text)) => sent,
                    };
                    match sent {
                        Ok(()) => {}
                        Err(IoWait::Idle(after)) => {
                            tracing::info!(conn = %id, idle_ms = after.as_millis() as u64, "Peer stopped reading");
                            session.begin_close(CloseReason::IdleTimeout);
                            break;
                        }
                        Err(IoWait::Io(e)) => {
                            tracing::debug!(conn = %id, error = %e, "Write failed");
                            session.begin_close(CloseReason::Transport(e.kind()));
                            break;
                        }
                    }
                }
                Ok(ChunkOutcome::Dropped(reason)) => {
                    tracing::trace!(conn = %id, ?reason, "Chunk dropped");
                }
                Ok(ChunkOutcome::EndOfInput) => break,
                Err(SessionError::Decode(e)) => {
                    tracing::error!(conn = %id, error = %e, "Decode failed, closing session");
                    break;
                }
                Err(e) => {
                    tracing::warn!(conn = %id, error = %e, "Unexpected session state");
                    session.begin_close(CloseReason::Shutdown);
                    break;
                }
            }
        }
        Ok(session)
    }

    /// Release the decoder off the reactor and return why the session closed.
    async fn finish(&self, mut session: Session) -> Option<CloseReason> {
        let id = session.id();
        let stats = session.stats();
        match tokio::task::spawn_blocking(move || {
            session.close();
            session.close_reason()
        })
        .await
        {
            Ok(reason) => {
                tracing::debug!(
                    conn = %id,
                    chunks = stats.chunks,
                    bytes = stats.bytes,
                    dropped = stats.dropped,
                    transcripts = stats.transcripts,
                    "Session released decoder"
                );
                reason
            }
            Err(e) => {
                tracing::error!(conn = %id, error = %e, "Decoder release task failed");
                None
            }
        }
    }

    /// Ask every session and the accept loop to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_info(&self, id: ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("active_sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum IoWait {
    Idle(Duration),
    Io(std::io::Error),
}

/// Run one socket read or write, giving up after `idle_timeout` without progress.
async fn bounded<F, T>(idle_timeout: Option<Duration>, io: F) -> Result<T, IoWait>
where
    F: Future<Output = std::io::Result<T>>,
{
    match idle_timeout {
        Some(after) => match tokio::time::timeout(after, io).await {
            Ok(done) => done.map_err(IoWait::Io),
            Err(_) => Err(IoWait::Idle(after)),
        },
        None => io.await.map_err(IoWait::Io),
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
