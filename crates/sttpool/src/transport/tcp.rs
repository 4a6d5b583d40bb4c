//! Raw TCP transport: accept loop, admission, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::dispatcher::{Dispatcher, wait_for_shutdown};

/// Pause after a failed accept so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, TransportError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener has no local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("decoder pool teardown failed: {0}")]
    Teardown(#[from] tokio::task::JoinError),
    #[error("all {capacity} decoders failed and were retired")]
    NoDecoders { capacity: usize },
}

/// Bind and serve until SIGINT, SIGTERM, or [`Dispatcher::trigger_shutdown`].
pub async fn serve(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<(), TransportError> {
    let addr = config.addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })?;

    let signal_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        shutdown_signal(signal_dispatcher.shutdown_rx()).await;
        signal_dispatcher.trigger_shutdown();
    });

    serve_listener(listener, dispatcher).await
}

/// Accept on an already bound listener. Returns after every session has closed and
/// the pool has been torn down.
///
/// Losing every decoder to failures stops the server with
/// [`TransportError::NoDecoders`].
pub async fn serve_listener(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), TransportError> {
    let local = listener.local_addr().map_err(TransportError::LocalAddr)?;
    info!(
        addr = %local,
        decoders = dispatcher.pool().capacity(),
        "Starting sttpool server on {}",
        local
    );

    let mut shutdown_rx = dispatcher.shutdown_rx();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match dispatcher.admit(peer) {
                    Some(session) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        sessions.spawn(Arc::clone(&dispatcher).drive(session, stream));
                    }
                    // Dropping the stream closes it without a byte written.
                    None => drop(stream),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }

        while let Some(joined) = sessions.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Session task panicked");
            }
        }
    }

    drop(listener);
    info!(sessions = sessions.len(), "Stopped accepting, waiting for sessions to close");
    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Session task panicked");
        }
    }

    let pool = Arc::clone(dispatcher.pool());
    tokio::task::spawn_blocking(move || pool.close()).await?;

    let pool = dispatcher.pool();
    if pool.healthy() == 0 {
        tracing::error!(capacity = pool.capacity(), "Server stopped with no healthy decoder");
        return Err(TransportError::NoDecoders {
            capacity: pool.capacity(),
        });
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT, SIGTERM, or an explicit shutdown request.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That is an unrecoverable startup error.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            info!("Shutdown requested...");
        }
    }
}
