//! TCP listener accepting peer connections.
//!
//! Every accepted socket becomes a Server-role [`ConnectionSession`] sharing
//! one [`Dispatcher`]. Shutdown stops accepting, closes every session and
//! waits up to `shutdown_timeout` for their read loops to finish.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::session::{ConnectionEvent, ConnectionSession};

type SessionMap = Arc<Mutex<HashMap<String, Arc<ConnectionSession>>>>;

pub struct TransferServer {
    listener: TcpListener,
    config: NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    sessions: SessionMap,
}

impl TransferServer {
    /// Bind to `config.server.address`. Port 0 picks a free port.
    #[instrument(skip(config, dispatcher), fields(address = %config.server.address))]
    pub async fn bind(config: &NetworkConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(&config.server.address)
            .await
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot bind {}: {e}", config.server.address)))?;
        info!(address = %listener.local_addr()?, "Listening");
        Ok(Self {
            listener,
            config: config.clone(),
            dispatcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sessions currently attached.
    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Serve until `shutdown_rx` yields or its sender is dropped.
    pub async fn run_with_shutdown(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain().await;
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => error!(error = %e, "Error accepting connection"),
                }
            }
        }
    }

    fn accept(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let active = lock(&self.sessions).len();
        if active >= self.config.server.max_connections {
            warn!(peer = %peer, active, "Connection limit reached, refusing peer");
            drop(stream);
            return;
        }

        let session = ConnectionSession::accepted(peer, &self.config);
        // Subscribe before attaching so the disconnect cannot be missed
        let mut events = session.subscribe();
        if let Err(e) = session.attach(stream, Arc::clone(&self.dispatcher)) {
            error!(peer = %peer, error = %e, "Failed to attach connection");
            return;
        }
        info!(peer = %peer, "New connection established");
        lock(&self.sessions).insert(session.id().to_string(), Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Disconnected) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if !session.is_connected() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            lock(&sessions).remove(session.id());
            info!(peer = %peer, "Connection closed");
        });
    }

    async fn drain(&self) {
        let open = self.sessions();
        info!(connections = open.len(), "Shutting down server. Closing connections...");
        for session in &open {
            session.close();
        }

        let deadline = tokio::time::sleep(self.config.server.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    let remaining = lock(&self.sessions).len();
                    if remaining == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn lock(
    sessions: &SessionMap,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ConnectionSession>>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}
