//! Connection sessions.
//!
//! A [`ConnectionSession`] owns one TCP connection to a peer. It either dials
//! out ([`SessionRole::Client`]) or wraps a socket handed over by the server
//! ([`SessionRole::Server`]). Once attached, two tasks run per connection:
//!
//! - the **reader** drives `FramedRead<_, FrameCodec>` (the reassembly
//!   buffer), dispatches every decoded message in receipt order and watches
//!   for idleness;
//! - the **writer** drains a bounded outbound queue into `FramedWrite` and
//!   emits heartbeats.
//!
//! Whichever side notices the connection is gone first tears it down. The
//! token is cleared and [`ConnectionEvent::Disconnected`] is published exactly
//! once per attachment. Every attachment carries a generation number, so a
//! reader or writer left over from a closed connection can never tear down
//! the one that replaced it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::codec::FrameCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake;
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout_error;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Dials the peer and sends the connection request
    Client,
    /// Accepted by a listener; issues the session token
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-connection notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    StatusChanged(String),
}

/// Timing and sizing knobs resolved from the config for one role.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub max_frame_size: usize,
    pub queue_depth: usize,
    pub tcp_nodelay: bool,
}

impl SessionOptions {
    pub fn for_client(config: &NetworkConfig) -> Self {
        Self {
            connect_timeout: config.client.connection_timeout,
            send_timeout: config.client.operation_timeout,
            idle_timeout: config.client.idle_timeout,
            heartbeat_interval: config.client.heartbeat_interval,
            connect_attempts: config.client.connect_attempts.max(1),
            retry_delay: config.client.retry_delay,
            max_frame_size: config.transport.max_frame_size,
            queue_depth: config.client.backpressure_limit.max(1),
            tcp_nodelay: config.transport.tcp_nodelay,
        }
    }

    pub fn for_server(config: &NetworkConfig) -> Self {
        Self {
            connect_timeout: config.client.connection_timeout,
            send_timeout: config.server.send_timeout,
            idle_timeout: config.server.idle_timeout,
            heartbeat_interval: config.server.heartbeat_interval,
            connect_attempts: 1,
            retry_delay: Duration::ZERO,
            max_frame_size: config.transport.max_frame_size,
            queue_depth: config.server.backpressure_limit.max(1),
            tcp_nodelay: config.transport.tcp_nodelay,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    status: ConnectionStatus,
    status_text: String,
    label: String,
    last_activity: Instant,
}

/// One queued outbound frame and the caller waiting for its flush.
struct Outbound {
    message: Message,
    done: oneshot::Sender<Result<()>>,
}

/// The socket currently bound to the session.
#[derive(Default)]
struct Attachment {
    generation: u64,
    live: bool,
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<Outbound>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

pub struct ConnectionSession {
    id: String,
    address: String,
    port: u16,
    role: SessionRole,
    options: SessionOptions,
    state: RwLock<SessionState>,
    token: watch::Sender<Option<String>>,
    attachment: Mutex<Attachment>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionSession {
    fn with_options(
        id: String,
        address: String,
        port: u16,
        label: String,
        role: SessionRole,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (token, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id,
            address,
            port,
            role,
            options,
            state: RwLock::new(SessionState {
                status: ConnectionStatus::Disconnected,
                status_text: String::from("Disconnected"),
                label,
                last_activity: Instant::now(),
            }),
            token,
            attachment: Mutex::new(Attachment::default()),
            events,
        })
    }

    /// A configured peer this side will dial.
    pub fn client(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        label: impl Into<String>,
        config: &NetworkConfig,
    ) -> Arc<Self> {
        Self::with_options(
            id.into(),
            address.into(),
            port,
            label.into(),
            SessionRole::Client,
            SessionOptions::for_client(config),
        )
    }

    /// The server half of an accepted connection, keyed by peer address.
    pub fn accepted(peer: std::net::SocketAddr, config: &NetworkConfig) -> Arc<Self> {
        Self::with_options(
            peer.to_string(),
            peer.ip().to_string(),
            peer.port(),
            peer.to_string(),
            SessionRole::Server,
            SessionOptions::for_server(config),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn label(&self) -> String {
        self.read_state(|s| s.label.clone())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read_state(|s| s.status)
    }

    pub fn status_text(&self) -> String {
        self.read_state(|s| s.status_text.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Time since the last frame arrived.
    pub fn idle_for(&self) -> Duration {
        self.read_state(|s| s.last_activity.elapsed())
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connection events as a `Stream`; lagged items are skipped.
    pub fn event_stream(&self) -> impl futures::Stream<Item = ConnectionEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|e| async move { e.ok() })
    }

    /// Wait until the handshake has produced a token.
    pub async fn wait_for_token(&self, timeout: Duration) -> Result<String> {
        let mut rx = self.token.subscribe();
        with_timeout_error(
            async move {
                let token = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                token.clone().ok_or(ProtocolError::NotConnected)
            },
            timeout,
        )
        .await
    }

    pub(crate) fn set_token(&self, token: String) {
        self.token.send_replace(Some(token));
    }

    pub(crate) fn clear_token(&self) {
        self.token.send_replace(None);
    }

    pub(crate) fn set_label(&self, label: &str) {
        self.write_state(|s| s.label = label.to_string());
    }

    /// Dial the peer, attach the connection and start the handshake.
    ///
    /// Each attempt is bounded by the connect timeout; after the configured
    /// number of attempts the session is left Disconnected.
    #[instrument(skip(self, dispatcher), fields(session = %self.id, peer = %self.address, port = self.port))]
    pub async fn connect(self: &Arc<Self>, dispatcher: Arc<Dispatcher>) -> Result<()> {
        if self.role != SessionRole::Client {
            return Err(ProtocolError::InvalidRequest(
                "Only client sessions can dial".into(),
            ));
        }
        if self.is_connected() {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting, "Connecting");
        let target = format!("{}:{}", self.address, self.port);
        let attempts = self.options.connect_attempts;

        for attempt in 1..=attempts {
            let dial = async { Ok::<_, ProtocolError>(TcpStream::connect(&target).await?) };
            match with_timeout_error(dial, self.options.connect_timeout).await {
                Ok(stream) => {
                    info!(attempt, "Connected");
                    self.attach(stream, dispatcher)?;
                    if let Err(e) = self.send(handshake::client_connection_request(&self.label())).await {
                        self.close();
                        return Err(e);
                    }
                    return Ok(());
                }
                Err(e) => {
                    global_metrics().connect_failed();
                    warn!(attempt, attempts, error = %e, "Connect attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }

        self.set_status(
            ConnectionStatus::Disconnected,
            &format!("Connection failed after {attempts} attempts"),
        );
        Err(ProtocolError::ConnectionFailed {
            address: target,
            attempts,
        })
    }

    /// Take ownership of a connected socket and start its reader and writer.
    pub(crate) fn attach(self: &Arc<Self>, stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
        stream.set_nodelay(self.options.tcp_nodelay)?;
        let (read_half, write_half) = stream.into_split();
        let codec = FrameCodec::new(self.options.max_frame_size);
        let reader = FramedRead::new(read_half, codec);
        let writer = FramedWrite::new(write_half, codec);

        let (tx, rx) = mpsc::channel(self.options.queue_depth);
        let cancel = CancellationToken::new();
        let generation = {
            let mut attachment = self.attachment();
            // Whatever was attached before is finished
            attachment.cancel.cancel();
            attachment.generation += 1;
            attachment.live = true;
            attachment.cancel = cancel.clone();
            attachment.outbound = Some(tx);
            attachment.dispatcher = Some(Arc::clone(&dispatcher));
            attachment.generation
        };
        self.write_state(|s| s.last_activity = Instant::now());

        global_metrics().connection_established();
        debug!(session = %self.id, generation, "Attached connection");
        self.set_status(ConnectionStatus::Connected, "Connected");
        let _ = self.events.send(ConnectionEvent::Connected);

        tokio::spawn(write_loop(Arc::clone(self), writer, rx, cancel.clone(), generation));
        tokio::spawn(read_loop(Arc::clone(self), reader, dispatcher, cancel, generation));
        Ok(())
    }

    /// Queue a message and wait until it has been written and flushed.
    pub async fn send(&self, message: Message) -> Result<()> {
        let sender = self
            .attachment()
            .outbound
            .clone()
            .ok_or(ProtocolError::NotConnected)?;

        let (done, flushed) = oneshot::channel();
        with_timeout_error(
            async move {
                sender
                    .send(Outbound { message, done })
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                flushed.await.map_err(|_| ProtocolError::ConnectionClosed)?
            },
            self.options.send_timeout,
        )
        .await
    }

    /// Close the connection. In-flight sends fail with `ConnectionClosed`
    /// and active transfers on it fail.
    pub fn close(&self) {
        let generation = self.attachment().generation;
        self.mark_disconnected(generation, constants::ERR_CLOSED_LOCALLY);
    }

    /// Tear down attachment `generation`. Only the first caller for the
    /// current attachment has any effect; stale generations are ignored.
    pub(crate) fn mark_disconnected(&self, generation: u64, reason: &str) -> bool {
        let (cancel, dispatcher) = {
            let mut attachment = self.attachment();
            if attachment.generation != generation || !attachment.live {
                return false;
            }
            attachment.live = false;
            attachment.outbound = None;
            (attachment.cancel.clone(), attachment.dispatcher.take())
        };
        cancel.cancel();
        self.clear_token();
        global_metrics().connection_closed();

        // Transfers fail before observers can see the session as reusable
        if let Some(dispatcher) = dispatcher {
            dispatcher.connection_closed(self);
        }

        info!(session = %self.id, generation, reason, "Disconnected");
        self.set_status(ConnectionStatus::Disconnected, reason);
        let _ = self.events.send(ConnectionEvent::Disconnected);
        true
    }

    fn attachment(&self) -> MutexGuard<'_, Attachment> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.write_state(|s| s.last_activity = Instant::now());
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus, text: &str) {
        self.write_state(|s| {
            s.status = status;
            s.status_text = text.to_string();
        });
        let _ = self.events.send(ConnectionEvent::StatusChanged(text.to_string()));
    }

    fn read_state<T>(&self, f: impl FnOnce(&SessionState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_state(&self, f: impl FnOnce(&mut SessionState)) {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn write_loop(
    session: Arc<ConnectionSession>,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    generation: u64,
) {
    let period = session.options.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => {
                let Some(Outbound { message, done }) = item else { break };
                match writer.send(message).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    // Rejected by the encoder before touching the socket
                    Err(e @ ProtocolError::MalformedFrame(_)) => {
                        let _ = done.send(Err(e));
                    }
                    Err(e) => {
                        error!(session = %session.id, error = %e, "Write failed");
                        let _ = done.send(Err(ProtocolError::ConnectionClosed));
                        session.mark_disconnected(generation, constants::ERR_CONNECTION_CLOSED);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = writer.send(Message::Heartbeat).await {
                    debug!(session = %session.id, error = %e, "Heartbeat failed");
                    session.mark_disconnected(generation, constants::ERR_CONNECTION_CLOSED);
                    break;
                }
            }
        }
    }

    rx.close();
    while let Ok(Outbound { done, .. }) = rx.try_recv() {
        let _ = done.send(Err(ProtocolError::ConnectionClosed));
    }
    let _ = writer.close().await;
}

async fn read_loop(
    session: Arc<ConnectionSession>,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    generation: u64,
) {
    let idle = session.options.idle_timeout;

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break constants::ERR_CLOSED_LOCALLY,
            next = tokio::time::timeout(idle, reader.next()) => match next {
                Err(_) => {
                    warn!(session = %session.id, idle_ms = idle.as_millis() as u64, "Peer went silent");
                    break constants::ERR_CONNECTION_TIMEOUT;
                }
                Ok(None) => break constants::ERR_CLOSED_BY_PEER,
                Ok(Some(Err(ProtocolError::MalformedFrame(detail)))) => {
                    global_metrics().malformed_frame();
                    error!(session = %session.id, %detail, "Malformed frame, closing connection");
                    break constants::ERR_MALFORMED_STREAM;
                }
                Ok(Some(Err(e))) => {
                    debug!(session = %session.id, error = %e, "Read failed");
                    break constants::ERR_CONNECTION_CLOSED;
                }
                Ok(Some(Ok(message))) => {
                    session.touch();
                    let kind = message.message_type();
                    if let Err(e) = dispatcher.dispatch(&session, message).await {
                        if e.is_connection_fatal() {
                            error!(session = %session.id, message = kind.name(), error = %e, "Handler failed fatally");
                            break constants::ERR_CONNECTION_CLOSED;
                        }
                        warn!(session = %session.id, message = kind.name(), error = %e, "Message rejected");
                    }
                }
            }
        }
    };

    session.mark_disconnected(generation, reason);
}
