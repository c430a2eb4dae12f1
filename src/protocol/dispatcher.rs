use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake;
use crate::protocol::message::{Message, MessageType};
use crate::transfer::manager::TransferManager;
use crate::transport::session::ConnectionSession;
use crate::utils::metrics::global_metrics;

type HandlerFn =
    dyn Fn(Arc<ConnectionSession>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

/// Routes decoded messages to one async handler per message type.
///
/// Handlers run on the connection's read loop, so frames of one connection are
/// handled strictly in receipt order. Long work belongs in a spawned task.
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageType, Arc<HandlerFn>>>,
    transfers: Option<Arc<TransferManager>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with the handshake and heartbeat handlers only.
    pub fn new() -> Self {
        let dispatcher = Self {
            handlers: RwLock::new(HashMap::new()),
            transfers: None,
        };
        dispatcher.install_session_handlers();
        dispatcher
    }

    /// Dispatcher that also routes transfer traffic to `manager`.
    pub fn with_transfers(manager: Arc<TransferManager>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.transfers = Some(Arc::clone(&manager));

        let admit_manager = Arc::clone(&manager);
        dispatcher.insert(MessageType::ApplyTransfer, move |session, message| {
            let manager = Arc::clone(&admit_manager);
            async move {
                let Message::ApplyTransfer(apply) = message else {
                    return Err(ProtocolError::UnexpectedMessage);
                };
                if let Err(e) = handshake::verify_token(&session, &apply.token) {
                    global_metrics().unauthorized_request();
                    warn!(
                        session = %session.id(),
                        transfer_id = apply.transfer_id,
                        file = %apply.file_name,
                        "Dropping transfer request with bad token"
                    );
                    return Err(e);
                }
                manager.admit(&session, apply).await
            }
        });

        for kind in [
            MessageType::TransferAccept,
            MessageType::SegmentData,
            MessageType::SegmentAck,
            MessageType::TransferComplete,
            MessageType::TransferFailed,
        ] {
            let manager = Arc::clone(&manager);
            dispatcher.insert(kind, move |session, message| {
                let manager = Arc::clone(&manager);
                async move { manager.route(&session, message).await }
            });
        }

        dispatcher
    }

    fn install_session_handlers(&self) {
        self.insert(MessageType::ConnectionRequest, |session, message| async move {
            let Message::ConnectionRequest { label } = message else {
                return Err(ProtocolError::UnexpectedMessage);
            };
            let ack = handshake::server_handle_connection_request(&session, &label)?;
            session.send(ack).await
        });

        self.insert(MessageType::ConnectionAck, |session, message| async move {
            let Message::ConnectionAck { session_token } = message else {
                return Err(ProtocolError::UnexpectedMessage);
            };
            handshake::client_handle_connection_ack(&session, session_token)
        });

        // Arrival already refreshed the idle timer
        self.insert(MessageType::Heartbeat, |_, _| async { Ok(()) });
    }

    fn insert<F, Fut>(&self, kind: MessageType, handler: F)
    where
        F: Fn(Arc<ConnectionSession>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> = Arc::new(move |session, message| handler(session, message).boxed());
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(kind, boxed);
    }

    /// Register or replace the handler for `kind`.
    pub fn register<F, Fut>(&self, kind: MessageType, handler: F) -> Result<()>
    where
        F: Fn(Arc<ConnectionSession>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.handlers.is_poisoned() {
            return Err(ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()));
        }
        self.insert(kind, handler);
        Ok(())
    }

    pub fn has_handler(&self, kind: MessageType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&kind)
    }

    pub fn transfers(&self) -> Option<&Arc<TransferManager>> {
        self.transfers.as_ref()
    }

    /// Run the handler for `message`. A type with no handler is logged and
    /// dropped; the connection is never torn down for it.
    pub async fn dispatch(&self, session: &Arc<ConnectionSession>, message: Message) -> Result<()> {
        let kind = message.message_type();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&kind)
            .cloned();

        match handler {
            Some(handler) => {
                debug!(session = %session.id(), message = kind.name(), "Dispatching");
                handler(Arc::clone(session), message).await
            }
            None => {
                global_metrics().unhandled_message();
                warn!(session = %session.id(), message = kind.name(), "No handler, message discarded");
                Ok(())
            }
        }
    }

    /// Called once by the read loop after the connection has gone down.
    pub fn connection_closed(&self, session: &ConnectionSession) {
        if let Some(manager) = &self.transfers {
            manager.connection_closed(session.id());
        }
    }
}
