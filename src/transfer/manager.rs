//! Transfer Session Manager.
//!
//! Owns every active transfer on every connection. Outgoing transfers run on
//! the caller's task ([`TransferManager::send_file`]); incoming transfers are
//! admitted from the dispatcher and run on a spawned task each. Messages for a
//! transfer reach it through a bounded per-transfer queue keyed by
//! `(connection id, transfer id)`, which pushes back on the connection's read
//! loop when a transfer falls behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::TransferConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ApplyTransfer, Message};
use crate::transfer::events::TransferEvent;
use crate::transfer::hasher::{hash_file, ContentHash, ContentHasher};
use crate::transfer::record::{TransferDirection, TransferPhase, TransferRecord, TransferStatus};
use crate::transfer::store::{self, RecordStore};
use crate::transfer::{receiver, sender};
use crate::transport::session::ConnectionSession;
use crate::utils::metrics::global_metrics;

const EVENT_CAPACITY: usize = 256;

/// Identifies one transfer on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub connection_id: String,
    pub transfer_id: u64,
}

impl TransferKey {
    pub fn new(connection_id: impl Into<String>, transfer_id: u64) -> Self {
        Self {
            connection_id: connection_id.into(),
            transfer_id,
        }
    }
}

struct ActiveTransfer {
    inbox: mpsc::Sender<Message>,
    /// Part file being written, for receives
    part_path: Option<PathBuf>,
}

pub struct TransferManager {
    config: TransferConfig,
    store: Arc<dyn RecordStore>,
    hasher: Arc<dyn ContentHasher>,
    events: broadcast::Sender<TransferEvent>,
    active: Mutex<HashMap<TransferKey, ActiveTransfer>>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn RecordStore>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            hasher,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub(crate) fn hasher(&self) -> Arc<dyn ContentHasher> {
        Arc::clone(&self.hasher)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Finished transfers, most recent first.
    pub fn history(&self) -> Result<Vec<TransferRecord>> {
        store::history(self.store.as_ref())
    }

    /// Transfers persisted mid-flight.
    pub fn resume_candidates(&self) -> Result<Vec<TransferRecord>> {
        store::resume_candidates(self.store.as_ref())
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    pub fn is_active(&self, key: &TransferKey) -> bool {
        self.active().contains_key(key)
    }

    /// Send a file to the peer behind `session` and drive it to a terminal
    /// state. Returns the final record when the receiver confirmed the hash.
    #[instrument(skip(self, session, path), fields(session = %session.id(), path = %path.as_ref().display()))]
    pub async fn send_file(
        &self,
        session: &Arc<ConnectionSession>,
        path: impl AsRef<Path>,
    ) -> Result<TransferRecord> {
        let path = path.as_ref().to_path_buf();
        let token = session.token().ok_or(ProtocolError::NotConnected)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProtocolError::InvalidRequest(constants::ERR_EMPTY_FILE_NAME.into()))?
            .to_string();

        let source = async {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| ProtocolError::local_io(&format!("stat {}", path.display()), e))?;
            if !metadata.is_file() {
                return Err(ProtocolError::LocalIo(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
            let hash = hash_file(self.hasher(), path.clone()).await?;
            Ok((metadata.len(), hash))
        };

        let (file_length, content_hash) = match source.await {
            Ok(found) => found,
            Err(e) => {
                // Unreadable source: fail locally, the peer never hears of it
                let mut record = TransferRecord::new(
                    TransferDirection::Send,
                    session.id(),
                    rand::random(),
                    file_name,
                    path,
                    0,
                    ContentHash::default(),
                );
                self.store.create(&record)?;
                self.fail_record(&mut record, &e);
                return Err(e);
            }
        };

        let record = TransferRecord::new(
            TransferDirection::Send,
            session.id(),
            rand::random(),
            file_name,
            path,
            file_length,
            content_hash,
        );
        self.store.create(&record)?;
        info!(
            record = %record.id,
            transfer_id = record.transfer_id,
            bytes = file_length,
            segments = record.segment_count,
            "Transfer requested"
        );

        sender::run(self, session, record, token).await
    }

    /// Continue a failed send from its persisted cursor as a fresh transfer.
    ///
    /// The source must still hash to the recorded digest. The old record stays
    /// in history; the returned record links back to it.
    #[instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn resume_send(
        &self,
        session: &Arc<ConnectionSession>,
        record_id: &str,
    ) -> Result<TransferRecord> {
        let mut previous = self
            .store
            .find(record_id)?
            .ok_or_else(|| ProtocolError::RecordNotFound(record_id.to_string()))?;

        if previous.direction != TransferDirection::Send {
            return Err(ProtocolError::InvalidRequest(
                "Only sends can be resumed by the sender".into(),
            ));
        }
        match previous.status {
            TransferStatus::Failed => {}
            TransferStatus::Transferring
                if !self.is_active(&TransferKey::new(
                    previous.connection_id.clone(),
                    previous.transfer_id,
                )) => {}
            status => {
                return Err(ProtocolError::InvalidRequest(format!(
                    "Record {record_id} is {status:?} and cannot be resumed"
                )))
            }
        }

        let token = session.token().ok_or(ProtocolError::NotConnected)?;
        let current = hash_file(self.hasher(), previous.path.clone()).await?;
        let length = tokio::fs::metadata(&previous.path)
            .await
            .map_err(|e| ProtocolError::local_io("stat source", e))?
            .len();
        if current != previous.content_hash || length != previous.file_length {
            return Err(ProtocolError::InvalidRequest(
                constants::ERR_SOURCE_CHANGED.into(),
            ));
        }

        if previous.status == TransferStatus::Transferring {
            previous.fail("Superseded by resume")?;
            self.store.update(&previous)?;
        }

        let record = previous.resumed(session.id(), rand::random());
        self.store.create(&record)?;
        info!(
            record = %record.id,
            resumed_from = %previous.id,
            start = record.next_index(),
            "Resuming transfer"
        );

        sender::run(self, session, record, token).await
    }

    /// Admit an authorized `ApplyTransfer` from the peer.
    pub async fn admit(
        self: &Arc<Self>,
        session: &Arc<ConnectionSession>,
        apply: ApplyTransfer,
    ) -> Result<()> {
        receiver::admit(self, session, apply).await
    }

    /// Forward a transfer message to the transfer it belongs to.
    pub async fn route(&self, session: &ConnectionSession, message: Message) -> Result<()> {
        let transfer_id = message
            .transfer_id()
            .ok_or(ProtocolError::UnexpectedMessage)?;
        let key = TransferKey::new(session.id(), transfer_id);

        let inbox = self.active().get(&key).map(|t| t.inbox.clone());
        let Some(inbox) = inbox else {
            debug!(session = %session.id(), transfer_id, message = message.message_type().name(), "No active transfer");
            return Err(ProtocolError::UnknownTransfer(transfer_id));
        };

        inbox
            .send(message)
            .await
            .map_err(|_| ProtocolError::UnknownTransfer(transfer_id))
    }

    /// Drop every queue for the connection. Their transfers observe a closed
    /// inbox and fail with their cursor persisted.
    pub fn connection_closed(&self, connection_id: &str) {
        let mut active = self.active();
        let before = active.len();
        active.retain(|key, _| key.connection_id != connection_id);
        let dropped = before - active.len();
        if dropped > 0 {
            warn!(session = connection_id, transfers = dropped, "Connection lost with active transfers");
        }
    }

    pub(crate) fn register(
        &self,
        key: TransferKey,
        part_path: Option<PathBuf>,
    ) -> Result<mpsc::Receiver<Message>> {
        let mut active = self.active();
        if active.contains_key(&key) {
            return Err(ProtocolError::InvalidRequest(
                constants::ERR_DUPLICATE_TRANSFER.into(),
            ));
        }
        if let Some(part) = &part_path {
            if active.values().any(|t| t.part_path.as_ref() == Some(part)) {
                return Err(ProtocolError::InvalidRequest(format!(
                    "{} is already being received",
                    part.display()
                )));
            }
        }
        let (inbox, rx) = mpsc::channel(self.config.queue_depth.max(1));
        active.insert(key, ActiveTransfer { inbox, part_path });
        Ok(rx)
    }

    pub(crate) fn unregister(&self, key: &TransferKey) {
        self.active().remove(key);
    }

    pub(crate) fn persist(&self, record: &TransferRecord) -> Result<()> {
        self.store.update(record)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn started(&self, record: &TransferRecord) {
        global_metrics().transfer_started();
        self.emit(TransferEvent::Started(record.clone()));
    }

    pub(crate) fn progress(&self, record: &TransferRecord, segment_index: u32) {
        self.emit(TransferEvent::ProgressUpdated {
            record_id: record.id.clone(),
            segment_index,
            bytes_transferred: record.bytes_transferred(),
        });
    }

    pub(crate) fn complete_record(&self, record: &mut TransferRecord) -> Result<()> {
        record.transition(TransferStatus::Completed)?;
        self.persist(record)?;
        global_metrics().transfer_completed();
        info!(
            record = %record.id,
            transfer_id = record.transfer_id,
            file = %record.file_name,
            "Transfer completed"
        );
        self.emit(TransferEvent::Completed(record.clone()));
        Ok(())
    }

    /// Move the record to Failed, persist it and notify observers.
    pub(crate) fn fail_record(&self, record: &mut TransferRecord, cause: &ProtocolError) {
        let reason = cause.to_string();
        if !record.is_terminal() {
            if let Err(e) = record.fail(reason.clone()) {
                error!(record = %record.id, error = %e, "Cannot mark transfer failed");
            }
        }
        if let Err(e) = self.persist(record) {
            error!(record = %record.id, error = %e, "Cannot persist failed transfer");
        }
        global_metrics().transfer_failed();
        warn!(
            record = %record.id,
            transfer_id = record.transfer_id,
            cursor = ?record.cursor,
            %reason,
            "Transfer failed"
        );
        self.emit(TransferEvent::Failed {
            record: record.clone(),
            reason,
        });
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TransferKey, ActiveTransfer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Move the record's status along with the state machine phase.
pub(crate) fn enter_phase(record: &mut TransferRecord, phase: TransferPhase) -> Result<()> {
    let status = phase.status();
    if record.status != status {
        record.transition(status)?;
    }
    debug!(record = %record.id, transfer_id = record.transfer_id, ?phase, "Transfer phase");
    Ok(())
}

/// Whether the peer should be told about a local failure.
pub(crate) fn should_notify_peer(cause: &ProtocolError) -> bool {
    !matches!(
        cause,
        ProtocolError::PeerFailure(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::NotConnected
            | ProtocolError::Io(_)
    )
}
