//! Sending half of a transfer.
//!
//! Stop-and-wait: one `SegmentData` in flight, the next segment is read only
//! after the matching `SegmentAck`. The cursor is persisted after every ack.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::core::segment::{segment_offset, segments_from};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{ApplyTransfer, Message};
use crate::transfer::manager::{enter_phase, should_notify_peer, TransferKey, TransferManager};
use crate::transfer::record::{TransferPhase, TransferRecord};
use crate::transport::session::ConnectionSession;
use crate::utils::metrics::global_metrics;

struct SendTask<'a> {
    manager: &'a TransferManager,
    session: &'a Arc<ConnectionSession>,
    record: TransferRecord,
    inbox: mpsc::Receiver<Message>,
    timeout: Duration,
    /// Whether the peer has seen the ApplyTransfer
    announced: bool,
}

/// Drive a Pending send record to a terminal state.
#[instrument(skip_all, fields(session = %session.id(), transfer_id = record.transfer_id, record = %record.id))]
pub(crate) async fn run(
    manager: &TransferManager,
    session: &Arc<ConnectionSession>,
    record: TransferRecord,
    token: String,
) -> Result<TransferRecord> {
    let key = TransferKey::new(session.id(), record.transfer_id);
    let inbox = match manager.register(key.clone(), None) {
        Ok(inbox) => inbox,
        Err(e) => {
            let mut record = record;
            manager.fail_record(&mut record, &e);
            return Err(e);
        }
    };

    let mut task = SendTask {
        manager,
        session,
        record,
        inbox,
        timeout: manager.config().response_timeout,
        announced: false,
    };
    let result = task.drive(token).await;
    manager.unregister(&key);

    let SendTask {
        mut record,
        announced,
        ..
    } = task;

    match result.and_then(|()| manager.complete_record(&mut record)) {
        Ok(()) => Ok(record),
        Err(e) => {
            if announced && should_notify_peer(&e) {
                let notice = Message::TransferFailed {
                    transfer_id: record.transfer_id,
                    reason: e.to_string(),
                };
                if let Err(send_err) = session.send(notice).await {
                    debug!(error = %send_err, "Could not notify peer of failure");
                }
            }
            manager.fail_record(&mut record, &e);
            Err(e)
        }
    }
}

impl SendTask<'_> {
    async fn drive(&mut self, token: String) -> Result<()> {
        let requested_start = self.record.next_index();
        let apply = ApplyTransfer {
            transfer_id: self.record.transfer_id,
            file_name: self.record.file_name.clone(),
            file_length: self.record.file_length,
            segment_count: self.record.segment_count,
            start_index: requested_start,
            content_hash: self.record.content_hash,
            token,
        };

        enter_phase(&mut self.record, TransferPhase::Requested)?;
        self.manager.started(&self.record);
        self.session.send(Message::ApplyTransfer(apply)).await?;
        self.announced = true;

        let start = match self.next().await? {
            Message::TransferAccept { start_index, .. } => start_index,
            Message::TransferFailed { reason, .. } => return Err(ProtocolError::PeerFailure(reason)),
            _ => return Err(ProtocolError::UnexpectedMessage),
        };
        // The receiver may rewind but never skip ahead
        if start > requested_start {
            return Err(ProtocolError::InvalidRequest(format!(
                "Peer accepted from segment {start}, requested {requested_start}"
            )));
        }
        enter_phase(&mut self.record, TransferPhase::Admitted)?;
        debug!(start, requested_start, "Transfer admitted");

        self.record.cursor = start.checked_sub(1);
        enter_phase(&mut self.record, TransferPhase::Transferring)?;
        self.manager.persist(&self.record)?;

        let path = self.record.path.clone();
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ProtocolError::local_io(&format!("open {}", path.display()), e))?;
        file.seek(SeekFrom::Start(segment_offset(start)))
            .await
            .map_err(|e| ProtocolError::local_io("seek source", e))?;

        for segment in segments_from(self.record.file_length, start) {
            let mut payload = vec![0u8; segment.len];
            file.read_exact(&mut payload)
                .await
                .map_err(|e| ProtocolError::local_io(&format!("read segment {}", segment.index), e))?;

            self.session
                .send(Message::SegmentData {
                    transfer_id: self.record.transfer_id,
                    index: segment.index,
                    payload: Bytes::from(payload),
                })
                .await?;
            global_metrics().segment_sent();

            match self.next().await? {
                Message::SegmentAck { index, .. } if index == segment.index => {}
                Message::SegmentAck { index, .. } => {
                    return Err(ProtocolError::OutOfOrderSegment {
                        expected: segment.index,
                        received: index,
                    })
                }
                Message::TransferFailed { reason, .. } => {
                    return Err(ProtocolError::PeerFailure(reason))
                }
                _ => return Err(ProtocolError::UnexpectedMessage),
            }

            self.record.advance(segment.index);
            self.manager.persist(&self.record)?;
            self.manager.progress(&self.record, segment.index);
        }

        // Verification time grows with the file, so no per-message deadline
        // here. A dead peer still ends the wait through the idle timeout.
        match self.verdict().await? {
            Message::TransferComplete { .. } => Ok(()),
            Message::TransferFailed { reason, .. } => Err(ProtocolError::PeerFailure(reason)),
            other => {
                warn!(message = other.message_type().name(), "Unexpected message awaiting verdict");
                Err(ProtocolError::UnexpectedMessage)
            }
        }
    }

    async fn next(&mut self) -> Result<Message> {
        next_message(&mut self.inbox, self.timeout).await
    }

    /// Wait for the receiver's verdict until the connection goes away.
    async fn verdict(&mut self) -> Result<Message> {
        self.inbox.recv().await.ok_or(ProtocolError::ConnectionClosed)
    }
}

/// Next message for a transfer. A closed inbox means the connection is gone.
pub(crate) async fn next_message(
    inbox: &mut mpsc::Receiver<Message>,
    timeout: Duration,
) -> Result<Message> {
    match tokio::time::timeout(timeout, inbox.recv()).await {
        Err(_) => Err(ProtocolError::Timeout),
        Ok(None) => Err(ProtocolError::ConnectionClosed),
        Ok(Some(message)) => Ok(message),
    }
}
