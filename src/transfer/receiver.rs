//! Receiving half of a transfer.
//!
//! Segments are written to `<download_dir>/<name>.part` at
//! `index * CHUNK_SIZE`. The part file is promoted to its final name only
//! after the recomputed hash matches the one declared in the request.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::core::segment::{bytes_through, segment_count, segment_len, segment_offset};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ApplyTransfer, Message};
use crate::transfer::hasher::hash_file;
use crate::transfer::manager::{enter_phase, should_notify_peer, TransferKey, TransferManager};
use crate::transfer::record::{TransferDirection, TransferPhase, TransferRecord, TransferStatus};
use crate::transfer::sender::next_message;
use crate::transport::session::ConnectionSession;
use crate::utils::metrics::global_metrics;

/// Validate a request, pick the start index and spawn the receive task.
#[instrument(skip_all, fields(session = %session.id(), transfer_id = apply.transfer_id))]
pub(crate) async fn admit(
    manager: &Arc<TransferManager>,
    session: &Arc<ConnectionSession>,
    apply: ApplyTransfer,
) -> Result<()> {
    let transfer_id = apply.transfer_id;
    let key = TransferKey::new(session.id(), transfer_id);
    if manager.is_active(&key) {
        return Err(ProtocolError::InvalidRequest(
            constants::ERR_DUPLICATE_TRANSFER.into(),
        ));
    }

    let checked = sanitize_file_name(&apply.file_name)
        .ok_or_else(|| ProtocolError::InvalidRequest(constants::ERR_EMPTY_FILE_NAME.into()))
        .and_then(|name| {
            if apply.segment_count == segment_count(apply.file_length) {
                Ok(name)
            } else {
                Err(ProtocolError::InvalidRequest(constants::ERR_SEGMENT_COUNT.into()))
            }
        });
    let file_name = match checked {
        Ok(name) => name,
        Err(e) => {
            warn!(file = %apply.file_name, error = %e, "Rejecting transfer request");
            reject(session, transfer_id, &e).await;
            return Err(e);
        }
    };

    let download_dir = manager.config().download_dir.clone();
    let part_path = download_dir.join(format!("{file_name}.part"));
    let previous = previous_attempt(manager, &file_name, &apply, &part_path).await?;
    let stored_next = previous.as_ref().map_or(0, TransferRecord::next_index);
    let start = apply.start_index.min(stored_next);

    let mut record = match &previous {
        Some(prev) => {
            let mut record = prev.resumed(session.id(), transfer_id);
            record.path = download_dir.join(&file_name);
            record
        }
        None => TransferRecord::new(
            TransferDirection::Receive,
            session.id(),
            transfer_id,
            file_name.clone(),
            download_dir.join(&file_name),
            apply.file_length,
            apply.content_hash,
        ),
    };
    record.cursor = start.checked_sub(1);

    let inbox = match manager.register(key.clone(), Some(part_path.clone())) {
        Ok(inbox) => inbox,
        Err(e) => {
            reject(session, transfer_id, &e).await;
            return Err(e);
        }
    };

    let created = supersede(manager, previous).and_then(|()| manager.store().create(&record));
    if let Err(e) = created {
        warn!(record = %record.id, error = %e, "Could not record transfer");
        manager.unregister(&key);
        reject(session, transfer_id, &e).await;
        return Err(e);
    }
    enter_phase(&mut record, TransferPhase::Admitted)?;

    let keep = bytes_through(apply.file_length, start);
    if let Err(e) = open_part_file(&download_dir, &part_path, keep).await {
        manager.unregister(&key);
        reject(session, transfer_id, &e).await;
        manager.fail_record(&mut record, &e);
        return Err(e);
    }

    enter_phase(&mut record, TransferPhase::Transferring)?;
    manager.persist(&record)?;
    info!(
        record = %record.id,
        file = %record.file_name,
        bytes = record.file_length,
        start,
        requested_start = apply.start_index,
        "Receiving transfer"
    );
    manager.started(&record);

    // Accept goes out before the task can produce a verdict
    let accept = Message::TransferAccept {
        transfer_id,
        start_index: start,
    };
    if let Err(e) = session.send(accept).await {
        manager.unregister(&key);
        manager.fail_record(&mut record, &e);
        return Err(e);
    }

    let task = ReceiveTask {
        manager: Arc::clone(manager),
        session: Arc::clone(session),
        record,
        part_path,
        inbox,
    };
    tokio::spawn(task.run(key).in_current_span());
    Ok(())
}

struct ReceiveTask {
    manager: Arc<TransferManager>,
    session: Arc<ConnectionSession>,
    record: TransferRecord,
    part_path: PathBuf,
    inbox: mpsc::Receiver<Message>,
}

impl ReceiveTask {
    async fn run(mut self, key: TransferKey) {
        let result = self.receive_and_verify().await;
        self.manager.unregister(&key);

        let transfer_id = self.record.transfer_id;
        match result {
            Ok(final_path) => {
                self.record.path = final_path;
                match self.manager.complete_record(&mut self.record) {
                    Ok(()) => {
                        if let Err(e) = self.session.send(Message::TransferComplete { transfer_id }).await {
                            warn!(error = %e, "Could not confirm completion to sender");
                        }
                    }
                    Err(e) => self.fail(&e).await,
                }
            }
            Err(e) => self.fail(&e).await,
        }
    }

    async fn fail(&mut self, cause: &ProtocolError) {
        if should_notify_peer(cause) {
            reject(&self.session, self.record.transfer_id, cause).await;
        }
        self.manager.fail_record(&mut self.record, cause);
    }

    async fn receive_and_verify(&mut self) -> Result<PathBuf> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await
            .map_err(|e| ProtocolError::local_io("open part file", e))?;
        let timeout = self.manager.config().response_timeout;

        while self.record.next_index() < self.record.segment_count {
            let expected = self.record.next_index();
            match next_message(&mut self.inbox, timeout).await? {
                Message::SegmentData { index, payload, .. } => {
                    if index != expected {
                        return Err(ProtocolError::OutOfOrderSegment {
                            expected,
                            received: index,
                        });
                    }
                    let want = segment_len(self.record.file_length, index).unwrap_or(0);
                    if payload.len() != want {
                        return Err(ProtocolError::InvalidRequest(format!(
                            "Segment {index} carries {} bytes, expected {want}",
                            payload.len()
                        )));
                    }

                    write_segment(&mut file, index, &payload).await?;
                    self.record.advance(index);
                    self.manager.persist(&self.record)?;
                    global_metrics().segment_received();
                    self.manager.progress(&self.record, index);

                    self.session
                        .send(Message::SegmentAck {
                            transfer_id: self.record.transfer_id,
                            index,
                        })
                        .await?;
                }
                Message::TransferFailed { reason, .. } => {
                    return Err(ProtocolError::PeerFailure(reason))
                }
                other => {
                    debug!(message = other.message_type().name(), "Unexpected message for receive");
                    return Err(ProtocolError::UnexpectedMessage);
                }
            }
        }

        file.sync_all()
            .await
            .map_err(|e| ProtocolError::local_io("sync part file", e))?;
        drop(file);

        self.verify().await?;
        self.promote().await
    }

    async fn verify(&mut self) -> Result<()> {
        let actual = hash_file(self.manager.hasher(), self.part_path.clone()).await?;
        if actual == self.record.content_hash {
            return Ok(());
        }

        global_metrics().checksum_failure();
        // The bytes cannot be trusted for a resume either
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            warn!(error = %e, "Could not remove corrupt part file");
        }
        self.record.cursor = None;
        Err(ProtocolError::ChecksumMismatch {
            expected: self.record.content_hash.to_hex(),
            actual: actual.to_hex(),
        })
    }

    async fn promote(&self) -> Result<PathBuf> {
        let dir = self
            .part_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let destination = unique_destination(&dir, &self.record.file_name).await?;
        tokio::fs::rename(&self.part_path, &destination)
            .await
            .map_err(|e| ProtocolError::local_io(&format!("rename to {}", destination.display()), e))?;
        Ok(destination)
    }
}

async fn write_segment(file: &mut File, index: u32, payload: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(segment_offset(index)))
        .await
        .map_err(|e| ProtocolError::local_io("seek part file", e))?;
    file.write_all(payload)
        .await
        .map_err(|e| ProtocolError::local_io(&format!("write segment {index}"), e))?;
    file.flush()
        .await
        .map_err(|e| ProtocolError::local_io("flush part file", e))
}

/// Tell the sender this transfer is over. Best effort.
async fn reject(session: &ConnectionSession, transfer_id: u64, cause: &ProtocolError) {
    let notice = Message::TransferFailed {
        transfer_id,
        reason: cause.to_string(),
    };
    if let Err(e) = session.send(notice).await {
        debug!(transfer_id, error = %e, "Could not send transfer failure");
    }
}

/// Retire an attempt that was still marked as moving.
fn supersede(manager: &TransferManager, previous: Option<TransferRecord>) -> Result<()> {
    match previous {
        Some(mut prev) if prev.status == TransferStatus::Transferring => {
            prev.fail("Superseded by resume")?;
            manager.persist(&prev)
        }
        _ => Ok(()),
    }
}

/// Most recent unfinished receive of the same content whose part file still
/// holds everything its cursor claims.
async fn previous_attempt(
    manager: &TransferManager,
    file_name: &str,
    apply: &ApplyTransfer,
    part_path: &Path,
) -> Result<Option<TransferRecord>> {
    let candidate = manager
        .store()
        .query(&|r| {
            r.direction == TransferDirection::Receive
                && matches!(r.status, TransferStatus::Failed | TransferStatus::Transferring)
                && r.file_name == file_name
                && r.file_length == apply.file_length
                && r.content_hash == apply.content_hash
        })?
        .into_iter()
        .max_by_key(|r| r.created_at);

    let Some(candidate) = candidate else {
        return Ok(None);
    };
    let stored = match tokio::fs::metadata(part_path).await {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(None),
    };
    if stored < candidate.bytes_transferred() {
        debug!(
            record = %candidate.id,
            stored,
            claimed = candidate.bytes_transferred(),
            "Part file shorter than cursor, starting over"
        );
        return Ok(None);
    }
    Ok(Some(candidate))
}

async fn open_part_file(dir: &Path, part_path: &Path, keep: u64) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ProtocolError::local_io(&format!("create {}", dir.display()), e))?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(part_path)
        .await
        .map_err(|e| ProtocolError::local_io(&format!("open {}", part_path.display()), e))?;
    // Anything past the resume point is rewritten
    file.set_len(keep)
        .await
        .map_err(|e| ProtocolError::local_io("truncate part file", e))
}

/// Last path component of a peer-supplied name, or `None` if nothing usable
/// remains.
pub(crate) fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .replace('\0', "");
    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// `dir/name`, or `dir/stem (n).ext` if that is taken.
async fn unique_destination(dir: &Path, name: &str) -> Result<PathBuf> {
    let first = dir.join(name);
    if !exists(&first).await? {
        return Ok(first);
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1u32.. {
        let candidate = dir.join(format!("{stem} ({n}){extension}"));
        if !exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(ProtocolError::LocalIo(format!("No free name for {name}")))
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| ProtocolError::local_io(&format!("stat {}", path.display()), e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("   "), None);
    }

    #[tokio::test]
    async fn test_unique_destination_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            unique_destination(dir.path(), "a.txt").await.unwrap(),
            dir.path().join("a.txt")
        );

        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "a.txt").await.unwrap(),
            dir.path().join("a (2).txt")
        );

        std::fs::write(dir.path().join("noext"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "noext").await.unwrap(),
            dir.path().join("noext (1)")
        );
    }

    #[tokio::test]
    async fn test_open_part_file_truncates_to_resume_point() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("nested").join("f.bin.part");
        open_part_file(part.parent().unwrap(), &part, 0).await.unwrap();
        std::fs::write(&part, vec![1u8; 10_000]).unwrap();

        open_part_file(part.parent().unwrap(), &part, 8192).await.unwrap();
        assert_eq!(std::fs::metadata(&part).unwrap().len(), 8192);
    }
}
