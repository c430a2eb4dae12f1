//! Transfer records and their lifecycle.
//!
//! ```text
//! Pending ──> Transferring ──> Completed
//!    │              │
//!    └──────────────┴────────> Failed
//! ```
//! Completed and Failed are terminal. Resuming a failed transfer creates a new
//! record that inherits the cursor; the failed one is left as history.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::segment::{bytes_through, segment_count};
use crate::error::{ProtocolError, Result};
use crate::transfer::hasher::ContentHash;
use crate::utils::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (TransferStatus::Pending, TransferStatus::Transferring)
                | (TransferStatus::Pending, TransferStatus::Failed)
                | (TransferStatus::Transferring, TransferStatus::Completed)
                | (TransferStatus::Transferring, TransferStatus::Failed)
        )
    }
}

/// Where a transfer is in the manager's state machine.
///
/// Finer-grained than [`TransferStatus`]: the sender distinguishes a request
/// that is still waiting for the peer from one the peer has accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Requested,
    Admitted,
    Transferring,
    Completed,
    Failed,
}

impl TransferPhase {
    pub fn status(self) -> TransferStatus {
        match self {
            TransferPhase::Requested | TransferPhase::Admitted => TransferStatus::Pending,
            TransferPhase::Transferring => TransferStatus::Transferring,
            TransferPhase::Completed => TransferStatus::Completed,
            TransferPhase::Failed => TransferStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub direction: TransferDirection,
    pub connection_id: String,
    pub transfer_id: u64,
    pub file_name: String,
    /// Source file for sends, final destination for receives
    pub path: PathBuf,
    pub file_length: u64,
    pub segment_count: u32,
    /// Highest contiguous segment index acknowledged (send) or written (receive)
    pub cursor: Option<u32>,
    pub content_hash: ContentHash,
    pub status: TransferStatus,
    pub failure: Option<String>,
    pub resumed_from: Option<String>,
    pub created_at: u64,
    pub finished_at: Option<u64>,
}

impl TransferRecord {
    pub fn new(
        direction: TransferDirection,
        connection_id: impl Into<String>,
        transfer_id: u64,
        file_name: impl Into<String>,
        path: PathBuf,
        file_length: u64,
        content_hash: ContentHash,
    ) -> Self {
        Self {
            id: new_record_id(),
            direction,
            connection_id: connection_id.into(),
            transfer_id,
            file_name: file_name.into(),
            path,
            file_length,
            segment_count: segment_count(file_length),
            cursor: None,
            content_hash,
            status: TransferStatus::Pending,
            failure: None,
            resumed_from: None,
            created_at: now_millis(),
            finished_at: None,
        }
    }

    /// Fresh Pending record continuing this one from its cursor.
    pub fn resumed(&self, connection_id: impl Into<String>, transfer_id: u64) -> Self {
        Self {
            id: new_record_id(),
            connection_id: connection_id.into(),
            transfer_id,
            status: TransferStatus::Pending,
            failure: None,
            resumed_from: Some(self.id.clone()),
            created_at: now_millis(),
            finished_at: None,
            ..self.clone()
        }
    }

    /// First segment index not yet covered by the cursor.
    pub fn next_index(&self) -> u32 {
        self.cursor.map_or(0, |c| c + 1)
    }

    /// Bytes covered by the cursor.
    pub fn bytes_transferred(&self) -> u64 {
        bytes_through(self.file_length, self.next_index())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, next: TransferStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now_millis());
        }
        Ok(())
    }

    /// Move to Failed with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TransferStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Record that segment `index` is done. Only the next contiguous index
    /// advances the cursor.
    pub fn advance(&mut self, index: u32) -> bool {
        if index != self.next_index() || index >= self.segment_count {
            return false;
        }
        self.cursor = Some(index);
        true
    }
}

fn new_record_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
