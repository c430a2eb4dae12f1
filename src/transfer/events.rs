//! Transfer lifecycle notifications.
//!
//! The manager publishes these on a broadcast channel; presentation code and
//! record viewers subscribe. Slow subscribers lag and miss events rather than
//! stalling a transfer.

use crate::transfer::record::TransferRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started(TransferRecord),
    ProgressUpdated {
        record_id: String,
        segment_index: u32,
        bytes_transferred: u64,
    },
    Completed(TransferRecord),
    Failed {
        record: TransferRecord,
        reason: String,
    },
}

impl TransferEvent {
    pub fn record_id(&self) -> &str {
        match self {
            TransferEvent::Started(record) | TransferEvent::Completed(record) => &record.id,
            TransferEvent::ProgressUpdated { record_id, .. } => record_id,
            TransferEvent::Failed { record, .. } => &record.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed(_) | TransferEvent::Failed { .. }
        )
    }
}
