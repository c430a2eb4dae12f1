//! # Transfer Session Management
//!
//! Per-file state machines driving segmentation, acknowledgement, resume
//! and content verification.
//!
//! ## Components
//! - **Manager**: owns active transfers, routes their messages, publishes events
//! - **Sender / Receiver**: the two halves of one transfer
//! - **Record**: persisted transfer state and its status lifecycle
//! - **Store**: the record persistence seam plus an in-memory implementation
//! - **Hasher**: streaming content digests
//!
//! ## Flow
//! ```text
//! sender                                   receiver
//!   ApplyTransfer(start) ───────────────────>  admit, pick authoritative start
//!   <─────────────────────── TransferAccept(start)
//!   SegmentData(i) ─────────────────────────>  write at i * CHUNK_SIZE
//!   <─────────────────────────── SegmentAck(i)
//!   ...                                         verify hash, promote file
//!   <──────────────── TransferComplete / TransferFailed
//! ```

pub mod events;
pub mod hasher;
pub mod manager;
pub mod record;
mod receiver;
mod sender;
pub mod store;

pub use events::TransferEvent;
pub use hasher::{ContentHash, ContentHasher, Sha256Hasher};
pub use manager::{TransferKey, TransferManager};
pub use record::{TransferDirection, TransferPhase, TransferRecord, TransferStatus};
pub use store::{MemoryRecordStore, RecordStore};
