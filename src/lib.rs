//! # filewire
//!
//! Resumable, hash-verified file transfer between two peers over one
//! persistent TCP connection.
//!
//! ## Layers
//! - [`core`]: frame wire format, the streaming codec and segment accounting
//! - [`protocol`]: message set, session handshake and the dispatcher
//! - [`transport`]: connection sessions (dialing and accepted) and the server loop
//! - [`transfer`]: per-file transfer state machines, records, hashing, events
//! - [`utils`]: metrics, logging, timeouts and clock helpers
//!
//! ## Wire Format
//! ```text
//! [Length(4, BE)] [Reserved(8)] [MessageType(4, BE)] [Body(N)]
//! ```
//! `Length` counts every byte after itself, so the type tag always sits at
//! offset 12.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use filewire::config::NetworkConfig;
//! use filewire::protocol::dispatcher::Dispatcher;
//! use filewire::transfer::{MemoryRecordStore, Sha256Hasher, TransferManager};
//! use filewire::transport::session::ConnectionSession;
//!
//! # async fn run() -> filewire::error::Result<()> {
//! let config = NetworkConfig::default();
//! let manager = Arc::new(TransferManager::new(
//!     config.transfer.clone(),
//!     Arc::new(MemoryRecordStore::new()),
//!     Arc::new(Sha256Hasher::default()),
//! ));
//! let dispatcher = Arc::new(Dispatcher::with_transfers(Arc::clone(&manager)));
//!
//! let session = ConnectionSession::client("peer-1", "127.0.0.1", 9000, "laptop", &config);
//! session.connect(dispatcher).await?;
//! session.wait_for_token(config.client.operation_timeout).await?;
//!
//! let record = manager.send_file(&session, "report.pdf").await?;
//! tracing::info!(file = %record.file_name, status = ?record.status, "transfer finished");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transfer;
pub mod transport;
pub mod utils;

pub use crate::core::frame::Frame;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::message::{Message, MessageType};
