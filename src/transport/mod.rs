//! # Transport Layer
//!
//! TCP connections carrying framed protocol messages.
//!
//! ## Components
//! - **Session**: one peer connection with connect/retry, reassembly,
//!   liveness and a once-per-disconnect teardown
//! - **Server**: listener that turns accepted sockets into sessions

pub mod server;
pub mod session;

pub use server::TransferServer;
pub use session::{ConnectionEvent, ConnectionSession, ConnectionStatus, SessionRole};
