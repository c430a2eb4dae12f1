//! # Protocol Layer
//!
//! Message schema, session handshake and per-type routing.
//!
//! ## Components
//! - **Message**: the closed set of message types and their body encodings
//! - **Handshake**: token issue and verification
//! - **Dispatcher**: routes each decoded message to one handler

pub mod dispatcher;
pub mod handshake;
pub mod message;
