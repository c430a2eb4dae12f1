//! Session handshake.
//!
//! ```text
//! client                         server
//!   ConnectionRequest(label) ──>   issue token, store on session
//!   <────────── ConnectionAck(token)
//!   store token
//! ```
//!
//! The token is 128 bits from the OS random source, hex encoded. Each
//! session has at most one valid token, written only here and cleared when
//! the connection drops. Every `ApplyTransfer` must present it.

use tracing::{debug, instrument, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::transport::session::{ConnectionSession, ConnectionStatus, SessionRole};
use crate::utils::metrics::global_metrics;

const TOKEN_BYTES: usize = 16;

/// Fresh random session token.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::fill(&mut bytes).map_err(|e| {
        ProtocolError::Custom(format!("{}: {e}", constants::ERR_RNG))
    })?;
    Ok(hex::encode(bytes))
}

/// First message a dialing client sends.
pub fn client_connection_request(label: &str) -> Message {
    Message::ConnectionRequest {
        label: label.to_string(),
    }
}

/// Server side: issue a token for this connection and build the ack.
///
/// A repeated request replaces the previous token.
#[instrument(skip(session), fields(session = %session.id()))]
pub fn server_handle_connection_request(session: &ConnectionSession, label: &str) -> Result<Message> {
    if session.role() != SessionRole::Server {
        warn!("Connection request received on a dialing session");
        return Err(ProtocolError::UnexpectedMessage);
    }

    let token = generate_token()?;
    session.set_label(label);
    session.set_token(token.clone());
    global_metrics().handshake_completed();
    debug!(peer_label = label, "Issued session token");

    Ok(Message::ConnectionAck {
        session_token: token,
    })
}

/// Client side: adopt the token the server issued.
#[instrument(skip(session, token), fields(session = %session.id()))]
pub fn client_handle_connection_ack(session: &ConnectionSession, token: String) -> Result<()> {
    if session.role() != SessionRole::Client {
        warn!("Connection ack received on an accepted session");
        return Err(ProtocolError::UnexpectedMessage);
    }
    if token.is_empty() {
        return Err(ProtocolError::InvalidRequest("Empty session token".into()));
    }

    // Status first, so a caller woken by the token sees it already
    session.set_status(ConnectionStatus::Connected, constants::STATUS_AUTHENTICATED);
    session.set_token(token);
    global_metrics().handshake_completed();
    debug!("Handshake complete");
    Ok(())
}

/// Check a presented token against the one stored on the session.
pub fn verify_token(session: &ConnectionSession, presented: &str) -> Result<()> {
    match session.token() {
        Some(expected) if constant_time_eq(expected.as_bytes(), presented.as_bytes()) => Ok(()),
        Some(_) => Err(ProtocolError::Unauthorized),
        None => {
            debug!(reason = constants::ERR_NOT_AUTHENTICATED, "Token check failed");
            Err(ProtocolError::Unauthorized)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
