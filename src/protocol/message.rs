//! Message set and per-type body encoding.
//!
//! Each [`Message`] variant maps to exactly one [`MessageType`] tag, and the
//! tag alone determines how the body bytes are laid out:
//!
//! | Type              | Tag | Body                                                        |
//! |-------------------|-----|-------------------------------------------------------------|
//! | ConnectionRequest | 1   | label: str                                                  |
//! | ConnectionAck     | 2   | session_token: str                                          |
//! | ApplyTransfer     | 3   | transfer_id u64, name str, length u64, segments u32,        |
//! |                   |     | start u32, hash [32], token str                             |
//! | TransferAccept    | 4   | transfer_id u64, start u32                                  |
//! | SegmentData       | 5   | transfer_id u64, index u32, payload (u32 len + bytes)       |
//! | SegmentAck        | 6   | transfer_id u64, index u32                                  |
//! | TransferComplete  | 7   | transfer_id u64                                             |
//! | TransferFailed    | 8   | transfer_id u64, reason str                                 |
//! | Heartbeat         | 9   | (empty)                                                     |
//!
//! Integers are big-endian; `str` is a u16 byte length followed by UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::frame::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::transfer::hasher::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    ConnectionRequest = 1,
    ConnectionAck = 2,
    ApplyTransfer = 3,
    TransferAccept = 4,
    SegmentData = 5,
    SegmentAck = 6,
    TransferComplete = 7,
    TransferFailed = 8,
    Heartbeat = 9,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::ConnectionRequest,
        MessageType::ConnectionAck,
        MessageType::ApplyTransfer,
        MessageType::TransferAccept,
        MessageType::SegmentData,
        MessageType::SegmentAck,
        MessageType::TransferComplete,
        MessageType::TransferFailed,
        MessageType::Heartbeat,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::ConnectionRequest => "CONNECTION_REQUEST",
            MessageType::ConnectionAck => "CONNECTION_ACK",
            MessageType::ApplyTransfer => "APPLY_TRANSFER",
            MessageType::TransferAccept => "TRANSFER_ACCEPT",
            MessageType::SegmentData => "SEGMENT_DATA",
            MessageType::SegmentAck => "SEGMENT_ACK",
            MessageType::TransferComplete => "TRANSFER_COMPLETE",
            MessageType::TransferFailed => "TRANSFER_FAILED",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("Unknown message type {tag}")))
    }
}

/// Transfer request sent by the side that owns the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTransfer {
    pub transfer_id: u64,
    pub file_name: String,
    pub file_length: u64,
    pub segment_count: u32,
    /// First segment the sender intends to transmit; nonzero when resuming
    pub start_index: u32,
    pub content_hash: ContentHash,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectionRequest {
        label: String,
    },
    ConnectionAck {
        session_token: String,
    },
    ApplyTransfer(ApplyTransfer),
    TransferAccept {
        transfer_id: u64,
        start_index: u32,
    },
    SegmentData {
        transfer_id: u64,
        index: u32,
        payload: Bytes,
    },
    SegmentAck {
        transfer_id: u64,
        index: u32,
    },
    TransferComplete {
        transfer_id: u64,
    },
    TransferFailed {
        transfer_id: u64,
        reason: String,
    },
    Heartbeat,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectionRequest { .. } => MessageType::ConnectionRequest,
            Message::ConnectionAck { .. } => MessageType::ConnectionAck,
            Message::ApplyTransfer(_) => MessageType::ApplyTransfer,
            Message::TransferAccept { .. } => MessageType::TransferAccept,
            Message::SegmentData { .. } => MessageType::SegmentData,
            Message::SegmentAck { .. } => MessageType::SegmentAck,
            Message::TransferComplete { .. } => MessageType::TransferComplete,
            Message::TransferFailed { .. } => MessageType::TransferFailed,
            Message::Heartbeat => MessageType::Heartbeat,
        }
    }

    /// The transfer this message belongs to, if any.
    pub fn transfer_id(&self) -> Option<u64> {
        match self {
            Message::ApplyTransfer(apply) => Some(apply.transfer_id),
            Message::TransferAccept { transfer_id, .. }
            | Message::SegmentData { transfer_id, .. }
            | Message::SegmentAck { transfer_id, .. }
            | Message::TransferComplete { transfer_id }
            | Message::TransferFailed { transfer_id, .. } => Some(*transfer_id),
            Message::ConnectionRequest { .. }
            | Message::ConnectionAck { .. }
            | Message::Heartbeat => None,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut body = BytesMut::new();
        match self {
            Message::ConnectionRequest { label } => put_str(&mut body, label),
            Message::ConnectionAck { session_token } => put_str(&mut body, session_token),
            Message::ApplyTransfer(apply) => {
                body.put_u64(apply.transfer_id);
                put_str(&mut body, &apply.file_name);
                body.put_u64(apply.file_length);
                body.put_u32(apply.segment_count);
                body.put_u32(apply.start_index);
                body.put_slice(apply.content_hash.as_bytes());
                put_str(&mut body, &apply.token);
            }
            Message::TransferAccept {
                transfer_id,
                start_index,
            } => {
                body.put_u64(*transfer_id);
                body.put_u32(*start_index);
            }
            Message::SegmentData {
                transfer_id,
                index,
                payload,
            } => {
                body.reserve(16 + payload.len());
                body.put_u64(*transfer_id);
                body.put_u32(*index);
                body.put_u32(payload.len() as u32);
                body.put_slice(payload);
            }
            Message::SegmentAck { transfer_id, index } => {
                body.put_u64(*transfer_id);
                body.put_u32(*index);
            }
            Message::TransferComplete { transfer_id } => body.put_u64(*transfer_id),
            Message::TransferFailed {
                transfer_id,
                reason,
            } => {
                body.put_u64(*transfer_id);
                put_str(&mut body, reason);
            }
            Message::Heartbeat => {}
        }
        Frame::new(self.message_type().tag(), body.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let message_type = MessageType::try_from(frame.message_type)?;
        let mut body = BodyReader::new(frame.body.clone());

        let message = match message_type {
            MessageType::ConnectionRequest => Message::ConnectionRequest {
                label: body.string()?,
            },
            MessageType::ConnectionAck => Message::ConnectionAck {
                session_token: body.string()?,
            },
            MessageType::ApplyTransfer => Message::ApplyTransfer(ApplyTransfer {
                transfer_id: body.u64()?,
                file_name: body.string()?,
                file_length: body.u64()?,
                segment_count: body.u32()?,
                start_index: body.u32()?,
                content_hash: body.hash()?,
                token: body.string()?,
            }),
            MessageType::TransferAccept => Message::TransferAccept {
                transfer_id: body.u64()?,
                start_index: body.u32()?,
            },
            MessageType::SegmentData => {
                let transfer_id = body.u64()?;
                let index = body.u32()?;
                let len = body.u32()? as usize;
                Message::SegmentData {
                    transfer_id,
                    index,
                    payload: body.bytes(len)?,
                }
            }
            MessageType::SegmentAck => Message::SegmentAck {
                transfer_id: body.u64()?,
                index: body.u32()?,
            },
            MessageType::TransferComplete => Message::TransferComplete {
                transfer_id: body.u64()?,
            },
            MessageType::TransferFailed => Message::TransferFailed {
                transfer_id: body.u64()?,
                reason: body.string()?,
            },
            MessageType::Heartbeat => Message::Heartbeat,
        };

        body.finish()?;
        Ok(message)
    }
}

fn put_str(dst: &mut BytesMut, value: &str) {
    // Longer strings are cut at a char boundary; names and reasons never get close
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    dst.put_u16(end as u16);
    dst.put_slice(&value.as_bytes()[..end]);
}

/// Bounds-checked cursor over a message body.
struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::MalformedFrame(
                constants::ERR_BODY_TRUNCATED.into(),
            ));
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::MalformedFrame(constants::ERR_INVALID_UTF8.into()))
    }

    fn hash(&mut self) -> Result<ContentHash> {
        self.need(32)?;
        let mut digest = [0u8; 32];
        self.buf.copy_to_slice(&mut digest);
        Ok(ContentHash::new(digest))
    }

    fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::MalformedFrame(
                constants::ERR_BODY_TRAILING.into(),
            ));
        }
        Ok(())
    }
}
