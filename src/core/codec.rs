//! Stream codec turning a TCP byte stream into [`Message`]s and back.
//!
//! The decoder is the reassembly buffer: partial frames stay in the
//! `BytesMut` until enough bytes arrive, and several frames delivered by one
//! read are yielded one at a time.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{HEADER_LEN, MAX_FRAME_SIZE};
use crate::core::frame::{declared_len, Frame, FrameStatus, LENGTH_FIELD_LEN};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        // Reject bad lengths as soon as the length field is readable
        let total = LENGTH_FIELD_LEN + declared_len(src, self.max_frame_size)?;
        if src.len() < total.max(HEADER_LEN) {
            src.reserve(total - src.len());
            return Ok(None);
        }

        match Frame::parse(&src[..total], self.max_frame_size)? {
            FrameStatus::Complete { frame, consumed } => {
                src.advance(consumed);
                global_metrics().frame_received(consumed as u64);
                Message::from_frame(&frame).map(Some)
            }
            FrameStatus::Incomplete { .. } => Ok(None),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let frame = item.to_frame();
        if frame.encoded_len() > self.max_frame_size {
            return Err(ProtocolError::MalformedFrame(format!(
                "Outbound frame of {} bytes exceeds limit of {}",
                frame.encoded_len(),
                self.max_frame_size
            )));
        }
        frame.encode_into(dst);
        global_metrics().frame_sent(frame.encoded_len() as u64);
        Ok(())
    }
}
