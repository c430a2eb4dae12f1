use bytes::{BufMut, Bytes, BytesMut};

use crate::config::{HEADER_LEN, TYPE_OFFSET};
use crate::error::{constants, ProtocolError, Result};

/// Size of the leading length field
pub const LENGTH_FIELD_LEN: usize = 4;

/// Smallest legal value of the length field (reserved + type tag)
pub const MIN_DECLARED_LEN: usize = HEADER_LEN - LENGTH_FIELD_LEN;

/// One complete encoded unit on the wire.
///
/// The reserved region is carried through untouched: it is written as given
/// and read back without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reserved: [u8; 8],
    pub message_type: u32,
    pub body: Bytes,
}

/// Outcome of parsing the front of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// A full frame was decoded from the first `consumed` bytes.
    Complete { frame: Frame, consumed: usize },
    /// The buffer holds a partial frame; at least `needed` more bytes are required.
    Incomplete { needed: usize },
}

impl Frame {
    pub fn new(message_type: u32, body: Bytes) -> Self {
        Self {
            reserved: [0u8; 8],
            message_type,
            body,
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32((MIN_DECLARED_LEN + self.body.len()) as u32);
        dst.put_slice(&self.reserved);
        dst.put_u32(self.message_type);
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Parse the frame at the front of `buf`.
    ///
    /// Bytes past the first frame are left alone; callers feeding a stream
    /// use `consumed` to advance.
    pub fn parse(buf: &[u8], max_frame_size: usize) -> Result<FrameStatus> {
        if buf.len() < HEADER_LEN {
            return Ok(FrameStatus::Incomplete {
                needed: HEADER_LEN - buf.len(),
            });
        }

        let declared = declared_len(buf, max_frame_size)?;
        let total = LENGTH_FIELD_LEN + declared;
        if buf.len() < total {
            return Ok(FrameStatus::Incomplete {
                needed: total - buf.len(),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[LENGTH_FIELD_LEN..TYPE_OFFSET]);
        let message_type = read_u32(&buf[TYPE_OFFSET..HEADER_LEN]);

        Ok(FrameStatus::Complete {
            frame: Frame {
                reserved,
                message_type,
                body: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
            },
            consumed: total,
        })
    }

    /// Decode a buffer that must contain exactly one frame.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        match Self::parse(buf, crate::config::MAX_FRAME_SIZE)? {
            FrameStatus::Complete { frame, consumed } if consumed == buf.len() => Ok(frame),
            FrameStatus::Complete { .. } => Err(ProtocolError::MalformedFrame(
                constants::ERR_FRAME_TRAILING.into(),
            )),
            FrameStatus::Incomplete { .. } => Err(ProtocolError::MalformedFrame(
                constants::ERR_FRAME_TRUNCATED.into(),
            )),
        }
    }
}

/// Read the message type tag without decoding the body.
///
/// Returns `None` until the full header is available.
pub fn peek_message_type(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    Some(read_u32(&buf[TYPE_OFFSET..HEADER_LEN]))
}

/// Validate and return the length field of a buffer holding at least 4 bytes.
pub(crate) fn declared_len(buf: &[u8], max_frame_size: usize) -> Result<usize> {
    let declared = read_u32(&buf[..LENGTH_FIELD_LEN]) as usize;
    if declared < MIN_DECLARED_LEN {
        return Err(ProtocolError::MalformedFrame(
            constants::ERR_FRAME_TOO_SHORT.into(),
        ));
    }
    if LENGTH_FIELD_LEN + declared > max_frame_size {
        return Err(ProtocolError::MalformedFrame(format!(
            "Frame of {} bytes exceeds limit of {max_frame_size}",
            LENGTH_FIELD_LEN + declared
        )));
    }
    Ok(declared)
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_SIZE;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(0x0102_0304, Bytes::from_static(b"abc"));
        let bytes = frame.to_bytes();

        assert_eq!(bytes.len(), 19);
        assert_eq!(&bytes[0..4], &15u32.to_be_bytes());
        assert_eq!(&bytes[4..12], &[0u8; 8]);
        assert_eq!(&bytes[12..16], &[1, 2, 3, 4]);
        assert_eq!(&bytes[16..], b"abc");
        assert_eq!(peek_message_type(&bytes), Some(0x0102_0304));
    }

    #[test]
    fn test_reserved_bytes_survive() {
        let mut frame = Frame::new(7, Bytes::new());
        frame.reserved = [9, 8, 7, 6, 5, 4, 3, 2];
        let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_short_buffer_is_incomplete() {
        let bytes = Frame::new(1, Bytes::from_static(b"hello")).to_bytes();
        match Frame::parse(&bytes[..10], MAX_FRAME_SIZE).unwrap() {
            FrameStatus::Incomplete { needed } => assert_eq!(needed, 6),
            other => panic!("unexpected {other:?}"),
        }
        match Frame::parse(&bytes[..18], MAX_FRAME_SIZE).unwrap() {
            FrameStatus::Incomplete { needed } => assert_eq!(needed, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_declared_length_below_header_rejected() {
        let mut bytes = Frame::new(1, Bytes::new()).to_bytes();
        bytes[0..4].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(
            Frame::parse(&bytes, MAX_FRAME_SIZE),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let mut bytes = Frame::new(1, Bytes::new()).to_bytes();
        bytes[0..4].copy_from_slice(&(64u32 * 1024 * 1024).to_be_bytes());
        assert!(matches!(
            Frame::parse(&bytes, MAX_FRAME_SIZE),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_from_bytes_is_strict() {
        let mut bytes = Frame::new(2, Bytes::from_static(b"x")).to_bytes();
        assert!(Frame::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        bytes.push(0);
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }
}
