//! # Core Protocol Components
//!
//! Low-level frame handling, the stream codec and segment accounting.
//!
//! ## Components
//! - **Frame**: fixed 16-byte header plus a type-specific body
//! - **Codec**: Tokio codec that reassembles frames from a byte stream
//! - **Segment**: how a file of `L` bytes is cut into `CHUNK_SIZE` slices
//!
//! ## Wire Format
//! ```text
//! offset 0   4           12            16
//!        [Length] [Reserved(8)] [MessageType] [Body(N)]
//! ```
//! `Length` is big-endian and counts every byte after the length field
//! (`12 + N`). The type tag never moves, so a receiver can classify a frame
//! from its header alone.
//!
//! ## Security
//! - Maximum frame size is enforced before any allocation
//! - Declared lengths shorter than the header are rejected

pub mod codec;
pub mod frame;
pub mod segment;
