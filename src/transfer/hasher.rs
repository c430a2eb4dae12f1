//! Content hashing.
//!
//! The protocol identifies file content by a 256-bit digest computed once
//! before segmentation and recomputed by the receiver after reassembly.
//! Hashing streams through a bounded buffer; files are never loaded whole.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};
use crate::utils::metrics::Timer;

/// 256-bit digest of an entire file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn new(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(value, &mut digest)
            .map_err(|e| ProtocolError::Custom(format!("Invalid content hash: {e}")))?;
        Ok(Self(digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Streaming hash over a byte source.
///
/// Implementations must be deterministic: the same bytes always produce the
/// same digest on both peers.
pub trait ContentHasher: Send + Sync {
    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<ContentHash>;
}

/// SHA-256 over a fixed-size read buffer.
#[derive(Debug, Clone)]
pub struct Sha256Hasher {
    buffer_size: usize,
}

impl Sha256Hasher {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::with_buffer_size(64 * 1024)
    }
}

impl ContentHasher for Sha256Hasher {
    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<ContentHash> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..n]);
        }
        Ok(ContentHash(hasher.finalize().into()))
    }
}

/// Hash a file on the blocking pool so the caller's task keeps running.
pub async fn hash_file(hasher: Arc<dyn ContentHasher>, path: PathBuf) -> Result<ContentHash> {
    tokio::task::spawn_blocking(move || {
        let _timer = Timer::start("hash_file");
        let mut file = std::fs::File::open(&path)
            .map_err(|e| ProtocolError::local_io(&format!("open {}", path.display()), e))?;
        hasher
            .hash_reader(&mut file)
            .map_err(|e| ProtocolError::local_io(&format!("read {}", path.display()), e))
    })
    .await
    .map_err(|e| ProtocolError::Custom(format!("Hash task failed: {e}")))?
}
