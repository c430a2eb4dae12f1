//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filewire::config::{NetworkConfig, CHUNK_SIZE};
use filewire::core::codec::FrameCodec;
use filewire::protocol::dispatcher::Dispatcher;
use filewire::protocol::message::{ApplyTransfer, Message};
use filewire::transfer::{
    ContentHash, ContentHasher, MemoryRecordStore, Sha256Hasher, TransferManager,
};
use filewire::transport::{ConnectionSession, TransferServer};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub fn test_config(download_dir: &Path) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.client.retry_delay = Duration::from_millis(50);
        c.transfer.download_dir = download_dir.to_path_buf();
        c.transfer.response_timeout = Duration::from_secs(10);
    })
}

pub fn new_manager(config: &NetworkConfig) -> (Arc<TransferManager>, Arc<MemoryRecordStore>) {
    let store = Arc::new(MemoryRecordStore::new());
    let manager = Arc::new(TransferManager::new(
        config.transfer.clone(),
        store.clone(),
        Arc::new(Sha256Hasher::default()),
    ));
    (manager, store)
}

/// A real server running on a background task.
pub struct Server {
    pub addr: SocketAddr,
    pub manager: Arc<TransferManager>,
    pub store: Arc<MemoryRecordStore>,
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<filewire::Result<()>>,
}

impl Server {
    pub async fn start(download_dir: &Path) -> Self {
        let config = test_config(download_dir);
        let (manager, store) = new_manager(&config);
        Self::start_with(&config, manager, store).await
    }

    /// Server around a caller-built manager.
    pub async fn start_with(
        config: &NetworkConfig,
        manager: Arc<TransferManager>,
        store: Arc<MemoryRecordStore>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_transfers(manager.clone()));
        let server = TransferServer::bind(config, dispatcher).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, rx) = mpsc::channel(1);
        let handle = tokio::spawn(server.run_with_shutdown(rx));
        Self {
            addr,
            manager,
            store,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        self.handle.await.unwrap().unwrap();
    }
}

/// A real client session with its own manager.
pub struct Client {
    pub session: Arc<ConnectionSession>,
    pub manager: Arc<TransferManager>,
    pub store: Arc<MemoryRecordStore>,
}

impl Client {
    pub async fn connect(addr: SocketAddr, scratch: &Path) -> Self {
        let config = test_config(scratch);
        let (manager, store) = new_manager(&config);
        Self::connect_with(addr, &config, manager, store).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        config: &NetworkConfig,
        manager: Arc<TransferManager>,
        store: Arc<MemoryRecordStore>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_transfers(manager.clone()));
        let session =
            ConnectionSession::client("client", addr.ip().to_string(), addr.port(), "test-client", config);
        session.connect(dispatcher).await.unwrap();
        session.wait_for_token(Duration::from_secs(5)).await.unwrap();
        Self {
            session,
            manager,
            store,
        }
    }
}

/// Deterministic file contents of `len` bytes.
pub fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data = file_bytes(len);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

pub fn digest(data: &[u8]) -> ContentHash {
    Sha256Hasher::default()
        .hash_reader(&mut Cursor::new(data.to_vec()))
        .unwrap()
}

pub fn apply(transfer_id: u64, name: &str, data: &[u8], start: u32, token: &str) -> Message {
    Message::ApplyTransfer(ApplyTransfer {
        transfer_id,
        file_name: name.into(),
        file_length: data.len() as u64,
        segment_count: filewire::core::segment::segment_count(data.len() as u64),
        start_index: start,
        content_hash: digest(data),
        token: token.into(),
    })
}

pub fn segment(transfer_id: u64, data: &[u8], index: u32) -> Message {
    let start = index as usize * CHUNK_SIZE;
    let end = (start + CHUNK_SIZE).min(data.len());
    Message::SegmentData {
        transfer_id,
        index,
        payload: Bytes::copy_from_slice(&data[start..end]),
    }
}

/// Hand-driven peer speaking raw frames.
pub struct RawPeer {
    pub framed: Framed<TcpStream, FrameCodec>,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Accept one connection on `listener`, playing the server.
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    pub async fn handshake(&mut self) -> String {
        self.send(Message::ConnectionRequest {
            label: "raw-peer".into(),
        })
        .await;
        match self.recv().await {
            Message::ConnectionAck { session_token } => session_token,
            other => panic!("Expected ConnectionAck, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    /// Next non-heartbeat message.
    pub async fn recv(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), self.framed.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("decode failed");
            if message != Message::Heartbeat {
                return message;
            }
        }
    }

    /// Whether the peer closed the stream within `wait`.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
