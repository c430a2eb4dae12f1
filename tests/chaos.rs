//! Failure injection: silent peers, idle links, refused connections and
//! shutdowns in the middle of a transfer.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use filewire::config::NetworkConfig;
use filewire::error::ProtocolError;
use filewire::protocol::dispatcher::Dispatcher;
use filewire::protocol::message::Message;
use filewire::transfer::{RecordStore, TransferStatus};
use filewire::transport::{ConnectionEvent, ConnectionSession, ConnectionStatus, TransferServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_server(config: NetworkConfig) -> (std::net::SocketAddr, Arc<filewire::transfer::MemoryRecordStore>, mpsc::Sender<()>) {
    let (manager, store) = new_manager(&config);
    let dispatcher = Arc::new(Dispatcher::with_transfers(manager));
    let server = TransferServer::bind(&config, dispatcher).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown, rx) = mpsc::channel(1);
    tokio::spawn(server.run_with_shutdown(rx));
    (addr, store, shutdown)
}

#[tokio::test]
async fn test_idle_peer_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.server.heartbeat_interval = Duration::from_millis(100);
    config.server.idle_timeout = Duration::from_millis(400);
    let (addr, _store, _shutdown) = spawn_server(config).await;

    let mut peer = RawPeer::connect(addr).await;
    peer.handshake().await;

    // Heartbeats flow toward the peer but it never answers
    assert!(peer.closed_within(Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.server.heartbeat_interval = Duration::from_millis(100);
    config.server.idle_timeout = Duration::from_millis(400);
    config.client.heartbeat_interval = Duration::from_millis(100);
    config.client.idle_timeout = Duration::from_millis(400);
    let (addr, _store, shutdown) = spawn_server(config.clone()).await;

    let (manager, store) = new_manager(&config);
    let client = Client::connect_with(addr, &config, manager, store).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(client.session.status(), ConnectionStatus::Connected);
    drop(shutdown);
}

#[tokio::test]
async fn test_silent_sender_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.transfer.response_timeout = Duration::from_millis(300);
    let (addr, store, _shutdown) = spawn_server(config).await;
    let data = file_bytes(9000);

    let mut peer = RawPeer::connect(addr).await;
    let token = peer.handshake().await;
    peer.send(apply(8, "stalled.bin", &data, 0, &token)).await;
    assert!(matches!(peer.recv().await, Message::TransferAccept { .. }));
    peer.send(segment(8, &data, 0)).await;
    assert_eq!(peer.recv().await, Message::SegmentAck { transfer_id: 8, index: 0 });

    match peer.recv().await {
        Message::TransferFailed { transfer_id, .. } => assert_eq!(transfer_id, 8),
        other => panic!("Expected TransferFailed, got {other:?}"),
    }
    eventually(|| {
        store
            .query(&|r| r.status == TransferStatus::Failed)
            .unwrap()
            .len()
            == 1
    })
    .await;
    let record = store.query(&|_| true).unwrap().remove(0);
    assert_eq!(record.cursor, Some(0));
}

#[tokio::test]
async fn test_silent_receiver_fails_send() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let fake = tokio::spawn(async move {
        let mut peer = RawPeer::accept(&listener).await;
        let _ = peer.recv().await;
        peer.send(Message::ConnectionAck {
            session_token: "t".into(),
        })
        .await;
        let _ = peer.recv().await;
        // Hold the connection open without answering
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let mut config = test_config(dir.path());
    config.transfer.response_timeout = Duration::from_millis(300);
    let (manager, store) = new_manager(&config);
    let client = Client::connect_with(addr, &config, manager, store).await;

    let (path, _) = write_file(dir.path(), "unheard.bin", 5000);
    let result = client.manager.send_file(&client.session, &path).await;

    assert!(matches!(result, Err(ProtocolError::Timeout)));
    let history = client.manager.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransferStatus::Failed);
    assert_eq!(history[0].cursor, None);
    fake.abort();
}

#[tokio::test]
async fn test_peer_refusal_fails_send() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let fake = tokio::spawn(async move {
        let mut peer = RawPeer::accept(&listener).await;
        let _ = peer.recv().await;
        peer.send(Message::ConnectionAck {
            session_token: "t".into(),
        })
        .await;
        let Message::ApplyTransfer(apply) = peer.recv().await else {
            panic!("Expected ApplyTransfer");
        };
        peer.send(Message::TransferFailed {
            transfer_id: apply.transfer_id,
            reason: "disk full".into(),
        })
        .await;
        let _ = peer.closed_within(Duration::from_secs(1)).await;
    });

    let client = Client::connect(addr, dir.path()).await;
    let (path, _) = write_file(dir.path(), "big.bin", 5000);
    let result = client.manager.send_file(&client.session, &path).await;
    fake.await.unwrap();

    match result {
        Err(ProtocolError::PeerFailure(reason)) => assert_eq!(reason, "disk full"),
        other => panic!("Expected PeerFailure, got {other:?}"),
    }
    let history = client.manager.history().unwrap();
    assert_eq!(history[0].failure.as_deref(), Some("Peer reported failure: disk full"));
}

#[tokio::test]
async fn test_connection_limit_refuses_extra_peers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.server.max_connections = 1;
    let (addr, _store, _shutdown) = spawn_server(config).await;

    let mut first = RawPeer::connect(addr).await;
    first.handshake().await;

    let mut second = RawPeer::connect(addr).await;
    assert!(second.closed_within(Duration::from_secs(2)).await);

    // The admitted peer is unaffected
    first.send(Message::Heartbeat).await;
    assert!(!first.closed_within(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let inbox = tempfile::tempdir().unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let server = Server::start(inbox.path()).await;
    let client = Client::connect(server.addr, outbox.path()).await;
    let mut events = client.session.subscribe();

    server.stop().await;

    let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ConnectionEvent::Disconnected) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(disconnected.is_ok());
    assert_eq!(client.session.status(), ConnectionStatus::Disconnected);
    assert!(client.session.token().is_none());

    let (path, _) = write_file(outbox.path(), "late.bin", 10);
    let result = client.manager.send_file(&client.session, &path).await;
    assert!(matches!(result, Err(ProtocolError::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_fails_inflight_receive_once() {
    let inbox = tempfile::tempdir().unwrap();
    let server = Server::start(inbox.path()).await;
    let mut events = server.manager.subscribe();
    let data = file_bytes(20_000);

    let mut peer = RawPeer::connect(server.addr).await;
    let token = peer.handshake().await;
    peer.send(apply(2, "cut.bin", &data, 0, &token)).await;
    assert!(matches!(peer.recv().await, Message::TransferAccept { .. }));
    peer.send(segment(2, &data, 0)).await;
    assert_eq!(peer.recv().await, Message::SegmentAck { transfer_id: 2, index: 0 });
    drop(peer);

    let mut failures = 0;
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Ok(event) = events.recv().await {
            if matches!(event, filewire::transfer::TransferEvent::Failed { .. }) {
                failures += 1;
            }
        }
    })
    .await;
    assert_eq!(failures, 1);

    let record = server.store.query(&|_| true).unwrap().remove(0);
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.cursor, Some(0));
    assert!(inbox.path().join("cut.bin.part").exists());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_reconnects_survive_late_teardown() {
    let inbox = tempfile::tempdir().unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let server = Server::start(inbox.path()).await;

    let config = test_config(outbox.path());
    let (manager, _store) = new_manager(&config);
    let dispatcher = Arc::new(Dispatcher::with_transfers(Arc::clone(&manager)));
    let session = ConnectionSession::client(
        "cycler",
        server.addr.ip().to_string(),
        server.addr.port(),
        "cycler",
        &config,
    );

    for cycle in 0..30 {
        if let Err(e) = session.connect(Arc::clone(&dispatcher)).await {
            panic!("connect failed on cycle {cycle}: {e}");
        }
        if let Err(e) = session.wait_for_token(Duration::from_secs(5)).await {
            panic!("handshake failed on cycle {cycle}: {e}");
        }
        session.close();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(session.token().is_none());
    }

    session.connect(Arc::clone(&dispatcher)).await.unwrap();
    session.wait_for_token(Duration::from_secs(5)).await.unwrap();
    let mut events = session.subscribe();

    // Readers of the closed sockets have had time to wake up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(session.token().is_some());
    assert!(events.try_recv().is_err());

    let (path, data) = write_file(outbox.path(), "after-cycles.bin", 9000);
    let record = manager.send_file(&session, &path).await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(std::fs::read(inbox.path().join("after-cycles.bin")).unwrap(), data);

    session.close();
    server.stop().await;
}
