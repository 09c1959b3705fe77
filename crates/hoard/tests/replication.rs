//! Multi-node replication over loopback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cas::FileStore;
use hoard::{FileServer, ServerError};
use hoardconf::HoardConfig;
use hoardproto::{codec, Message, TcpTransport, RAW_STREAM};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

type Node = Arc<FileServer<TcpTransport>>;

fn node_config(dir: &TempDir, bootstrap: &[String]) -> HoardConfig {
    let mut config = HoardConfig::default();
    config.infra.paths.storage_root = dir.path().to_path_buf();
    config.infra.bind.listen = "127.0.0.1:0".to_string();
    config.infra.network.fetch_timeout_ms = 1000;
    config.infra.network.stream_timeout_ms = 2000;
    config.bootstrap.peers = bootstrap.to_vec();
    config
}

async fn node(dir: &TempDir, bootstrap: &[String]) -> Node {
    let server = FileServer::from_config(&node_config(dir, bootstrap)).unwrap();
    server.start().await.unwrap();
    server
}

fn addr_of(server: &Node) -> String {
    server.local_addr().unwrap().to_string()
}

/// Poll `check` until it holds or `WAIT` elapses.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn arrives(store: &FileStore, key: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if store.has(key).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_local_store_then_get() {
    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[]).await;

    let written = s.store_data("k1", &mut &b"hello"[..]).await.unwrap();
    assert_eq!(written, 5);

    let (size, file) = s.get("k1").await.unwrap();
    assert_eq!(size, 5);
    assert_eq!(read_all(file).await, b"hello");

    s.stop().await.unwrap();
}

#[tokio::test]
async fn test_store_replicates_to_peer() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    let s2 = node(&d2, &[addr_of(&s1)]).await;

    assert!(eventually(|| s1.peer_count() == 1).await);
    assert_eq!(s2.peer_count(), 1);

    s2.store_data("k2", &mut &b"payload"[..]).await.unwrap();

    assert!(arrives(s1.file_store(), "k2").await);
    assert_eq!(s1.file_store().read_bytes("k2").await.unwrap(), b"payload");

    s2.stop().await.unwrap();
    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_fetches_from_peer() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    s1.store("remote", &mut &b"held by s1"[..]).await.unwrap();

    let s2 = node(&d2, &[addr_of(&s1)]).await;
    assert!(!s2.file_store().has("remote").await);

    let (size, file) = s2.get("remote").await.unwrap();
    assert_eq!(size, 10);
    assert_eq!(read_all(file).await, b"held by s1");
    assert!(s2.file_store().has("remote").await);

    s2.stop().await.unwrap();
    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_missing_everywhere_is_not_found() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    let s2 = node(&d2, &[addr_of(&s1)]).await;

    let started = Instant::now();
    let err = s2.get("nowhere").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert!(started.elapsed() < WAIT);

    s2.stop().await.unwrap();
    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_get_without_peers_fails_fast() {
    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[]).await;

    let started = Instant::now();
    let err = s.get("nowhere").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound { .. }));
    assert!(started.elapsed() < Duration::from_millis(500));

    s.stop().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_to_every_peer() {
    let dirs: Vec<_> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let s1 = node(&dirs[0], &[]).await;
    let s2 = node(&dirs[1], &[]).await;
    let hub = node(&dirs[2], &[addr_of(&s1), addr_of(&s2)]).await;
    assert_eq!(hub.peer_count(), 2);

    let payload = vec![42u8; 64 * 1024];
    hub.store_data("big", &mut payload.as_slice()).await.unwrap();

    for s in [&s1, &s2] {
        assert!(arrives(s.file_store(), "big").await);
        assert_eq!(s.file_store().read_bytes("big").await.unwrap(), payload);
    }

    for s in [hub, s2, s1] {
        s.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_consecutive_stores_arrive_in_order() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    let s2 = node(&d2, &[addr_of(&s1)]).await;

    for i in 0..5 {
        let body = format!("body-{i}");
        s2.store_data(&format!("seq-{i}"), &mut body.as_bytes())
            .await
            .unwrap();
    }

    for i in 0..5 {
        let key = format!("seq-{i}");
        assert!(arrives(s1.file_store(), &key).await);
        assert_eq!(
            s1.file_store().read_bytes(&key).await.unwrap(),
            format!("body-{i}").into_bytes()
        );
    }

    s2.stop().await.unwrap();
    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_removes_peer_on_the_other_side() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    let s2 = node(&d2, &[addr_of(&s1)]).await;
    assert!(eventually(|| s1.peer_count() == 1).await);

    s2.stop().await.unwrap();
    assert!(eventually(|| s1.peer_count() == 0).await);

    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[]).await;

    assert!(matches!(s.start().await, Err(ServerError::AlreadyStarted)));
    s.stop().await.unwrap();
}

#[tokio::test]
async fn test_dead_bootstrap_peer_does_not_abort_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap().to_string();
    drop(listener);

    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[dead]).await;
    assert_eq!(s.peer_count(), 0);

    s.store_data("solo", &mut &b"x"[..]).await.unwrap();
    assert!(s.file_store().has("solo").await);

    s.stop().await.unwrap();
}

#[tokio::test]
async fn test_raw_client_is_served_after_garbage() {
    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[]).await;
    s.store("wire", &mut &b"on the wire"[..]).await.unwrap();

    let mut client = TcpStream::connect(s.local_addr().unwrap()).await.unwrap();
    let mut request = codec::structured(b"\xff\xff\xff\xffgarbage").unwrap().to_vec();
    request.extend_from_slice(
        &codec::structured(&Message::get_file("wire").encode().unwrap()).unwrap(),
    );
    client.write_all(&request).await.unwrap();

    let tag = timeout(WAIT, client.read_u8()).await.unwrap().unwrap();
    assert_eq!(tag, codec::STRUCTURED);
    let len = client.read_u32().await.unwrap();
    let mut payload = vec![0u8; len as usize];
    client.read_exact(&mut payload).await.unwrap();
    assert_eq!(Message::decode(&payload).unwrap(), Message::store_file("wire", 11));

    assert_eq!(client.read_u8().await.unwrap(), RAW_STREAM);
    let mut body = vec![0u8; 11];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"on the wire");

    s.stop().await.unwrap();
}

fn slow_sender_config(dir: &TempDir, bootstrap: &[String], send_timeout_ms: u64) -> HoardConfig {
    let mut config = node_config(dir, bootstrap);
    config.infra.network.send_timeout_ms = send_timeout_ms;
    config
}

/// Everything the node wrote to a peer that never read until now.
async fn drain(listener: &TcpListener) -> Vec<u8> {
    let (mut conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut seen = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut seen))
        .await
        .expect("connection left open after failed stream")
        .unwrap();
    seen
}

#[tokio::test]
async fn test_stalled_stream_closes_peer() {
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dir = TempDir::new().unwrap();
    let config = slow_sender_config(&dir, &[stalled.local_addr().unwrap().to_string()], 300);
    let s = FileServer::from_config(&config).unwrap();
    s.start().await.unwrap();
    assert_eq!(s.peer_count(), 1);

    let size = 32 * 1024 * 1024;
    let payload = vec![7u8; size];
    let err = s.store_data("big", &mut payload.as_slice()).await.unwrap_err();
    assert!(matches!(err, ServerError::Timeout { .. }), "unexpected error: {err}");
    assert!(s.registry().is_empty());
    assert!(s.file_store().has("big").await);

    s.store_data("next", &mut &b"x"[..]).await.unwrap();

    let seen = drain(&stalled).await;
    assert_eq!(seen[0], codec::STRUCTURED);
    let len = u32::from_be_bytes([seen[1], seen[2], seen[3], seen[4]]) as usize;
    assert_eq!(
        Message::decode(&seen[5..5 + len]).unwrap(),
        Message::store_file("big", size as u64)
    );
    assert_eq!(seen[5 + len], RAW_STREAM);
    let body = &seen[5 + len + 1..];
    assert!(body.len() < size);
    assert!(body.iter().all(|b| *b == 7));

    s.stop().await.unwrap();
}

#[tokio::test]
async fn test_aborted_fan_out_leaves_no_peer_waiting() {
    let (d1, hub_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let s1 = node(&d1, &[]).await;
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bootstrap = [addr_of(&s1), stalled.local_addr().unwrap().to_string()];
    let hub = FileServer::from_config(&slow_sender_config(&hub_dir, &bootstrap, 1000)).unwrap();
    hub.start().await.unwrap();
    assert_eq!(hub.peer_count(), 2);
    assert!(eventually(|| s1.peer_count() == 1).await);

    let payload = vec![9u8; 32 * 1024 * 1024];
    assert!(hub.store_data("big", &mut payload.as_slice()).await.is_err());

    // The stalled peer is always dropped. s1 either got the whole stream or
    // was dropped with it, depending on fan-out order.
    if hub.peer_count() == 1 {
        assert!(arrives(s1.file_store(), "big").await);
        assert_eq!(s1.file_store().read_bytes("big").await.unwrap(), payload);
    } else {
        assert_eq!(hub.peer_count(), 0);
        assert!(eventually(|| s1.peer_count() == 0).await);
        assert!(!s1.file_store().has("big").await);
    }
    drain(&stalled).await;

    hub.stop().await.unwrap();
    s1.stop().await.unwrap();
}

#[tokio::test]
async fn test_sender_gone_mid_stream_discards_partial() {
    let dir = TempDir::new().unwrap();
    let s = node(&dir, &[]).await;

    let mut client = TcpStream::connect(s.local_addr().unwrap()).await.unwrap();
    assert!(eventually(|| s.peer_count() == 1).await);

    let mut wire = codec::structured(&Message::store_file("cut", 10).encode().unwrap())
        .unwrap()
        .to_vec();
    wire.push(RAW_STREAM);
    wire.extend_from_slice(b"abc");
    client.write_all(&wire).await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    assert!(eventually(|| s.peer_count() == 0).await);
    assert!(!s.file_store().has("cut").await);
    let staging = s.file_store().config().staging_dir();
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);

    s.stop().await.unwrap();
}
