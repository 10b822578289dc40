// HTTP fetcher integration tests
//
// Each test runs against a minimal in-process HTTP/1.1 responder that
// replies to every connection with one canned response and closes.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::Collect;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use webcache::layered::LayeredCache;
use webcache::policy::CachePolicy;
use webcache::progress::Progress;
use webcache::store::{FileStore, MutableStore, Source, Store};
use webcache::{CacheError, HttpFetcher};

/// Serve `response` to every incoming connection, recording request heads.
async fn spawn_responder(response: Vec<u8>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let response = response.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                // GET requests carry no body; read until the blank line
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                seen.lock().push(String::from_utf8_lossy(&head).to_string());
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, requests)
}

fn http_response(status_line: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {}\r\n", status_line);
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("Connection: close\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

async fn fetch(
    addr: SocketAddr,
    path: &str,
    offset: u64,
    length: Option<u64>,
) -> Arc<Mutex<common::CollectState>> {
    let fetcher = HttpFetcher::new().unwrap();
    let (receiver, state) = Collect::new();
    fetcher
        .fetch(
            &format!("http://{}{}", addr, path),
            offset,
            length,
            CachePolicy::Default,
            Progress::new(),
            Box::new(receiver),
        )
        .await;
    state
}

#[tokio::test]
async fn test_200_streams_the_full_resource() {
    let (addr, requests) = spawn_responder(http_response(
        "200 OK",
        &[
            ("Content-Type", "text/plain; charset=utf-8"),
            ("Content-Length", "5"),
            ("ETag", "\"v1\""),
        ],
        b"hello",
    ))
    .await;

    let state = fetch(addr, "/file.txt", 0, None).await;
    let state = state.lock();
    assert!(state.inited);
    assert_eq!(state.response_status, Some(200));
    assert!(state.finished);
    assert_eq!(state.data, b"hello");
    assert_eq!(state.offset, 0);
    assert_eq!(state.length, Some(5));

    let info = state.info.as_ref().unwrap();
    assert_eq!(info.mime_type, "text/plain");
    assert_eq!(info.text_encoding.as_deref(), Some("utf-8"));
    assert_eq!(info.total_length, Some(5));
    assert_eq!(info.header("ETag"), Some("\"v1\""));

    // No Range header for a whole-resource request, and the marker header
    // identifies cache-owned traffic
    let request = requests.lock()[0].clone();
    assert!(!request.to_ascii_lowercase().contains("range:"));
    assert!(request.to_ascii_lowercase().contains("x-webcache-request: 1"));
}

#[tokio::test]
async fn test_204_delivers_an_empty_resource() {
    let (addr, _) = spawn_responder(http_response(
        "204 No Content",
        &[("Content-Length", "0")],
        b"",
    ))
    .await;

    let state = fetch(addr, "/empty", 0, None).await;
    let state = state.lock();
    assert!(state.started);
    assert_eq!(state.offset, 0);
    assert_eq!(state.length, Some(0));
    assert_eq!(state.chunks, 0);
    assert!(state.finished);
}

#[tokio::test]
async fn test_206_delivers_the_declared_segment() {
    let body: Vec<u8> = (0..100u8).collect();
    let (addr, requests) = spawn_responder(http_response(
        "206 Partial Content",
        &[
            ("Content-Range", "bytes 100-199/1000"),
            ("Content-Length", "100"),
        ],
        &body,
    ))
    .await;

    let state = fetch(addr, "/ranged", 100, Some(100)).await;
    let state = state.lock();
    assert!(state.finished);
    assert_eq!(state.offset, 100);
    assert_eq!(state.length, Some(100));
    assert_eq!(state.data, body);
    assert_eq!(state.info.as_ref().unwrap().total_length, Some(1000));

    let request = requests.lock()[0].clone();
    assert!(request.to_ascii_lowercase().contains("range: bytes=100-199"));
}

#[tokio::test]
async fn test_open_ended_range_request() {
    let (addr, requests) = spawn_responder(http_response(
        "206 Partial Content",
        &[("Content-Range", "bytes 500-504/505"), ("Content-Length", "5")],
        b"tail!",
    ))
    .await;

    let state = fetch(addr, "/tail", 500, None).await;
    assert_eq!(state.lock().data, b"tail!");

    let request = requests.lock()[0].clone();
    assert!(request.to_ascii_lowercase().contains("range: bytes=500-"));
}

#[tokio::test]
async fn test_404_is_a_soft_miss() {
    let (addr, _) = spawn_responder(http_response(
        "404 Not Found",
        &[("Content-Length", "0")],
        b"",
    ))
    .await;

    let state = fetch(addr, "/missing", 0, None).await;
    let state = state.lock();
    assert!(matches!(state.aborted, Some(None)));
    assert!(!state.started);
}

#[tokio::test]
async fn test_other_statuses_abort_with_transport_error() {
    let (addr, _) = spawn_responder(http_response(
        "503 Service Unavailable",
        &[("Content-Length", "0")],
        b"",
    ))
    .await;

    let state = fetch(addr, "/down", 0, None).await;
    let state = state.lock();
    match &state.aborted {
        Some(Some(CacheError::Transport { status, url, .. })) => {
            assert_eq!(*status, Some(503));
            assert!(url.contains("/down"));
        }
        other => panic!("expected transport failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_failure_aborts_with_transport_error() {
    // Bind and drop a listener so the port is very likely refused
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let state = fetch(addr, "/", 0, None).await;
    let state = state.lock();
    assert!(matches!(
        state.aborted,
        Some(Some(CacheError::Transport { .. }))
    ));
}

#[tokio::test]
async fn test_malformed_content_range_aborts() {
    let (addr, _) = spawn_responder(http_response(
        "206 Partial Content",
        &[("Content-Range", "pages 1-2/9"), ("Content-Length", "2")],
        b"xy",
    ))
    .await;

    let state = fetch(addr, "/bad-range", 0, Some(2)).await;
    let state = state.lock();
    assert!(matches!(
        state.aborted,
        Some(Some(CacheError::Transport { status: Some(206), .. }))
    ));
}

#[tokio::test]
async fn test_cancelled_fetch_delivers_nothing_further() {
    let (addr, _) = spawn_responder(http_response(
        "200 OK",
        &[("Content-Length", "4")],
        b"data",
    ))
    .await;

    let fetcher = HttpFetcher::new().unwrap();
    let (receiver, state) = Collect::new();
    let progress = Progress::new();
    progress.cancel();
    fetcher
        .fetch(
            &format!("http://{}/cancelled", addr),
            0,
            None,
            CachePolicy::Default,
            progress,
            Box::new(receiver),
        )
        .await;

    let state = state.lock();
    assert!(matches!(state.aborted, Some(None)));
    assert_eq!(state.chunks, 0);
}

#[tokio::test]
async fn test_204_through_a_file_backed_cache_persists_an_empty_entry() {
    let (addr, _) = spawn_responder(http_response(
        "204 No Content",
        &[("Content-Type", "application/octet-stream"), ("Content-Length", "0")],
        b"",
    ))
    .await;

    let dir = TempDir::new().unwrap();
    let file = FileStore::new(dir.path());
    let fetcher = HttpFetcher::new().unwrap();
    let cache = LayeredCache::with_source(
        file.clone(),
        webcache::layered::Node::source(Arc::new(fetcher)),
    );

    let url = format!("http://{}/empty", addr);
    let (info, data) = cache
        .fetch_bytes(&url, 0, None, CachePolicy::Default, Progress::new())
        .await;
    assert!(info.is_some());
    assert_eq!(data, Some(bytes::Bytes::new()));

    // Persisted artifact: zero-byte payload with a sidecar
    let payload = dir.path().join(webcache::hash::url_hash(&url));
    assert!(payload.exists());
    assert_eq!(std::fs::metadata(&payload).unwrap().len(), 0);
    assert!(payload.with_extension("meta").exists());

    // And the entry now serves from the store
    let (peeked, length) = file.peek(&url).await;
    assert!(peeked.is_some());
    assert_eq!(length, Some(0));
}

#[tokio::test]
async fn test_range_continuation_becomes_a_store_hit() {
    // A 1000-byte resource whose first 100 bytes are already cached; the
    // origin serves the next 100 through a 206.
    let full: Vec<u8> = (0..1000u16).map(|i| (i % 251) as u8).collect();
    let (addr, _) = spawn_responder(http_response(
        "206 Partial Content",
        &[
            ("Content-Range", "bytes 100-199/1000"),
            ("Content-Length", "100"),
        ],
        &full[100..200],
    ))
    .await;

    let dir = TempDir::new().unwrap();
    let file = FileStore::new(dir.path());
    let url = format!("http://{}/big", addr);

    // Seed the materialized prefix as an interrupted transfer would
    {
        use webcache::receiver::Receiver;
        let progress = Progress::new();
        let mut receiver = file.store_receiver(&url, CachePolicy::Keep).await.unwrap();
        receiver.on_inited(None, &progress).await;
        receiver
            .on_started(
                webcache::ResourceInfo::default().with_total_length(1000),
                0,
                Some(1000),
            )
            .await;
        receiver
            .on_data(bytes::Bytes::from(full[..100].to_vec()))
            .await;
        receiver.on_aborted(None).await;
    }

    let fetcher = HttpFetcher::new().unwrap();
    let cache = LayeredCache::with_source(
        file.clone(),
        webcache::layered::Node::source(Arc::new(fetcher)),
    );

    // Store cannot serve [100, 200) yet; the origin does, teed back in
    let (_, data) = cache
        .fetch_bytes(&url, 100, Some(100), CachePolicy::Default, Progress::new())
        .await;
    assert_eq!(data.as_deref(), Some(&full[100..200]));

    // The same range is now a store hit
    let (_, length) = file.peek(&url).await;
    assert_eq!(length, Some(200));
    let (_, data) = LayeredCache::new(file)
        .fetch_bytes(&url, 100, Some(100), CachePolicy::Default, Progress::new())
        .await;
    assert_eq!(data.as_deref(), Some(&full[100..200]));
}
