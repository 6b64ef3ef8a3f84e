//! End-to-end HTTP/1.x scenarios: a corpus is written to disk, loaded,
//! and served on a loopback listener; a raw client drives the wire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use replay_core::{load_corpus, KeyFormat};
use replay_origin::acceptor::{accept_loop, bind, ListenKind};
use replay_origin::pool::{shutdown_channel, ShutdownHandle, WorkerPool};
use replay_origin::Engine;

const CORPUS: &str = r#"
sessions:
- transactions:
  - client-request:
      method: GET
      url: /x
      headers:
        fields:
        - [ Host, example.com ]
    proxy-request:
      headers:
        fields:
        - [ X-Proxy, expected, equal ]
    server-response:
      status: 200
      reason: OK
      headers:
        fields:
        - [ Content-Length, 5 ]
        - [ X-Recorded, yes ]
      content:
        data: hello
  - client-request:
      method: POST
      url: /upload
    proxy-request:
      content:
        data: "0123456789"
        verify:
          as: equal
    server-response:
      status: 201
      reason: Created
      content:
        data: done
  - client-request:
      method: GET
      url: /slow
    server-response:
      status: 200
      delay: 80ms
      content:
        data: eventually
"#;

struct TestServer {
    engine: Arc<Engine>,
    addr: std::net::SocketAddr,
    shutdown: ShutdownHandle,
    pool: WorkerPool,
    acceptor: JoinHandle<()>,
    _corpus_dir: tempfile::TempDir,
}

async fn start_server(corpus: &str, strict: bool) -> TestServer {
    let corpus_dir = tempfile::tempdir().unwrap();
    std::fs::write(corpus_dir.path().join("replay.yaml"), corpus).unwrap();

    let key_format = KeyFormat::parse("{url}").unwrap();
    let loaded = load_corpus(corpus_dir.path(), &key_format).unwrap();
    let mut catalog = loaded.catalog;
    catalog.finalize();

    let engine = Arc::new(Engine::new(catalog, key_format, strict));
    let pool = WorkerPool::new(8);
    let (shutdown_handle, shutdown) = shutdown_channel();

    let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tokio::spawn(accept_loop(
        listener,
        ListenKind::Http,
        engine.clone(),
        None,
        pool.clone(),
        shutdown,
    ));

    TestServer {
        engine,
        addr,
        shutdown: shutdown_handle,
        pool,
        acceptor,
        _corpus_dir: corpus_dir,
    }
}

impl TestServer {
    async fn stop(self) -> i32 {
        self.shutdown.trigger();
        let _ = self.acceptor.await;
        self.pool.join().await;
        self.engine.exit_code()
    }
}

/// Read one response: headers plus a Content-Length delimited body.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut wire = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let header_end = wire.windows(4).position(|w| w == b"\r\n\r\n");
        if let Some(end) = header_end {
            let head = String::from_utf8_lossy(&wire[..end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if wire.len() >= end + 4 + length {
                return String::from_utf8_lossy(&wire[..end + 4 + length]).to_string();
            }
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        if n == 0 {
            return String::from_utf8_lossy(&wire).to_string();
        }
        wire.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn recorded_response_is_replayed_byte_for_byte() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nX-Proxy: expected\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.contains("X-Recorded: yes\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"));
    drop(stream);

    assert_eq!(server.stop().await, 0);
}

#[tokio::test]
async fn unknown_key_gets_a_404_and_the_connection_closes() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    // The 404 is terminal, so the whole exchange is readable to EOF.
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    let response = String::from_utf8_lossy(&wire);
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Content-Length: 0\r\n"));

    assert_eq!(server.stop().await, 1);
}

#[tokio::test]
async fn head_keeps_the_recorded_length_but_sends_no_body() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"HEAD /x HTTP/1.1\r\nHost: h\r\nX-Proxy: expected\r\n\r\n")
        .await
        .unwrap();

    // Read the header block, then confirm no body follows.
    let mut wire = Vec::new();
    let mut chunk = [0u8; 1024];
    while !wire.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before the header block");
        wire.extend_from_slice(&chunk[..n]);
    }
    let response = String::from_utf8_lossy(&wire).to_string();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("\r\n\r\n"), "HEAD response carried a body");

    let trailing = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut chunk)).await;
    assert!(trailing.is_err(), "unexpected bytes after the HEAD response");

    // The connection stays open; a pipelined request still works.
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nX-Proxy: expected\r\n\r\n")
        .await
        .unwrap();
    let second = read_response(&mut stream).await;
    assert!(second.ends_with("hello"));
    drop(stream);

    assert_eq!(server.stop().await, 0);
}

#[tokio::test]
async fn expect_continue_gets_an_interim_response_before_the_body_is_read() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\nExpect: 100-continue\r\n\r\n",
        )
        .await
        .unwrap();

    let mut wire = Vec::new();
    let mut chunk = [0u8; 1024];
    while !wire.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        wire.extend_from_slice(&chunk[..n]);
    }
    assert!(String::from_utf8_lossy(&wire).starts_with("HTTP/1.1 100 continue\r\n"));

    stream.write_all(b"0123456789").await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(response.ends_with("done"));
    drop(stream);

    assert_eq!(server.stop().await, 0);
}

#[tokio::test]
async fn body_content_mismatch_sets_the_exit_code() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\nXXXXXXXXXX")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    // The mismatch is recorded but the recorded response still goes out.
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    drop(stream);

    assert_eq!(server.stop().await, 1);
}

#[tokio::test]
async fn header_verification_failure_flags_but_keeps_serving() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nX-Proxy: wrong\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut stream).await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

    // Same connection still serves the next request.
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nX-Proxy: expected\r\n\r\n")
        .await
        .unwrap();
    let second = read_response(&mut stream).await;
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    drop(stream);

    assert_eq!(server.stop().await, 1);
}

#[tokio::test]
async fn strict_mode_promotes_recorded_fields() {
    let strict_corpus = r#"
sessions:
- transactions:
  - client-request:
      method: GET
      url: /strict
    proxy-request:
      headers:
        fields:
        - [ X-Token, secret ]
    server-response:
      status: 200
      content:
        data: ok
"#;
    // Without strict the unruled X-Token is ignored.
    let server = start_server(strict_corpus, false).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /strict HTTP/1.1\r\nHost: h\r\nX-Token: other\r\n\r\n")
        .await
        .unwrap();
    read_response(&mut stream).await;
    drop(stream);
    assert_eq!(server.stop().await, 0);

    // Under strict it is checked for equality.
    let server = start_server(strict_corpus, true).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /strict HTTP/1.1\r\nHost: h\r\nX-Token: other\r\n\r\n")
        .await
        .unwrap();
    read_response(&mut stream).await;
    drop(stream);
    assert_eq!(server.stop().await, 1);
}

#[tokio::test]
async fn per_response_delay_is_honored() {
    let server = start_server(CORPUS, false).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let started = Instant::now();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.ends_with("eventually"));
    assert!(started.elapsed() >= Duration::from_millis(80));
    drop(stream);

    assert_eq!(server.stop().await, 0);
}

#[tokio::test]
async fn shutdown_drains_and_joins_within_the_poll_interval() {
    let server = start_server(CORPUS, false).await;

    // An idle keep-alive connection is parked in a worker.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), server.stop())
        .await
        .expect("shutdown did not drain in time");
    assert_eq!(stopped, 0);
    drop(stream);
}
