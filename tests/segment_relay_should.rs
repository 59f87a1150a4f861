use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use stream_proxy::server::error::UpstreamError;
use stream_proxy::server::services::relay_services::{DEFAULT_SEGMENT_CONTENT_TYPE, RelayService};
use stream_proxy::server::services::session_services::{DynSessionCache, SessionCache};
use stream_proxy::server::services::{ClientStrategy, UpstreamClientFactory};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn relay_with_timeout(strategies: &[ClientStrategy], timeout: Duration) -> RelayService {
    let sessions = Arc::new(SessionCache::new(Duration::from_secs(300), timeout)) as DynSessionCache;
    let upstream =
        Arc::new(UpstreamClientFactory::with_strategies(sessions, strategies, timeout).unwrap());
    RelayService::new(upstream)
}

fn relay_with(strategies: &[ClientStrategy]) -> RelayService {
    relay_with_timeout(strategies, Duration::from_secs(5))
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
    }
}

/// one-shot http/1.1 origin on a raw socket, for bodies wiremock can't pace
async fn raw_origin<F, Fut>(serve: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        serve(socket).await;
    });

    format!("http://{}/seg.ts", addr)
}

fn relay() -> RelayService {
    relay_with(&[ClientStrategy::Browser, ClientStrategy::Plain])
}

#[tokio::test]
async fn test_segment_bytes_are_streamed_through() {
    let server = MockServer::start().await;
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

    Mock::given(method("GET"))
        .and(path("/seg-1.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "video/iso.segment")
                .set_body_bytes(payload.clone()),
        )
        .mount(&server)
        .await;

    let resource = relay()
        .relay(&format!("{}/seg-1.ts", server.uri()), None, None, None)
        .await
        .unwrap();

    assert_eq!(resource.status.as_u16(), 200);
    assert_eq!(resource.content_type, "video/iso.segment");
    assert_eq!(resource.content_length, Some(payload.len() as u64));

    let mut body = resource.body;
    let mut received = Vec::new();
    while let Some(chunk) = body.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }

    assert_eq!(received, payload);
    assert_eq!(body.bytes_sent(), payload.len() as u64);
}

#[tokio::test]
async fn test_missing_content_type_defaults_to_mpeg_ts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 188]))
        .mount(&server)
        .await;

    let resource = relay()
        .relay(&format!("{}/seg.ts", server.uri()), None, None, None)
        .await
        .unwrap();

    assert_eq!(resource.content_type, DEFAULT_SEGMENT_CONTENT_TYPE);
}

#[tokio::test]
async fn test_upstream_403_is_reported_before_any_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&server)
        .await;

    let result = relay_with(&[ClientStrategy::Browser])
        .relay(&format!("{}/seg.ts", server.uri()), None, None, None)
        .await;

    match result {
        Err(UpstreamError::Status { status, .. }) => assert_eq!(status.as_u16(), 403),
        Err(other) => panic!("expected a 403 status error, got {}", other),
        Ok(_) => panic!("expected a 403 status error, got a body"),
    }
}

#[tokio::test]
async fn test_plain_strategy_is_tried_after_browser_fails() {
    let server = MockServer::start().await;
    // the browser client is the one sending Accept-Language
    Mock::given(method("GET"))
        .and(header("Accept-Language", "en-US,en;q=0.9"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let resource = relay()
        .relay(&format!("{}/seg.ts", server.uri()), None, None, None)
        .await
        .unwrap();

    assert_eq!(resource.status.as_u16(), 200);
}

#[tokio::test]
async fn test_range_referer_and_origin_are_forwarded() {
    let server = MockServer::start().await;
    let referer = format!("{}/watch", server.uri());

    Mock::given(method("GET"))
        .and(path("/watch"))
        .respond_with(ResponseTemplate::new(200).insert_header("Set-Cookie", "sid=seek"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie.mp4"))
        .and(header("Range", "bytes=0-3"))
        .and(header("Referer", referer.as_str()))
        .and(header("Origin", "https://site.example"))
        .and(header("Cookie", "sid=seek"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Type", "video/mp4")
                .insert_header("Content-Range", "bytes 0-3/100")
                .set_body_bytes(b"abcd".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resource = relay()
        .relay(
            &format!("{}/movie.mp4", server.uri()),
            Some(&referer),
            Some("https://site.example"),
            Some("bytes=0-3"),
        )
        .await
        .unwrap();

    assert_eq!(resource.status.as_u16(), 206);
    assert_eq!(resource.content_type, "video/mp4");
    assert_eq!(resource.content_range.as_deref(), Some("bytes 0-3/100"));
}

#[tokio::test]
async fn test_slow_segment_outlives_the_upstream_timeout() {
    // 10 chunks 200ms apart, twice the 1s timeout end to end but never idle that long
    let url = raw_origin(|mut socket| async move {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\nContent-Type: video/mp2t\r\n\r\n")
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            socket.write_all(&[0x47u8; 1000]).await.unwrap();
        }
        socket.flush().await.unwrap();
    })
    .await;

    let resource = relay_with_timeout(&[ClientStrategy::Plain], Duration::from_secs(1))
        .relay(&url, None, None, None)
        .await
        .unwrap();

    let mut body = resource.body;
    let mut received = 0usize;
    while let Some(chunk) = body.next().await {
        received += chunk.unwrap().len();
    }

    assert_eq!(received, 10_000);
    assert_eq!(body.bytes_sent(), 10_000);
}

#[tokio::test]
async fn test_dropping_the_body_closes_the_upstream_connection() {
    let (closed_tx, closed_rx) = oneshot::channel();

    let url = raw_origin(|mut socket| async move {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1073741824\r\nContent-Type: video/mp2t\r\n\r\n")
            .await
            .unwrap();
        // keeps feeding until the client side goes away
        loop {
            if socket.write_all(&[0x47u8; 8192]).await.is_err() {
                let _ = closed_tx.send(());
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    let resource = relay_with(&[ClientStrategy::Plain])
        .relay(&url, None, None, None)
        .await
        .unwrap();

    let mut body = resource.body;
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());

    drop(body);

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx).await;
    assert!(
        matches!(closed, Ok(Ok(()))),
        "upstream kept writing after the client went away"
    );
}
