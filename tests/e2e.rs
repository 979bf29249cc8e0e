//! End-to-end coverage of the six concrete scenarios spec'd for the
//! connection handler, driven over real loopback sockets the way hyper's
//! own `tests/server.rs` and `tests/client.rs` drive a live `Conn`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use cacherelay::cache::NullCacheClient;
use cacherelay::conn::ConnectionHandler;
use support::{tcp_pair, MemoryCacheClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// 1. Plain miss: client gets the unmodified origin bytes, the body ends
/// up written to the cache under the request's URL.
#[tokio::test]
async fn plain_miss_forwards_origin_bytes_and_writes_cache() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(MemoryCacheClient::new());

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache.clone());
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    client_side.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

    let mut req_buf = vec![0u8; 256];
    let n = origin_side.read(&mut req_buf).await.unwrap();
    assert!(std::str::from_utf8(&req_buf[..n]).unwrap().starts_with("GET /a HTTP/1.1"));

    origin_side
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB")
        .await
        .unwrap();
    origin_side.shutdown().await.unwrap();

    let mut resp = Vec::new();
    client_side.read_to_end(&mut resp).await.unwrap();
    assert!(resp.ends_with(b"BBBB"));

    handler_task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.stored("http://h/a").as_deref(), Some(&b"BBBB"[..]));
}

/// 2. Checksum match: the cache already holds the same bytes the origin is
/// about to send back, so the client's body is delivered straight from
/// the cache-backed stream rather than by copying the origin's own bytes.
#[tokio::test]
async fn checksum_match_serves_body_from_cache() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(MemoryCacheClient::new());
    cache.seed("http://h/a", b"BBBB");

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache.clone());
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    client_side.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

    let mut req_buf = vec![0u8; 256];
    let _ = origin_side.read(&mut req_buf).await.unwrap();
    origin_side
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB")
        .await
        .unwrap();

    let mut resp = vec![0u8; 256];
    let mut total = 0;
    while total < "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB".len() {
        let n = client_side.read(&mut resp[total..]).await.unwrap();
        assert!(n > 0, "connection closed before full response arrived");
        total += n;
    }
    assert!(resp[..total].ends_with(b"BBBB"));
    // Cache content is unchanged: a hit never rewrites the object.
    assert_eq!(cache.stored("http://h/a").as_deref(), Some(&b"BBBB"[..]));

    handler_task.abort();
}

/// 3. Checksum mismatch: the cache holds stale bytes, so the handler
/// falls back to serving and re-storing the origin's current bytes.
#[tokio::test]
async fn checksum_mismatch_reopens_cache_for_write() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(MemoryCacheClient::new());
    cache.seed("http://h/a", b"CCCC");

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache.clone());
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    client_side.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

    let mut req_buf = vec![0u8; 256];
    let _ = origin_side.read(&mut req_buf).await.unwrap();
    origin_side
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB")
        .await
        .unwrap();
    origin_side.shutdown().await.unwrap();

    let mut resp = Vec::new();
    client_side.read_to_end(&mut resp).await.unwrap();
    assert!(resp.ends_with(b"BBBB"));

    handler_task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.stored("http://h/a").as_deref(), Some(&b"BBBB"[..]));
}

/// 4. A ranged response keeps the transaction in its ordinary,
/// non-tunneled path: the body still reaches the client untouched and
/// still gets cached, rather than being forced into a blind tunnel.
#[tokio::test]
async fn range_response_is_cached_and_forwarded_untouched() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(MemoryCacheClient::new());

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache.clone());
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    client_side
        .write_all(b"GET /v HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\n\r\n")
        .await
        .unwrap();

    let mut req_buf = vec![0u8; 256];
    let n = origin_side.read(&mut req_buf).await.unwrap();
    assert!(std::str::from_utf8(&req_buf[..n]).unwrap().contains("Range: bytes=10-19"));

    origin_side
        .write_all(b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\nContent-Range: bytes 10-19/100\r\n\r\n0123456789")
        .await
        .unwrap();
    origin_side.shutdown().await.unwrap();

    let mut resp = Vec::new();
    client_side.read_to_end(&mut resp).await.unwrap();
    assert!(resp.ends_with(b"0123456789"));

    handler_task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.stored("http://h/v").as_deref(), Some(&b"0123456789"[..]));
}

/// 5. A chunked response forces the transaction into `http_tunnel`: no
/// cache handle is ever opened, and the chunked bytes arrive at the
/// client exactly as the origin sent them.
#[tokio::test]
async fn chunked_response_tunnels_bytes_untouched() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(NullCacheClient);

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache);
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    client_side.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();

    let mut req_buf = vec![0u8; 256];
    let _ = origin_side.read(&mut req_buf).await.unwrap();

    let chunked_body = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nBBBB\r\n0\r\n\r\n";
    origin_side.write_all(chunked_body).await.unwrap();
    origin_side.shutdown().await.unwrap();

    let mut resp = Vec::new();
    client_side.read_to_end(&mut resp).await.unwrap();
    assert_eq!(resp, chunked_body);

    handler_task.abort();
}

/// 6. The origin talking before any request has gone out is never valid
/// for a forward-proxy leg: the handler gives up HTTP framing and
/// degrades to a raw byte pipe, so later bytes on either leg still cross
/// untouched.
#[tokio::test]
async fn server_talks_first_falls_back_to_blind_tunnel() {
    let (client_side, client_handler_side) = tcp_pair().await;
    let (origin_handler_side, mut origin_side) = tcp_pair().await;
    let cache = Arc::new(NullCacheClient);

    let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache);
    let handler_task = tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let mut client_side = client_side;
    // The origin speaks before the client has sent a byte.
    origin_side.write_all(b"X").await.unwrap();

    let mut one = [0u8; 1];
    client_side.read_exact(&mut one).await.unwrap();
    assert_eq!(&one, b"X");

    // Now that the handler has fallen into a blind tunnel, further bytes
    // on either leg still cross untouched.
    client_side.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    origin_side.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    handler_task.abort();
}
