#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use keel::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Default config bound to an ephemeral loopback port.
pub fn local_config() -> Config {
    let mut config = Config::default();
    config.server.addr = "127.0.0.1:0".into();
    config
}

/// One request over a fresh HTTP/1.1 connection.
pub async fn send(addr: SocketAddr, method: Method, path: &str) -> Result<Reply, hyper::Error> {
    send_with(addr, method, path, &[]).await
}

pub async fn send_with(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<Reply, hyper::Error> {
    exchange(addr, method, path, headers, Bytes::new()).await
}

pub async fn send_body(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: impl Into<Bytes>,
) -> Result<Reply, hyper::Error> {
    exchange(addr, method, path, &[], body.into()).await
}

async fn exchange(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> Result<Reply, hyper::Error> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(conn);

    let mut req = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", addr.to_string());
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let res = sender.send_request(req.body(Full::new(body)).unwrap()).await?;

    let (parts, body) = res.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Reply { status: parts.status, headers: parts.headers, body })
}

/// Writes `raw` on a fresh connection and reads until the response head is
/// complete.
pub async fn raw_head(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a response head");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("response head within 5s");
    String::from_utf8_lossy(&buf).into_owned()
}

/// Writes `raw` on a fresh connection and reads until the server closes it.
/// `None` if it is still open after `wait`.
pub async fn raw_until_close(addr: SocketAddr, raw: &[u8], wait: Duration) -> Option<String> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw).await.unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(wait, stream.read_to_end(&mut buf)).await.ok()?.ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}
