//! WebSocket transport
//!
//! Carries the framed byte stream inside binary WebSocket messages, which
//! lets the tunnel pass HTTP-only middleboxes. The client side optionally
//! reaches the server through an HTTP CONNECT proxy and presents a
//! configurable User-Agent.

use super::{BoxedRead, BoxedWrite, TransportError, TunnelRead, TunnelWrite};
use crate::config::HostInfo;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Read half: reassembles the byte stream from binary messages.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    buf: BytesMut,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TunnelRead for WsReader<S> {
    async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        while self.buf.len() < out.len() {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.buf.extend_from_slice(&data),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "websocket closed"))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
        let chunk = self.buf.split_to(out.len());
        out.copy_from_slice(&chunk);
        Ok(())
    }
}

/// Write half: one binary message per transport write.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TunnelWrite for WsWriter<S> {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.sink
            .send(Message::Binary(buf.to_vec()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.sink.close().await.ok();
        Ok(())
    }
}

fn split_ws<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    ws: WebSocketStream<S>,
) -> (BoxedRead, BoxedWrite) {
    let (sink, stream) = ws.split();
    (
        Box::new(WsReader {
            stream,
            buf: BytesMut::new(),
        }),
        Box::new(WsWriter { sink }),
    )
}

/// Accept the server side of a WebSocket tunnel connection.
pub async fn accept_ws(stream: TcpStream) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    stream.set_nodelay(true).ok();
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(split_ws(ws))
}

/// Dial a WebSocket tunnel endpoint, optionally through an HTTP CONNECT
/// proxy.
pub async fn connect_ws(
    server: &HostInfo,
    user_agent: &str,
    proxy: Option<&str>,
) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    let addr = server.to_addr();
    let stream = match proxy {
        Some(proxy_addr) => connect_via_proxy(proxy_addr, &addr).await?,
        None => TcpStream::connect(&addr).await?,
    };
    stream.set_nodelay(true).ok();

    let path = if server.path.is_empty() { "/" } else { &server.path };
    let uri = format!("ws://{}{}", addr, path);
    let mut request = Request::get(uri)
        .body(())
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    let bad_header = |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
        TransportError::WebSocket(e.to_string())
    };
    let headers = request.headers_mut();
    headers.insert("Host", HeaderValue::from_str(&addr).map_err(bad_header)?);
    headers.insert("User-Agent", HeaderValue::from_str(user_agent).map_err(bad_header)?);
    headers.insert("Connection", HeaderValue::from_static("Upgrade"));
    headers.insert("Upgrade", HeaderValue::from_static("websocket"));
    headers.insert("Sec-WebSocket-Version", HeaderValue::from_static("13"));
    headers.insert(
        "Sec-WebSocket-Key",
        HeaderValue::from_str(&generate_key()).map_err(bad_header)?,
    );

    let (ws, _resp) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    debug!("websocket established to {}", addr);
    Ok(split_ws(ws))
}

/// CONNECT through an HTTP proxy and hand back the raw stream.
async fn connect_via_proxy(proxy: &str, target: &str) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(TransportError::ConnectionFailed(
                "oversized proxy response".to_string(),
            ));
        }
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
    }

    let status = String::from_utf8_lossy(&response);
    let ok = status
        .lines()
        .next()
        .is_some_and(|line| line.contains(" 200"));
    if !ok {
        return Err(TransportError::ConnectionFailed(format!(
            "proxy refused CONNECT: {}",
            status.lines().next().unwrap_or("")
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ws_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut rh, mut wh) = accept_ws(socket).await.unwrap();
            let mut buf = [0u8; 16];
            rh.read_exact(&mut buf).await.unwrap();
            wh.write_all(&buf).await.unwrap();
        });

        let host = HostInfo::new("ws://", "127.0.0.1", addr.port(), "/");
        let (mut rh, mut wh) = connect_ws(&host, "burrow-test", None).await.unwrap();

        wh.write_all(b"websocket bytes!").await.unwrap();
        let mut buf = [0u8; 16];
        rh.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"websocket bytes!");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_read_reassembles_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (_rh, mut wh) = accept_ws(socket).await.unwrap();
            // Two small messages; the client reads them as one byte run.
            wh.write_all(b"first-").await.unwrap();
            wh.write_all(b"second").await.unwrap();
        });

        let host = HostInfo::new("ws://", "127.0.0.1", addr.port(), "/");
        let (mut rh, _wh) = connect_ws(&host, "burrow-test", None).await.unwrap();

        let mut buf = [0u8; 12];
        rh.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first-second");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_via_proxy() {
        // Target echo endpoint.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        // Minimal CONNECT proxy.
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = proxy.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                socket.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            let line = String::from_utf8(request).unwrap();
            let target = line.split_whitespace().nth(1).unwrap().to_string();
            let mut upstream = TcpStream::connect(&target).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            tokio::io::copy_bidirectional(&mut socket, &mut upstream)
                .await
                .ok();
        });

        let mut stream = connect_via_proxy(&proxy_addr.to_string(), &target_addr.to_string())
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
