//! Transport layer
//!
//! The session core only needs a bidirectional byte stream with independent
//! read and write halves. [`TunnelRead`]/[`TunnelWrite`] are that seam;
//! implementations exist for plain TCP (any tokio `AsyncRead`/`AsyncWrite`)
//! and for WebSocket message streams.

pub mod ws;

pub use ws::{accept_ws, connect_ws};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Read half of a tunnel transport.
#[async_trait]
pub trait TunnelRead: Send {
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// Write half of a tunnel transport.
#[async_trait]
pub trait TunnelWrite: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Boxed transport halves as handed to the session core.
pub type BoxedRead = Box<dyn TunnelRead>;
pub type BoxedWrite = Box<dyn TunnelWrite>;

/// [`TunnelRead`] over any byte-stream reader.
pub struct IoReader<R>(pub R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TunnelRead for IoReader<R> {
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.0.read_exact(buf).await.map(|_| ())
    }
}

/// [`TunnelWrite`] over any byte-stream writer.
pub struct IoWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TunnelWrite for IoWriter<W> {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// Sentinel transport installed when reconnecting is abandoned. Every
/// operation fails, which drains the pipe tasks.
pub struct DummyStream;

#[async_trait]
impl TunnelRead for DummyStream {
    async fn read_exact(&mut self, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "dummy read"))
    }
}

#[async_trait]
impl TunnelWrite for DummyStream {
    async fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "dummy write"))
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Dial a TCP endpoint and split it into transport halves.
pub async fn dial_tcp(addr: &str) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    Ok(split_tcp(stream))
}

/// Split an accepted TCP stream into transport halves.
pub fn split_tcp(stream: TcpStream) -> (BoxedRead, BoxedWrite) {
    // Nagle hurts here: control frames and length prefixes are tiny.
    stream.set_nodelay(true).ok();
    let (rh, wh) = stream.into_split();
    (Box::new(IoReader(rh)), Box::new(IoWriter(wh)))
}
