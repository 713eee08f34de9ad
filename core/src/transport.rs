//! Transport bindings: one bidirectional byte channel behind a uniform API.
//!
//! The host side talks to UNIX sockets created by QEMU, the guest side to a
//! virtio-serial character device (see `parley-guest`). Both only need to
//! move bytes; framing lives in [`crate::connection`].

use crate::error::TransportError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

const READ_CHUNK: usize = 64 * 1024;

#[async_trait]
pub trait Transport: Send {
    /// Write all of `data`, handling partial writes.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait for at least one byte, up to `timeout` (`None` waits forever).
    ///
    /// Must be cancel-safe: when the future is dropped before it completes,
    /// no data may be lost.
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human readable description used in logs.
    fn label(&self) -> &str;
}

/// Transport over any tokio byte stream (UNIX sockets, in-memory pipes).
pub struct StreamTransport<S> {
    stream: S,
    label: String,
    closed: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            label: label.into(),
            closed: false,
        }
    }
}

impl StreamTransport<UnixStream> {
    pub async fn connect_unix(path: &Path) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to UNIX socket {}", path.display());
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream, format!("UNIX socket {}", path.display())))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        tracing::trace!("Writing {} bytes to {}", data.len(), self.label);
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut buf = vec![0u8; READ_CHUNK];
        let read = self.stream.read(&mut buf);
        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => read.await?,
        };
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        tracing::trace!("Read {} bytes from {}", n, self.label);
        Ok(buf)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a, "left");
        let mut right = StreamTransport::new(b, "right");

        left.send(b"ping").await.unwrap();
        let data = right.receive(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(data, b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a, "left");
        let result = left.receive(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a, "left");
        drop(b);
        let result = left.receive(None).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_rejects_further_use() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut left = StreamTransport::new(a, "left");
        left.close().await.unwrap();
        assert!(matches!(left.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(left.receive(None).await, Err(TransportError::Closed)));
    }
}
