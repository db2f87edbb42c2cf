//! Byte-stream links between host and device.
//!
//! The protocol needs nothing but an ordered byte stream, so a [`Link`] is any
//! tokio reader/writer. Two concrete links ship with the crate:
//!
//! - [`LocalLink`]: in-memory pipe for tests and single-process simulation
//! - [`TcpLink`]: TCP connection, e.g. to a serial bridge or `copro-device`

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bytes buffered in each direction of a [`LocalLink`] pair.
pub const LOCAL_BUFFER: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Ordered, reliable byte stream.
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// Forwards `AsyncRead`/`AsyncWrite` to the wrapped stream.
macro_rules! impl_link_io {
    ($link:ty) => {
        impl AsyncRead for $link {
            fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_read(cx, buf)
            }
        }

        impl AsyncWrite for $link {
            fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
                Pin::new(&mut self.inner).poll_write(cx, buf)
            }

            fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_flush(cx)
            }

            fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Pin::new(&mut self.inner).poll_shutdown(cx)
            }
        }
    };
}

/// One end of an in-memory link.
#[derive(Debug)]
pub struct LocalLink {
    inner: DuplexStream,
}

impl LocalLink {
    /// Two connected ends with the default buffer size.
    pub fn pair() -> (LocalLink, LocalLink) {
        Self::pair_with_buffer(LOCAL_BUFFER)
    }

    pub fn pair_with_buffer(capacity: usize) -> (LocalLink, LocalLink) {
        let (a, b) = tokio::io::duplex(capacity);
        (LocalLink { inner: a }, LocalLink { inner: b })
    }
}

impl_link_io!(LocalLink);

/// TCP connection with Nagle disabled.
#[derive(Debug)]
pub struct TcpLink {
    inner: TcpStream,
}

impl TcpLink {
    /// Connects to `addr`, giving up after a few seconds.
    pub async fn connect(addr: SocketAddr) -> io::Result<TcpLink> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Self::from_stream(stream)
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<TcpLink> {
        stream.set_nodelay(true)?;
        Ok(TcpLink { inner: stream })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl_link_io!(TcpLink);

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn local_pair_carries_bytes_both_ways() {
        let (mut host, mut device) = LocalLink::pair();
        host.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device.write_all(b"pong").await.unwrap();
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn dropping_one_end_is_eof() {
        let (host, mut device) = LocalLink::pair();
        drop(host);
        let mut buf = [0u8; 1];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tcp_link_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = TcpLink::from_stream(stream).unwrap();
            link.write_all(b"hi").await.unwrap();
        });

        let mut link = TcpLink::connect(addr).await.unwrap();
        let mut buf = [0u8; 2];
        link.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        accept.await.unwrap();
    }
}
