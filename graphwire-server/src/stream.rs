//! Byte stream carrying a connection, plain or TLS.

use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pin_project! {
    /// A client socket, optionally wrapped in TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Wraps a freshly accepted socket, running the TLS handshake when an
    /// acceptor is configured.
    pub async fn accept(socket: TcpStream, tls: Option<&TlsAcceptor>) -> io::Result<Self> {
        socket.set_nodelay(true)?;
        match tls {
            Some(acceptor) => Ok(ClientStream::Tls {
                inner: acceptor.accept(socket).await?,
            }),
            None => Ok(ClientStream::Plain { inner: socket }),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ClientStream::Plain { inner } => inner.peer_addr(),
            ClientStream::Tls { inner } => inner.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { inner } => inner.poll_read(cx, buf),
            ClientStreamProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { inner } => inner.poll_write(cx, buf),
            ClientStreamProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { inner } => inner.poll_flush(cx),
            ClientStreamProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { inner } => inner.poll_shutdown(cx),
            ClientStreamProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_stream_passthrough() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            socket.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = ClientStream::accept(socket, None).await.unwrap();
        assert!(!stream.is_tls());
        assert!(stream.peer_addr().is_ok());

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
