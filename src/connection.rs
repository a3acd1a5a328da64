//! Connection struct definition
//!
//! Represents one admitted client: its socket, peer address and the
//! session announced in its presence handshake.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::error::ConnError;
use crate::message::User;
use crate::types::ConnId;

/// Admitted client connection
///
/// Owned by the registry; dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    /// Stable identifier, the registry key
    pub id: ConnId,
    /// Remote address
    pub peer: SocketAddr,
    /// When the handshake completed
    pub accepted_at: Instant,
    /// Account and status from the latest presence
    pub user: User,
    stream: TcpStream,
}

impl Connection {
    /// Wrap a stream that completed its presence handshake
    pub fn new(id: ConnId, stream: TcpStream, peer: SocketAddr, user: User) -> Self {
        Self {
            id,
            peer,
            accepted_at: Instant::now(),
            user,
            stream,
        }
    }

    /// Get the display name for this connection
    pub fn display_name(&self) -> &str {
        &self.user.account_name
    }

    /// Wait until the socket is readable (data, EOF or error pending)
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.ready(Interest::READABLE).await.map(|_| ())
    }

    /// Whether a write would currently succeed without blocking
    ///
    /// Never waits. A readiness error counts as writable so the
    /// following write surfaces it.
    pub fn is_write_ready(&self) -> bool {
        match self.stream.ready(Interest::WRITABLE).now_or_never() {
            Some(Ok(ready)) => ready.is_writable() || ready.is_write_closed(),
            Some(Err(_)) => true,
            None => false,
        }
    }

    /// Read one payload without blocking
    ///
    /// Returns `Ok(None)` on a spurious wakeup and `Disconnected` on EOF.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>, ConnError> {
        match self.stream.try_read(buf) {
            Ok(0) => Err(ConnError::Disconnected),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one payload without blocking
    ///
    /// Returns `Ok(false)` if the socket would block; nothing was written.
    pub fn try_send(&self, payload: &[u8]) -> Result<bool, ConnError> {
        match self.stream.try_write(payload) {
            Ok(n) if n == payload.len() => Ok(true),
            Ok(written) => Err(ConnError::ShortWrite {
                written,
                len: payload.len(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A server-side connection and the client end of its socket
    pub(crate) async fn pair(account: &str) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let user = User {
            account_name: account.to_string(),
            status: None,
        };
        (Connection::new(ConnId::new(), stream, peer, user), client)
    }

    #[tokio::test]
    async fn test_connection_creation() {
        let (conn, _client) = pair("alice").await;
        assert_eq!(conn.display_name(), "alice");
        assert!(conn.peer.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_try_recv_after_readable() {
        let (conn, mut client) = pair("alice").await;
        client.write_all(b"{}").await.unwrap();

        conn.readable().await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.try_recv(&mut buf).unwrap();
        assert_eq!(n, Some(2));
    }

    #[tokio::test]
    async fn test_try_recv_eof_is_disconnect() {
        let (conn, client) = pair("alice").await;
        drop(client);

        conn.readable().await.unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            conn.try_recv(&mut buf),
            Err(ConnError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_try_send_delivers() {
        let (conn, mut client) = pair("alice").await;
        conn.stream.writable().await.unwrap();
        assert!(conn.try_send(b"hello").unwrap());
        assert!(conn.is_write_ready());

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
