// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Deadline applied to every individual socket operation.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// I/O failure on a connection, wrapped with enough context for the
/// transport layer to log it and decide retryability.
#[derive(Debug, Error)]
#[error("{op} on {network} connection #{id} (local {laddr}, remote {raddr:?}): {source}")]
pub struct ConnectionError {
    pub op: &'static str,
    pub network: &'static str,
    pub laddr: SocketAddr,
    pub raddr: Option<SocketAddr>,
    pub id: u64,
    #[source]
    pub source: io::Error,
}

impl ConnectionError {
    /// True when the failure was the per-operation deadline expiring rather
    /// than the socket breaking.
    pub fn is_timeout(&self) -> bool {
        self.source.kind() == io::ErrorKind::TimedOut
    }
}

/// Key under which a connection lives in the pool: stream connections are
/// found by peer, packet sockets by the local address that serves all peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Local(SocketAddr),
    Remote(SocketAddr),
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKey::Local(addr) => write!(f, "local:{}", addr),
            ConnectionKey::Remote(addr) => write!(f, "remote:{}", addr),
        }
    }
}

enum Socket {
    Udp(Arc<UdpSocket>),
    Tcp {
        read: Mutex<OwnedReadHalf>,
        write: Mutex<OwnedWriteHalf>,
    },
}

/// One network socket with a uniform read/write surface.
///
/// Stream connections use [`read`](Connection::read)/[`write`](Connection::write);
/// packet sockets use [`read_from`](Connection::read_from)/
/// [`write_to`](Connection::write_to), where the remote address is
/// per-datagram rather than connection-global. Every operation runs under a
/// fresh [`IO_TIMEOUT`] deadline. Writes on a stream serialize through the
/// write half's mutex, so one write is in flight per socket.
pub struct Connection {
    id: u64,
    laddr: SocketAddr,
    raddr: Option<SocketAddr>,
    socket: Socket,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps a bound UDP socket.
    pub fn udp(socket: Arc<UdpSocket>) -> io::Result<Self> {
        let laddr = socket.local_addr()?;
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            laddr,
            raddr: None,
            socket: Socket::Udp(socket),
            closed: AtomicBool::new(false),
        })
    }

    /// Wraps an established TCP stream (dialed or accepted).
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let laddr = stream.local_addr()?;
        let raddr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            laddr,
            raddr: Some(raddr),
            socket: Socket::Tcp {
                read: Mutex::new(read),
                write: Mutex::new(write),
            },
        closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True for stream (TCP) sockets.
    pub fn streamed(&self) -> bool {
        matches!(self.socket, Socket::Tcp { .. })
    }

    pub fn network(&self) -> &'static str {
        match self.socket {
            Socket::Udp(_) => "udp",
            Socket::Tcp { .. } => "tcp",
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    /// Remote address; `None` for packet sockets.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.raddr
    }

    /// Pool key: remote address for streams, local address for packet
    /// sockets (one socket serves all peers).
    pub fn key(&self) -> ConnectionKey {
        match self.raddr {
            Some(raddr) if self.streamed() => ConnectionKey::Remote(raddr),
            _ => ConnectionKey::Local(self.laddr),
        }
    }

    fn error(&self, op: &'static str, raddr: Option<SocketAddr>, source: io::Error) -> ConnectionError {
        ConnectionError {
            op,
            network: self.network(),
            laddr: self.laddr,
            raddr: raddr.or(self.raddr),
            id: self.id,
            source,
        }
    }

    fn check_open(&self, op: &'static str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.error(
                op,
                None,
                io::Error::new(io::ErrorKind::NotConnected, "connection closed"),
            ));
        }
        Ok(())
    }

    /// Reads from a stream connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.check_open("read")?;
        let Socket::Tcp { read, .. } = &self.socket else {
            return Err(self.error(
                "read",
                None,
                io::Error::new(io::ErrorKind::InvalidInput, "read on packet socket"),
            ));
        };
        let mut guard = read.lock().await;
        match timeout(IO_TIMEOUT, guard.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(self.error("read", None, e)),
            Err(_) => Err(self.error(
                "read",
                None,
                io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"),
            )),
        }
    }

    /// Receives one datagram from a packet socket.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), ConnectionError> {
        self.check_open("read")?;
        let Socket::Udp(socket) = &self.socket else {
            return Err(self.error(
                "read",
                None,
                io::Error::new(io::ErrorKind::InvalidInput, "read_from on stream socket"),
            ));
        };
        match timeout(IO_TIMEOUT, socket.recv_from(buf)).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => Err(self.error("read", None, e)),
            Err(_) => Err(self.error(
                "read",
                None,
                io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"),
            )),
        }
    }

    /// Writes a whole buffer to a stream connection.
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.check_open("write")?;
        let Socket::Tcp { write, .. } = &self.socket else {
            return Err(self.error(
                "write",
                None,
                io::Error::new(io::ErrorKind::InvalidInput, "write on packet socket"),
            ));
        };
        let mut guard = write.lock().await;
        let io = async {
            guard.write_all(data).await?;
            guard.flush().await
        };
        match timeout(IO_TIMEOUT, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.error("write", None, e)),
            Err(_) => Err(self.error(
                "write",
                None,
                io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"),
            )),
        }
    }

    /// Sends one datagram from a packet socket.
    pub async fn write_to(&self, data: &[u8], raddr: SocketAddr) -> Result<(), ConnectionError> {
        self.check_open("write")?;
        let Socket::Udp(socket) = &self.socket else {
            return Err(self.error(
                "write",
                Some(raddr),
                io::Error::new(io::ErrorKind::InvalidInput, "write_to on stream socket"),
            ));
        };
        match timeout(IO_TIMEOUT, socket.send_to(data, raddr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(self.error("write", Some(raddr), e)),
            Err(_) => Err(self.error(
                "write",
                Some(raddr),
                io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"),
            )),
        }
    }

    /// Marks the connection closed. Idempotent; the underlying socket is
    /// released when the last `Arc` drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("network", &self.network())
            .field("laddr", &self.laddr)
            .field("raddr", &self.raddr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_round_trip() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let conn_a = Connection::udp(a.clone()).unwrap();
        let conn_b = Connection::udp(b.clone()).unwrap();

        conn_a
            .write_to(b"ping", conn_b.local_addr())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = conn_b.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, conn_a.local_addr());
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = Connection::tcp(TcpStream::connect(addr).await.unwrap()).unwrap();
        let server = Connection::tcp(accept.await.unwrap()).unwrap();

        assert!(client.streamed());
        assert_eq!(client.key(), ConnectionKey::Remote(addr));

        client.write(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_io() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let conn = Connection::udp(socket).unwrap();
        conn.close();
        conn.close();
        let err = conn
            .write_to(b"x", "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.op, "write");
        assert_eq!(err.source.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn packet_key_is_local_addr() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let conn = Connection::udp(socket).unwrap();
            assert_eq!(conn.key(), ConnectionKey::Local(conn.local_addr()));
        });
    }
}
