// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sipwire_parse::StreamParser;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::conn::{Connection, ConnectionKey, IO_TIMEOUT};
use crate::{Inbound, TransportError, TransportKind};

/// Idle lifetime of a pooled connection; one hour without I/O evicts it.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

/// How often the sweeper looks for idle connections.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct PoolEntry {
    conn: Arc<Connection>,
    last_used: Instant,
    /// `None` for listening sockets, which never expire.
    ttl: Option<Duration>,
    tasks: Vec<AbortHandle>,
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.conn.close();
    }
}

/// Live connections keyed by [`ConnectionKey`].
///
/// Each registered connection gets a reader task that feeds parsed messages
/// into the pool-wide inbound channel and fatal read errors into the errors
/// channel. Dialed and accepted stream connections carry an idle TTL;
/// listening sockets do not.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    conns: DashMap<ConnectionKey, PoolEntry>,
    raw_tx: mpsc::Sender<Inbound>,
    err_tx: mpsc::Sender<TransportError>,
    idle_ttl: Duration,
}

impl ConnectionPool {
    pub fn new(raw_tx: mpsc::Sender<Inbound>, err_tx: mpsc::Sender<TransportError>) -> Self {
        Self::with_idle_ttl(raw_tx, err_tx, DEFAULT_IDLE_TTL)
    }

    /// Pool with a custom idle TTL (test hook).
    pub fn with_idle_ttl(
        raw_tx: mpsc::Sender<Inbound>,
        err_tx: mpsc::Sender<TransportError>,
        idle_ttl: Duration,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            conns: DashMap::new(),
            raw_tx,
            err_tx,
            idle_ttl,
        });

        // The sweeper holds only a weak reference so it exits once every
        // pool handle is gone.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL.min(idle_ttl));
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.conns.retain(|key, entry| match entry.ttl {
                    Some(ttl) if entry.last_used.elapsed() > ttl => {
                        debug!(%key, "evicting idle connection");
                        false
                    }
                    _ => true,
                });
            }
        });

        Self { inner }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.conns.is_empty()
    }

    /// Registers a connection and spawns its reader. Listening sockets pass
    /// `expires = false` so they never idle out.
    pub fn register(&self, conn: Arc<Connection>, kind: TransportKind, expires: bool) {
        let key = conn.key();
        let reader = self.spawn_reader(conn.clone(), kind);
        let entry = PoolEntry {
            conn,
            last_used: Instant::now(),
            ttl: expires.then_some(self.inner.idle_ttl),
            tasks: vec![reader],
        };
        if let Some(old) = self.inner.conns.insert(key, entry) {
            debug!(%key, "replacing pooled connection #{}", old.conn.id());
        }
    }

    /// Looks up a live connection.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.inner.conns.get(key).map(|entry| entry.conn.clone())
    }

    /// Returns the first packet socket, which serves all UDP peers.
    pub fn any_packet_socket(&self) -> Option<Arc<Connection>> {
        self.inner
            .conns
            .iter()
            .find(|entry| !entry.conn.streamed())
            .map(|entry| entry.conn.clone())
    }

    /// Returns the pooled stream connection for `addr`, dialing a new one
    /// if absent.
    pub async fn get_or_connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, TransportError> {
        let key = ConnectionKey::Remote(addr);
        if let Some(conn) = self.get(&key) {
            if !conn.is_closed() {
                self.touch(&key);
                return Ok(conn);
            }
            self.evict(&key);
        }

        let stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Resolve(format!("connect timeout to {}", addr)))?
            .map_err(|e| TransportError::Resolve(format!("connect to {}: {}", addr, e)))?;
        let conn = Arc::new(
            Connection::tcp(stream).map_err(|e| TransportError::Resolve(e.to_string()))?,
        );
        debug!(peer = %addr, id = conn.id(), "dialed outbound tcp connection");
        self.register(conn.clone(), TransportKind::Tcp, true);
        Ok(conn)
    }

    /// Refreshes the idle clock of a connection.
    pub fn touch(&self, key: &ConnectionKey) {
        if let Some(mut entry) = self.inner.conns.get_mut(key) {
            entry.last_used = Instant::now();
        }
    }

    /// Removes a connection, aborting its reader.
    pub fn evict(&self, key: &ConnectionKey) {
        self.inner.conns.remove(key);
    }

    /// Closes every connection and aborts every reader.
    pub fn close_all(&self) {
        self.inner.conns.clear();
    }

    fn spawn_reader(&self, conn: Arc<Connection>, kind: TransportKind) -> AbortHandle {
        let pool = self.clone();
        if conn.streamed() {
            tokio::spawn(async move { pool.stream_reader(conn, kind).await }).abort_handle()
        } else {
            tokio::spawn(async move { pool.packet_reader(conn, kind).await }).abort_handle()
        }
    }

    async fn stream_reader(&self, conn: Arc<Connection>, kind: TransportKind) {
        let key = conn.key();
        let raddr = match conn.remote_addr() {
            Some(raddr) => raddr,
            None => return,
        };
        let mut parser = StreamParser::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %raddr, "stream closed by peer");
                    self.evict(&key);
                    return;
                }
                Ok(n) => {
                    self.touch(&key);
                    parser.feed(&buf[..n]);
                    loop {
                        match parser.next_message() {
                            Ok(Some(msg)) => {
                                let inbound = Inbound {
                                    msg,
                                    kind,
                                    laddr: conn.local_addr(),
                                    raddr,
                                };
                                if self.inner.raw_tx.send(inbound).await.is_err() {
                                    self.evict(&key);
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(peer = %raddr, error = %e, "dropping malformed stream frame");
                                let _ = self.inner.err_tx.send(e.into()).await;
                            }
                        }
                    }
                }
                // An idle deadline is not a broken socket; the TTL sweeper
                // decides when an idle connection dies.
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    if !conn.is_closed() {
                        warn!(peer = %raddr, error = %e, "stream read failed; evicting connection");
                        let _ = self.inner.err_tx.send(e.into()).await;
                    }
                    self.evict(&key);
                    return;
                }
            }
        }
    }

    async fn packet_reader(&self, conn: Arc<Connection>, kind: TransportKind) {
        let key = conn.key();
        let mut buf = vec![0u8; 65_535];
        loop {
            match conn.read_from(&mut buf).await {
                Ok((n, raddr)) => {
                    self.touch(&key);
                    match sipwire_parse::parse_message(&buf[..n]) {
                        Ok(msg) => {
                            let inbound = Inbound {
                                msg,
                                kind,
                                laddr: conn.local_addr(),
                                raddr,
                            };
                            if self.inner.raw_tx.send(inbound).await.is_err() {
                                self.evict(&key);
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(peer = %raddr, error = %e, "dropping malformed datagram");
                        }
                    }
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    if conn.is_closed() {
                        self.evict(&key);
                        return;
                    }
                    // Datagram sockets surface transient errors (ICMP port
                    // unreachable from an earlier send); keep serving.
                    debug!(error = %e, "transient packet socket error");
                }
            }
        }
    }
}
