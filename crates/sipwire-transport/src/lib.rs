// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Async SIP transport layer for UDP and TCP.
//!
//! One [`TransportLayer`] multiplexes any number of listening sockets and
//! outbound connections. Inbound messages from every socket fan in to a
//! single channel, annotated with their source [`Target`]; outbound
//! messages are routed per RFC 3261 §18 (top Via for responses, Route /
//! Request-URI for requests) and handed to the right protocol's
//! [`ConnectionPool`] entry.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use sipwire_core::{SipMessage, Via};
use sipwire_parse::{serialize_message, ParseError};

pub mod conn;
pub mod pool;

pub use conn::{Connection, ConnectionError, ConnectionKey, IO_TIMEOUT};
pub use pool::ConnectionPool;

/// Default SIP port used when neither the URI nor the Via carries one.
pub const DEFAULT_PORT: u16 = 5060;

/// Capacity of the fan-in and error channels.
const CHANNEL_CAPACITY: usize = 128;

/// Supported network protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    /// Parses a transport token from a Via header or `;transport=` param.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            _ => None,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }

    /// Uppercase transport token for Via headers.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }

    /// True for transports with ordered reliable delivery. Reliable
    /// transports suppress the retransmission timers of RFC 3261 §17.
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }

    /// True for stream-framed transports.
    pub fn is_stream(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to send a message: host, port, and network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: SmolStr,
    pub port: u16,
    pub kind: TransportKind,
}

impl Target {
    pub fn new(host: impl Into<SmolStr>, port: u16, kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    pub fn from_addr(addr: SocketAddr, kind: TransportKind) -> Self {
        Self {
            host: SmolStr::new(addr.ip().to_string()),
            port: addr.port(),
            kind,
        }
    }

    /// Resolves the target to a socket address. Only literal addresses and
    /// names the OS resolver answers locally (e.g. `localhost`) are
    /// supported; SRV/NAPTR lookup is out of scope.
    pub fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let host = self.host.trim_matches(|c| c == '[' || c == ']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (host, self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::Resolve(format!("{}:{}", self.host, self.port)))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.kind)
    }
}

/// Transport-level failures surfaced to the layers above.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(SmolStr),
    #[error("message carries no usable target: {0}")]
    NoTarget(String),
    #[error("cannot reach {0}")]
    Resolve(String),
    #[error("no bound {0} socket; listen first")]
    NotListening(&'static str),
    #[error("transport layer is shut down")]
    Stopped,
}

/// A message read off a socket, before transport-level post-processing.
pub struct Inbound {
    pub msg: SipMessage,
    pub kind: TransportKind,
    pub laddr: SocketAddr,
    pub raddr: SocketAddr,
}

struct LayerInner {
    host: SmolStr,
    pool: ConnectionPool,
    raw_tx: mpsc::Sender<Inbound>,
    msgs_rx: StdMutex<Option<mpsc::Receiver<(SipMessage, Target)>>>,
    errs_rx: StdMutex<Option<mpsc::Receiver<TransportError>>>,
    listeners: StdMutex<Vec<AbortHandle>>,
    listen_addrs: StdMutex<Vec<(TransportKind, SocketAddr)>>,
    local_ips: StdMutex<Vec<IpAddr>>,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// The transport layer: listening sockets, the connection pool, outbound
/// routing and the inbound fan-in.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<LayerInner>,
}

impl TransportLayer {
    /// Creates a transport layer for the given local host name or address.
    /// Must be called inside a tokio runtime; the fan-in task starts
    /// immediately.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        let host = host.into();
        let (raw_tx, mut raw_rx) = mpsc::channel::<Inbound>(CHANNEL_CAPACITY);
        let (msgs_tx, msgs_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (errs_tx, errs_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let pool = ConnectionPool::new(raw_tx.clone(), errs_tx.clone());
        let inner = Arc::new(LayerInner {
            host,
            pool,
            raw_tx,
            msgs_rx: StdMutex::new(Some(msgs_rx)),
            errs_rx: StdMutex::new(Some(errs_rx)),
            listeners: StdMutex::new(Vec::new()),
            listen_addrs: StdMutex::new(Vec::new()),
            local_ips: StdMutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            cancel_tx,
            done_rx,
        });

        let layer = Self {
            inner: inner.clone(),
        };
        let fanin = layer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = raw_rx.recv() => match inbound {
                        Some(inbound) => fanin.process_inbound(inbound, &msgs_tx).await,
                        None => break,
                    },
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            let _ = done_tx.send(true);
        });
        layer
    }

    /// The configured local host, used in sanity checks and Via building.
    pub fn host(&self) -> &SmolStr {
        &self.inner.host
    }

    /// Access to the connection pool (exposed for tests).
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// True when `kind` provides ordered reliable delivery.
    pub fn is_reliable(&self, kind: TransportKind) -> bool {
        kind.is_reliable()
    }

    /// Binds a local address for the given network and starts serving it.
    pub async fn listen(&self, kind: TransportKind, addr: &str) -> Result<(), TransportError> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::Resolve(addr.to_owned()))?;
        match kind {
            TransportKind::Udp => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|e| TransportError::Resolve(format!("bind {}: {}", addr, e)))?;
                let local = socket.local_addr().map_err(|e| {
                    TransportError::Resolve(format!("local addr of {}: {}", addr, e))
                })?;
                let conn = Arc::new(
                    Connection::udp(Arc::new(socket))
                        .map_err(|e| TransportError::Resolve(e.to_string()))?,
                );
                info!(%local, "listening (udp)");
                self.note_listen_addr(TransportKind::Udp, local);
                self.inner.pool.register(conn, TransportKind::Udp, false);
                Ok(())
            }
            TransportKind::Tcp => {
                let listener = bind_tcp(addr)?;
                let local = listener.local_addr().map_err(|e| {
                    TransportError::Resolve(format!("local addr of {}: {}", addr, e))
                })?;
                info!(%local, "listening (tcp)");
                self.note_listen_addr(TransportKind::Tcp, local);
                let pool = self.inner.pool.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted tcp connection");
                                match Connection::tcp(stream) {
                                    Ok(conn) => {
                                        pool.register(Arc::new(conn), TransportKind::Tcp, true)
                                    }
                                    Err(e) => warn!(%peer, error = %e, "accept setup failed"),
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "tcp accept error");
                            }
                        }
                    }
                })
                .abort_handle();
                self.inner.listeners.lock().unwrap().push(handle);
                Ok(())
            }
        }
    }

    /// Receiver of inbound messages annotated with their source. May be
    /// taken once.
    pub fn messages(&self) -> Option<mpsc::Receiver<(SipMessage, Target)>> {
        self.inner.msgs_rx.lock().unwrap().take()
    }

    /// Receiver of transport errors. May be taken once.
    pub fn errors(&self) -> Option<mpsc::Receiver<TransportError>> {
        self.inner.errs_rx.lock().unwrap().take()
    }

    /// Routes and transmits a message, returning the exact bytes and target
    /// used so retransmissions can repeat them verbatim.
    pub async fn send(&self, msg: &SipMessage) -> Result<(Bytes, Target), TransportError> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let target = select_target(msg)?;
        let bytes = serialize_message(msg);
        self.send_raw(&bytes, &target).await?;
        Ok((bytes, target))
    }

    /// Transmits already-serialized bytes to a known target.
    pub async fn send_raw(&self, bytes: &Bytes, target: &Target) -> Result<(), TransportError> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let addr = target.resolve()?;
        match target.kind {
            TransportKind::Udp => {
                let conn = self
                    .inner
                    .pool
                    .any_packet_socket()
                    .ok_or(TransportError::NotListening("udp"))?;
                conn.write_to(bytes, addr).await?;
                self.inner.pool.touch(&conn.key());
            }
            TransportKind::Tcp => {
                let conn = self.inner.pool.get_or_connect(addr).await?;
                conn.write(bytes).await?;
                self.inner.pool.touch(&conn.key());
            }
        }
        debug!(%target, len = bytes.len(), "sent message");
        Ok(())
    }

    /// Shuts the layer down: stops listeners, closes pooled connections and
    /// unblocks every reader.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("transport layer shutting down");
        for handle in self.inner.listeners.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.inner.pool.close_all();
        let _ = self.inner.cancel_tx.send(true);
    }

    /// Resolves when the fan-in task has drained after [`cancel`].
    pub async fn done(&self) {
        let mut done = self.inner.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// The first address bound for `kind`, if any.
    pub fn listen_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.inner
            .listen_addrs
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }

    fn note_listen_addr(&self, kind: TransportKind, addr: SocketAddr) {
        self.inner
            .listen_addrs
            .lock()
            .unwrap()
            .push((kind, addr));
        let mut ips = self.inner.local_ips.lock().unwrap();
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }

    /// Post-processes one message read off a socket and forwards it to the
    /// fan-in output.
    async fn process_inbound(&self, inbound: Inbound, msgs_tx: &mpsc::Sender<(SipMessage, Target)>) {
        let Inbound {
            mut msg,
            kind,
            laddr: _,
            raddr,
        } = inbound;

        match &mut msg {
            SipMessage::Request(req) => {
                // RFC 3261 §18.2.1 / RFC 3581: stamp the source on the top
                // Via so responses can be routed back.
                if let Some(mut via) = req.top_via() {
                    amend_via(&mut via, raddr);
                    req.headers_mut().set_top_via(&via);
                } else {
                    warn!(peer = %raddr, "dropping request without Via");
                    return;
                }
            }
            SipMessage::Response(res) => {
                // RFC 3261 §18.1.2: the top Via of a response must name us.
                let Some(via) = res.top_via() else {
                    warn!(peer = %raddr, "dropping response without Via");
                    return;
                };
                if !self.via_names_us(&via) {
                    warn!(
                        peer = %raddr,
                        sent_by = %via.sent_by(),
                        "dropping response whose top Via is not ours"
                    );
                    return;
                }
            }
        }

        let source = Target::from_addr(raddr, kind);
        debug!(%source, msg = %msg.short(), "received message");
        if msgs_tx.send((msg, source)).await.is_err() {
            debug!("inbound consumer gone; dropping message");
        }
    }

    fn via_names_us(&self, via: &Via) -> bool {
        let host = via.host.trim_matches(|c| c == '[' || c == ']');
        if host.eq_ignore_ascii_case(&self.inner.host) {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                let ips = self.inner.local_ips.lock().unwrap();
                ips.contains(&ip) || ip.is_loopback() || ip.is_unspecified()
            }
            Err(_) => false,
        }
    }
}

/// Adds `received`/`rport` to an inbound request's top Via (RFC 3581).
fn amend_via(via: &mut Via, raddr: SocketAddr) {
    let source_ip = raddr.ip().to_string();
    let sent_by_matches = via
        .host
        .trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map(|ip| ip == raddr.ip())
        .unwrap_or(false);
    if !sent_by_matches {
        via.set_param("received", Some(&source_ip));
    }
    if via.rport() == Some(None) {
        via.set_param("rport", Some(&raddr.port().to_string()));
    }
}

/// Picks the outbound target for a message per RFC 3261 §18.
///
/// Responses follow the top Via (`received`/`rport` first, then sent-by);
/// requests follow the first Route, then the Request-URI, with the network
/// taken from `;transport=` and defaulting to UDP.
pub fn select_target(msg: &SipMessage) -> Result<Target, TransportError> {
    match msg {
        SipMessage::Response(res) => {
            let via = res
                .top_via()
                .ok_or_else(|| TransportError::NoTarget("response without Via".into()))?;
            let kind = TransportKind::parse(&via.transport)
                .ok_or_else(|| TransportError::UnsupportedNetwork(via.transport.clone()))?;
            let host = via
                .received()
                .map(SmolStr::new)
                .unwrap_or_else(|| via.host.clone());
            let port = via
                .rport()
                .flatten()
                .or(via.port)
                .unwrap_or(DEFAULT_PORT);
            Ok(Target::new(host, port, kind))
        }
        SipMessage::Request(req) => {
            let uri = match req.headers().get("Route") {
                Some(route) => {
                    let first = sipwire_core::NameAddr::parse(route)
                        .map_err(|e| TransportError::NoTarget(format!("bad Route: {}", e)))?;
                    first.uri
                }
                None => req.uri().clone(),
            };
            let kind = match uri.transport_param() {
                Some(token) => TransportKind::parse(&token)
                    .ok_or(TransportError::UnsupportedNetwork(token))?,
                None => TransportKind::Udp,
            };
            Ok(Target::new(
                uri.host.clone(),
                uri.port.unwrap_or(DEFAULT_PORT),
                kind,
            ))
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        TcpListener::from_std(socket.into())
    };
    bind().map_err(|e| TransportError::Resolve(format!("bind {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};

    fn response_with_via(via: &str) -> SipMessage {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("CSeq", "1 OPTIONS");
        SipMessage::Response(Response::new(
            StatusLine::new(200, "OK"),
            headers,
            Bytes::new(),
        ))
    }

    fn request_to(uri: &str) -> SipMessage {
        SipMessage::Request(Request::new(
            RequestLine::new(Method::Options, SipUri::parse(uri).unwrap()),
            Headers::new(),
            Bytes::new(),
        ))
    }

    #[test]
    fn response_target_prefers_received_and_rport() {
        let msg = response_with_via(
            "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKa;received=192.0.2.7;rport=9001",
        );
        let target = select_target(&msg).unwrap();
        assert_eq!(target.host.as_str(), "192.0.2.7");
        assert_eq!(target.port, 9001);
        assert_eq!(target.kind, TransportKind::Udp);
    }

    #[test]
    fn response_target_falls_back_to_sent_by() {
        let msg = response_with_via("SIP/2.0/TCP client.example.com:5070;branch=z9hG4bKb");
        let target = select_target(&msg).unwrap();
        assert_eq!(target.host.as_str(), "client.example.com");
        assert_eq!(target.port, 5070);
        assert_eq!(target.kind, TransportKind::Tcp);
    }

    #[test]
    fn request_target_uses_request_uri_and_transport_param() {
        let target = select_target(&request_to("sip:bob@198.51.100.3:5080;transport=tcp")).unwrap();
        assert_eq!(target.host.as_str(), "198.51.100.3");
        assert_eq!(target.port, 5080);
        assert_eq!(target.kind, TransportKind::Tcp);
    }

    #[test]
    fn request_target_defaults_to_udp_5060() {
        let target = select_target(&request_to("sip:bob@198.51.100.3")).unwrap();
        assert_eq!(target.port, DEFAULT_PORT);
        assert_eq!(target.kind, TransportKind::Udp);
    }

    #[test]
    fn request_target_prefers_route_header() {
        let mut msg = request_to("sip:bob@example.com");
        msg.headers_mut()
            .push("Route", "<sip:203.0.113.1:5061;transport=tcp;lr>");
        let target = select_target(&msg).unwrap();
        assert_eq!(target.host.as_str(), "203.0.113.1");
        assert_eq!(target.port, 5061);
        assert_eq!(target.kind, TransportKind::Tcp);
    }

    #[test]
    fn amend_via_adds_received_when_hosts_differ() {
        let mut via =
            Via::parse("SIP/2.0/UDP client.example.com:9001;rport;branch=z9hG4bKc").unwrap();
        amend_via(&mut via, "192.0.2.9:40000".parse().unwrap());
        assert_eq!(via.received(), Some("192.0.2.9"));
        assert_eq!(via.rport(), Some(Some(40000)));
    }

    #[test]
    fn amend_via_skips_received_when_sent_by_matches() {
        let mut via = Via::parse("SIP/2.0/UDP 192.0.2.9:9001;branch=z9hG4bKd").unwrap();
        amend_via(&mut via, "192.0.2.9:9001".parse().unwrap());
        assert_eq!(via.received(), None);
        assert_eq!(via.rport(), None);
    }

    #[tokio::test]
    async fn udp_send_and_receive_round_trip() {
        let layer = TransportLayer::new("127.0.0.1");
        layer.listen(TransportKind::Udp, "127.0.0.1:0").await.unwrap();
        let mut messages = layer.messages().unwrap();

        // A plain socket plays the remote peer.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = layer.pool().any_packet_socket().unwrap().local_addr();
        let raw = format!(
            "OPTIONS sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKping;rport\r\n\
CSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n",
            peer.local_addr().unwrap().port()
        );
        peer.send_to(raw.as_bytes(), local).await.unwrap();

        let (msg, source) = messages.recv().await.unwrap();
        assert!(msg.is_request());
        assert_eq!(source.kind, TransportKind::Udp);
        assert_eq!(source.port, peer.local_addr().unwrap().port());
        // rport was filled with the observed source port.
        let via = msg.top_via().unwrap();
        assert_eq!(via.rport(), Some(Some(peer.local_addr().unwrap().port())));

        layer.cancel();
        layer.done().await;
    }

    #[tokio::test]
    async fn stray_response_with_foreign_via_is_dropped() {
        let layer = TransportLayer::new("127.0.0.1");
        layer.listen(TransportKind::Udp, "127.0.0.1:0").await.unwrap();
        let mut messages = layer.messages().unwrap();
        let local = layer.pool().any_packet_socket().unwrap().local_addr();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP elsewhere.example.com;branch=z9hG4bKzz\r\n\
CSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
        peer.send_to(foreign.as_bytes(), local).await.unwrap();

        let ours = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKok\r\n\
CSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
        peer.send_to(ours.as_bytes(), local).await.unwrap();

        // Only the second response arrives.
        let (msg, _) = messages.recv().await.unwrap();
        assert_eq!(
            msg.top_via().unwrap().branch(),
            Some("z9hG4bKok"),
            "foreign-via response should have been dropped"
        );

        layer.cancel();
        layer.done().await;
    }
}
