// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application-facing SIP server.
//!
//! [`Server`] wires a transport layer and a transaction layer together and
//! exposes the surface an application works with: listen on sockets,
//! register per-method request handlers, send requests, send responses,
//! shut down. Outbound messages get the standing headers (Allow,
//! Supported, User-Agent) filled in before they reach the transaction
//! layer, the way a user agent is expected to populate them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sipwire_core::{Method, Request, Response, SipMessage, Via};
use sipwire_transaction::{generate_branch, TimerDefaults, TransactionError, TransactionLayer};
use sipwire_transport::{select_target, TransportKind, TransportLayer};

pub mod ids;

pub use sipwire_transaction as transaction;
pub use sipwire_transport as transport;

/// Default User-Agent product token.
const USER_AGENT: &str = "sipwire/0.1";

/// Methods that get Allow/Supported auto-appended on outbound requests.
const AUTO_APPEND_METHODS: &[Method] = &[
    Method::Invite,
    Method::Register,
    Method::Refer,
    Method::Notify,
];

/// Server configuration: the advertised host plus supported extension
/// tokens for the Supported header.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host_addr: String,
    pub extensions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_addr: "localhost".to_owned(),
            extensions: Vec::new(),
        }
    }
}

/// Callback invoked for inbound requests of a registered method.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request);
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, req: Request) {
        (self)(req).await
    }
}

/// Opaque handle returned by [`Server::on_request`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

struct ServerInner {
    tx: TransactionLayer,
    extensions: Vec<String>,
    host: SmolStr,
    handlers: DashMap<Method, Vec<(HandlerId, Arc<dyn RequestHandler>)>>,
    in_shutdown: AtomicBool,
}

/// A SIP server: the TU on top of the transaction layer.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server and starts its serve loop. Must run inside a tokio
    /// runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_timers(config, TimerDefaults::default())
    }

    /// Server with custom transaction timer values (test hook).
    pub fn with_timers(config: ServerConfig, timers: TimerDefaults) -> Self {
        let host = if config.host_addr.is_empty() {
            SmolStr::new("localhost")
        } else {
            SmolStr::new(&config.host_addr)
        };
        let transport = TransportLayer::new(host.clone());
        let mut transport_errors = transport
            .errors()
            .expect("fresh transport layer owns its error stream");
        let tx = TransactionLayer::with_timers(transport, timers);
        let mut requests = tx.requests().expect("fresh layer owns its request stream");
        let mut strays = tx.responses().expect("fresh layer owns its stray stream");
        let mut errors = tx.errors().expect("fresh layer owns its error stream");

        let server = Self {
            inner: Arc::new(ServerInner {
                tx,
                extensions: config.extensions,
                host,
                handlers: DashMap::new(),
                in_shutdown: AtomicBool::new(false),
            }),
        };

        let serve = server.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    req = requests.recv() => match req {
                        Some(req) => {
                            let server = serve.clone();
                            tokio::spawn(async move { server.handle_request(req).await });
                        }
                        None => break,
                    },
                    res = strays.recv() => {
                        if let Some(res) = res {
                            warn!(msg = %SipMessage::Response(res).short(), "received unmatched response");
                        }
                    },
                    err = errors.recv() => {
                        if let Some(err) = err {
                            error!(%err, "transaction error");
                        }
                    },
                    err = transport_errors.recv() => {
                        if let Some(err) = err {
                            error!(%err, "transport error");
                        }
                    },
                }
            }
            debug!("server loop finished");
        });

        server
    }

    /// Binds a listening socket.
    pub async fn listen(&self, kind: TransportKind, addr: &str) -> anyhow::Result<()> {
        self.inner.tx.transport().listen(kind, addr).await?;
        Ok(())
    }

    /// Registers a handler for a request method and returns the handle
    /// that removes it again. Multiple handlers per method run in
    /// registration order.
    pub fn on_request(
        &self,
        method: Method,
        handler: impl RequestHandler,
    ) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .entry(method)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler registered with [`on_request`](Server::on_request).
    pub fn remove_handler(&self, id: HandlerId) {
        for mut entry in self.inner.handlers.iter_mut() {
            entry.value_mut().retain(|(hid, _)| *hid != id);
        }
    }

    /// Sends a request through a new client transaction. The returned
    /// channel yields its responses and closes when the transaction
    /// terminates.
    pub async fn request(
        &self,
        req: Request,
    ) -> Result<mpsc::Receiver<Response>, TransactionError> {
        if self.shutting_down() {
            return Err(TransactionError::Stopped);
        }
        let req = self.prepare_request(req);
        self.inner.tx.request(req).await
    }

    /// Sends a TU response through its server transaction. The returned
    /// channel yields the ACKs and request retransmissions that
    /// transaction observes.
    pub async fn respond(
        &self,
        res: Response,
    ) -> Result<mpsc::Receiver<Request>, TransactionError> {
        if self.shutting_down() {
            return Err(TransactionError::Stopped);
        }
        let res = self.prepare_response(res);
        self.inner.tx.respond(res).await
    }

    /// The transaction layer, for callers that need lower-level access.
    pub fn transactions(&self) -> &TransactionLayer {
        &self.inner.tx
    }

    /// Gracefully shuts down: terminates every transaction, closes every
    /// connection and waits for the layers to drain.
    pub async fn shutdown(&self) {
        if self.inner.in_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("server shutting down");
        self.inner.tx.cancel();
        self.inner.tx.done().await;
    }

    fn shutting_down(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::Acquire)
    }

    /// Dispatches one inbound request to its handlers; unhandled non-ACK
    /// methods draw 405 Method Not Allowed.
    async fn handle_request(&self, req: Request) {
        info!(msg = %SipMessage::Request(req.clone()).short(), "handling request");

        let method = req.method().clone();
        let handlers: Vec<Arc<dyn RequestHandler>> = self
            .inner
            .handlers
            .get(&method)
            .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if !handlers.is_empty() {
            for handler in handlers {
                handler.handle(req.clone()).await;
            }
            return;
        }
        if method == Method::Ack {
            return;
        }

        warn!(%method, "no handler registered; answering 405");
        let mut res = Response::from_request(&req, 405, "Method Not Allowed");
        res.headers_mut()
            .push("Allow", self.allowed_methods().join(", "));
        if let Err(e) = self.respond(res).await {
            error!(error = %e, "failed to reject unsupported request");
        }
    }

    /// Fills the standing headers of an outbound request (gaps only; the
    /// caller's headers win) and guarantees a branched Via.
    fn prepare_request(&self, mut req: Request) -> Request {
        if req.top_via().is_none() {
            let kind = select_target(&SipMessage::Request(req.clone()))
                .map(|t| t.kind)
                .unwrap_or(TransportKind::Udp);
            let port = self.inner.tx.transport().listen_addr(kind).map(|a| a.port());
            let mut via = Via::new(kind.via_transport(), self.inner.host.clone(), port);
            via.set_param("rport", None);
            via.set_param("branch", Some(generate_branch().as_str()));
            req.headers_mut().push("Via", via.to_string());
        }

        if AUTO_APPEND_METHODS.contains(req.method()) {
            if req.headers().get("Allow").is_none() {
                req.headers_mut()
                    .push("Allow", self.allowed_methods().join(", "));
            }
            if req.headers().get("Supported").is_none() && !self.inner.extensions.is_empty() {
                req.headers_mut()
                    .push("Supported", self.inner.extensions.join(", "));
            }
        }
        if req.headers().get("User-Agent").is_none() {
            req.headers_mut().push("User-Agent", USER_AGENT);
        }
        req
    }

    /// Fills the standing headers of an outbound response: OPTIONS answers
    /// advertise the server's capabilities.
    fn prepare_response(&self, mut res: Response) -> Response {
        let is_options = res
            .cseq()
            .map(|cseq| cseq.method == Method::Options)
            .unwrap_or(false);
        if is_options {
            let allow = self.allowed_methods().join(", ");
            res.headers_mut().set("Allow", allow);
            if !self.inner.extensions.is_empty() {
                res.headers_mut()
                    .set("Supported", self.inner.extensions.join(", "));
            }
        }
        res
    }

    /// INVITE, ACK and CANCEL plus every method with a registered handler.
    fn allowed_methods(&self) -> Vec<String> {
        let mut methods = vec![
            Method::Invite.as_str().to_owned(),
            Method::Ack.as_str().to_owned(),
            Method::Cancel.as_str().to_owned(),
        ];
        for entry in self.inner.handlers.iter() {
            if entry.value().is_empty() {
                continue;
            }
            let name = entry.key().as_str().to_owned();
            if !methods.contains(&name) {
                methods.push(name);
            }
        }
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sipwire_core::{Headers, RequestLine, SipUri, StatusLine};

    fn server() -> Server {
        Server::new(ServerConfig {
            host_addr: "127.0.0.1".to_owned(),
            extensions: vec!["replaces".to_owned(), "timer".to_owned()],
        })
    }

    fn bare_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("From", "<sip:alice@127.0.0.1>;tag=a");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "prep@127.0.0.1");
        headers.push("CSeq", format!("1 {}", method.as_str()));
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn prepare_request_fills_standing_headers() {
        let server = server();
        let prepared = server.prepare_request(bare_request(Method::Invite));

        let via = prepared.top_via().expect("a Via must be generated");
        assert!(via.branch().unwrap().starts_with("z9hG4bK"));
        assert_eq!(via.rport(), Some(None));

        let allow = prepared.headers().get("Allow").unwrap();
        for required in ["INVITE", "ACK", "CANCEL"] {
            assert!(allow.contains(required), "Allow missing {required}");
        }
        assert_eq!(
            prepared.headers().get("Supported").unwrap().as_str(),
            "replaces, timer"
        );
        assert_eq!(
            prepared.headers().get("User-Agent").unwrap().as_str(),
            USER_AGENT
        );
    }

    #[tokio::test]
    async fn prepare_request_respects_existing_headers() {
        let server = server();
        let mut req = bare_request(Method::Invite);
        req.headers_mut().push("Allow", "INVITE");
        req.headers_mut().push("User-Agent", "custom/9");
        let prepared = server.prepare_request(req);

        assert_eq!(prepared.headers().get("Allow").unwrap().as_str(), "INVITE");
        assert_eq!(
            prepared.headers().get("User-Agent").unwrap().as_str(),
            "custom/9"
        );
    }

    #[tokio::test]
    async fn prepare_request_leaves_plain_methods_alone() {
        let server = server();
        let prepared = server.prepare_request(bare_request(Method::Options));
        assert!(prepared.headers().get("Allow").is_none());
        assert!(prepared.headers().get("Supported").is_none());
    }

    #[tokio::test]
    async fn options_responses_advertise_capabilities() {
        let server = server();
        let _h = server.on_request(Method::Options, |_req: Request| async {});
        let mut headers = Headers::new();
        headers.push("CSeq", "1 OPTIONS");
        let res = Response::new(StatusLine::new(200, "OK"), headers, Bytes::new());
        let prepared = server.prepare_response(res);

        let allow = prepared.headers().get("Allow").unwrap();
        for required in ["INVITE", "ACK", "CANCEL", "OPTIONS"] {
            assert!(allow.contains(required), "Allow missing {required}");
        }
    }

    #[tokio::test]
    async fn handler_registration_returns_removal_handle() {
        let server = server();
        let id = server.on_request(Method::Message, |_req: Request| async {});
        assert!(server
            .allowed_methods()
            .contains(&"MESSAGE".to_owned()));
        server.remove_handler(id);
        assert!(!server
            .allowed_methods()
            .contains(&"MESSAGE".to_owned()));
    }
}
