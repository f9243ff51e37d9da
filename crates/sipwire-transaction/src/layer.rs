// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction layer: owns every live transaction, matches inbound
//! messages to them, and drives the state machines' actions against the
//! transport layer.
//!
//! Layering follows RFC 3261 §17: this layer holds a reference to the
//! transport layer and pulls its fan-in channel; the transport layer knows
//! nothing about transactions. Timer firings funnel through one command
//! channel so a single task observes them in arming order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, info, warn};

use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipMessage};
use sipwire_parse::{serialize_request, serialize_response};
use sipwire_transport::{select_target, Target, TransportLayer};

use crate::fsm::{
    Action, ClientEvent, ClientFsm, ClientInviteFsm, ClientNonInviteFsm, ServerEvent, ServerFsm,
    ServerInviteFsm, ServerNonInviteFsm, Termination,
};
use crate::key::{ClientKey, LegacyResponseKey, ServerKey};
use crate::timers::{TimerDefaults, TransactionTimer, TransportTimers};
use crate::TransactionError;

/// Capacity of the channels handed to the TU.
const TU_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the layer-wide streams (requests, strays, errors).
const STREAM_CAPACITY: usize = 64;

struct ClientEntry {
    fsm: ClientFsm,
    origin: Request,
    origin_bytes: Bytes,
    ack_bytes: Option<Bytes>,
    target: Target,
    responses_tx: mpsc::Sender<Response>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
}

struct ServerEntry {
    fsm: ServerFsm,
    origin: Request,
    last_response: Option<(Bytes, Target)>,
    tu_tx: mpsc::Sender<Request>,
    tu_rx: Option<mpsc::Receiver<Request>>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

impl ServerEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

enum Command {
    ClientTimer {
        key: ClientKey,
        timer: TransactionTimer,
    },
    ServerTimer {
        key: ServerKey,
        timer: TransactionTimer,
    },
}

struct LayerInner {
    transport: TransportLayer,
    defaults: TimerDefaults,
    client: DashMap<ClientKey, ClientEntry>,
    server: DashMap<ServerKey, ServerEntry>,
    /// Maps TU responses onto legacy-keyed server transactions.
    legacy_index: DashMap<LegacyResponseKey, ServerKey>,
    cmd_tx: mpsc::Sender<Command>,
    requests_tx: mpsc::Sender<Request>,
    requests_rx: StdMutex<Option<mpsc::Receiver<Request>>>,
    strays_tx: mpsc::Sender<Response>,
    strays_rx: StdMutex<Option<mpsc::Receiver<Response>>>,
    errors_tx: mpsc::Sender<TransactionError>,
    errors_rx: StdMutex<Option<mpsc::Receiver<TransactionError>>>,
    shutdown: AtomicBool,
    done_rx: watch::Receiver<bool>,
}

/// Owns client and server transactions keyed per RFC 3261 §17.1.3/§17.2.3.
#[derive(Clone)]
pub struct TransactionLayer {
    inner: Arc<LayerInner>,
}

impl TransactionLayer {
    /// Creates a transaction layer on top of a transport layer. Must run
    /// inside a tokio runtime; the dispatcher and timer tasks start
    /// immediately.
    pub fn new(transport: TransportLayer) -> Self {
        Self::with_timers(transport, TimerDefaults::default())
    }

    /// Layer with custom T1/T2/T4 values (test hook).
    pub fn with_timers(transport: TransportLayer, defaults: TimerDefaults) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(STREAM_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(STREAM_CAPACITY);
        let (strays_tx, strays_rx) = mpsc::channel(STREAM_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(STREAM_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        let mut messages = transport
            .messages()
            .expect("transport fan-in already claimed by another layer");

        let inner = Arc::new(LayerInner {
            transport,
            defaults,
            client: DashMap::new(),
            server: DashMap::new(),
            legacy_index: DashMap::new(),
            cmd_tx,
            requests_tx,
            requests_rx: StdMutex::new(Some(requests_rx)),
            strays_tx,
            strays_rx: StdMutex::new(Some(strays_rx)),
            errors_tx,
            errors_rx: StdMutex::new(Some(errors_rx)),
            shutdown: AtomicBool::new(false),
            done_rx,
        });
        let layer = Self { inner };

        let dispatcher = layer.clone();
        tokio::spawn(async move {
            while let Some((msg, source)) = messages.recv().await {
                dispatcher.dispatch(msg, source).await;
            }
            debug!("transaction dispatcher drained");
            let _ = done_tx.send(true);
        });

        let timer_driver = layer.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Command::ClientTimer { key, timer } => {
                        timer_driver.handle_client_timer(key, timer).await;
                    }
                    Command::ServerTimer { key, timer } => {
                        timer_driver.handle_server_timer(key, timer).await;
                    }
                }
            }
        });

        layer
    }

    /// The transport layer this layer sends through.
    pub fn transport(&self) -> &TransportLayer {
        &self.inner.transport
    }

    /// Starts a client transaction for an outbound request.
    ///
    /// The returned channel yields every response delivered to this
    /// transaction and closes when the transaction terminates.
    pub async fn request(
        &self,
        req: Request,
    ) -> Result<mpsc::Receiver<Response>, TransactionError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransactionError::Stopped);
        }
        let key = ClientKey::from_request(&req)?;
        let msg = SipMessage::Request(req.clone());
        let target = select_target(&msg).map_err(|e| TransactionError::Transport {
            key: key.to_string().into(),
            reason: e.to_string(),
        })?;
        let origin_bytes = serialize_request(&req);
        let timers = TransportTimers::with_defaults(target.kind, self.inner.defaults);
        let fsm = if *req.method() == Method::Invite {
            ClientFsm::Invite(ClientInviteFsm::new(timers))
        } else {
            ClientFsm::NonInvite(ClientNonInviteFsm::new(timers))
        };

        let (responses_tx, responses_rx) = mpsc::channel(TU_CHANNEL_CAPACITY);
        let entry = ClientEntry {
            fsm,
            origin: req,
            origin_bytes,
            ack_bytes: None,
            target,
            responses_tx,
            timers: HashMap::new(),
        };

        match self.inner.client.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransactionError::DuplicateTransaction(
                    key.to_string().into(),
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        info!(%key, "client transaction created");

        let actions = match self.inner.client.get_mut(&key) {
            Some(mut entry) => entry.fsm.on_event(ClientEvent::Start),
            None => Vec::new(),
        };
        self.apply_client_actions(&key, actions).await;
        Ok(responses_rx)
    }

    /// Routes a TU response to its server transaction.
    ///
    /// The returned channel carries the peer messages subsequently observed
    /// by that transaction: ACKs to a non-2xx final and retransmitted
    /// requests. It is handed out on the first call; later calls for the
    /// same transaction get an already-closed channel.
    pub async fn respond(
        &self,
        res: Response,
    ) -> Result<mpsc::Receiver<Request>, TransactionError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransactionError::Stopped);
        }
        let key = self.server_key_for_response(&res)?;

        let event = if res.is_provisional() {
            ServerEvent::SendProvisional(res)
        } else {
            ServerEvent::SendFinal(res)
        };
        let (actions, peer_rx) = match self.inner.server.get_mut(&key) {
            Some(mut entry) => {
                let actions = entry.fsm.on_event(event);
                (actions, entry.tu_rx.take())
            }
            None => return Err(TransactionError::NotFound(key.to_string().into())),
        };
        if actions.is_empty() {
            warn!(%key, "response not permitted in current transaction state; dropped");
        }
        self.apply_server_actions(&key, actions).await;

        Ok(peer_rx.unwrap_or_else(closed_receiver))
    }

    /// Stream of origin requests of newly created server transactions.
    /// May be taken once.
    pub fn requests(&self) -> Option<mpsc::Receiver<Request>> {
        self.inner.requests_rx.lock().unwrap().take()
    }

    /// Stream of responses that matched no client transaction.
    /// May be taken once.
    pub fn responses(&self) -> Option<mpsc::Receiver<Response>> {
        self.inner.strays_rx.lock().unwrap().take()
    }

    /// Stream of transaction errors. May be taken once.
    pub fn errors(&self) -> Option<mpsc::Receiver<TransactionError>> {
        self.inner.errors_rx.lock().unwrap().take()
    }

    /// Number of live client transactions (test hook).
    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    /// Number of live server transactions (test hook).
    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    /// Terminates every live transaction with `Cancelled` and shuts the
    /// transport down.
    pub fn cancel(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("transaction layer shutting down");

        let client_keys: Vec<ClientKey> = self
            .inner
            .client
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in client_keys {
            if let Some((_, mut entry)) = self.inner.client.remove(&key) {
                entry.cancel_all_timers();
                let _ = entry.fsm.on_event(ClientEvent::Cancel);
                let _ = self.inner.errors_tx.try_send(TransactionError::Cancelled {
                    key: key.to_string().into(),
                });
            }
        }

        let server_keys: Vec<ServerKey> = self
            .inner
            .server
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in server_keys {
            if let Some((_, mut entry)) = self.inner.server.remove(&key) {
                entry.cancel_all_timers();
                let _ = entry.fsm.on_event(ServerEvent::Cancel);
                let _ = self.inner.errors_tx.try_send(TransactionError::Cancelled {
                    key: key.to_string().into(),
                });
            }
        }
        self.inner.legacy_index.clear();

        self.inner.transport.cancel();
    }

    /// Resolves when the dispatcher has drained after [`cancel`].
    pub async fn done(&self) {
        let mut done = self.inner.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.inner.transport.done().await;
    }

    fn server_key_for_response(&self, res: &Response) -> Result<ServerKey, TransactionError> {
        if let Ok(key) = ServerKey::from_response(res) {
            if self.inner.server.contains_key(&key) {
                return Ok(key);
            }
        }
        let legacy = LegacyResponseKey::from_response(res)
            .and_then(|lk| self.inner.legacy_index.get(&lk).map(|k| k.value().clone()));
        match legacy {
            Some(key) => Ok(key),
            None => Err(TransactionError::NotFound(
                res.top_via()
                    .and_then(|v| v.branch().map(|b| b.to_string()))
                    .unwrap_or_else(|| "<no branch>".to_string())
                    .into(),
            )),
        }
    }

    /// Routes one inbound message from the transport layer.
    async fn dispatch(&self, msg: SipMessage, source: Target) {
        match msg {
            SipMessage::Response(res) => self.dispatch_response(res).await,
            SipMessage::Request(req) => self.dispatch_request(req, source).await,
        }
    }

    async fn dispatch_response(&self, res: Response) {
        let key = match ClientKey::from_response(&res) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping unmatchable response");
                return;
            }
        };

        let actions = match self.inner.client.get_mut(&key) {
            Some(mut entry) => {
                let event = if res.is_provisional() {
                    ClientEvent::Provisional(res)
                } else {
                    ClientEvent::Final(res)
                };
                entry.fsm.on_event(event)
            }
            None => {
                warn!(%key, "response matches no client transaction; forwarding as stray");
                let _ = self.inner.strays_tx.send(res).await;
                return;
            }
        };
        if actions.is_empty() {
            warn!(%key, "response not permitted in current transaction state; dropped");
            return;
        }
        self.apply_client_actions(&key, actions).await;
    }

    async fn dispatch_request(&self, req: Request, source: Target) {
        let key = match ServerKey::from_request(&req) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping unmatchable request");
                return;
            }
        };
        let method = req.method().clone();

        // Existing transaction: ACK or retransmission.
        if let Some(mut entry) = self.inner.server.get_mut(&key) {
            let event = if method == Method::Ack {
                ServerEvent::Ack(req)
            } else {
                ServerEvent::Retransmission
            };
            let actions = entry.fsm.on_event(event);
            drop(entry);
            if actions.is_empty() {
                debug!(%key, %method, "request ignored in current transaction state");
                return;
            }
            self.apply_server_actions(&key, actions).await;
            return;
        }

        match method {
            // An ACK for a terminated or unknown INVITE transaction is
            // dropped silently; 2xx ACK matching is the TU's business.
            Method::Ack => {
                debug!(%key, "dropping ACK without matching transaction");
            }
            Method::Cancel => {
                let has_invite = key
                    .with_method(Method::Invite)
                    .map(|k| self.inner.server.contains_key(&k))
                    .unwrap_or(false);
                if !has_invite {
                    // RFC 3261 §9.2: CANCEL for an unknown transaction.
                    warn!(%key, "CANCEL matches no transaction; answering 481");
                    let res =
                        Response::from_request(&req, 481, "Call/Transaction Does Not Exist");
                    if let Err(e) = self.inner.transport.send(&SipMessage::Response(res)).await {
                        debug!(error = %e, "failed to answer stray CANCEL");
                    }
                    return;
                }
                self.create_server_transaction(key, req, source).await;
            }
            _ => self.create_server_transaction(key, req, source).await,
        }
    }

    async fn create_server_transaction(&self, key: ServerKey, req: Request, source: Target) {
        let timers = TransportTimers::with_defaults(source.kind, self.inner.defaults);
        let (fsm, creation_actions) = if *req.method() == Method::Invite {
            let (fsm, actions) = ServerInviteFsm::new(timers);
            (ServerFsm::Invite(fsm), actions)
        } else {
            (ServerFsm::NonInvite(ServerNonInviteFsm::new(timers)), Vec::new())
        };

        let (tu_tx, tu_rx) = mpsc::channel(TU_CHANNEL_CAPACITY);
        let entry = ServerEntry {
            fsm,
            origin: req.clone(),
            last_response: None,
            tu_tx,
            tu_rx: Some(tu_rx),
            timers: HashMap::new(),
        };

        if let ServerKey::Legacy { .. } = &key {
            if let Some(lk) = LegacyResponseKey::from_request(&req) {
                self.inner.legacy_index.insert(lk, key.clone());
            }
        }

        match self.inner.server.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // A concurrent duplicate lost the race; treat as retransmission.
                debug!(%key, "request raced an existing transaction; dropped");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        info!(%key, "server transaction created");

        self.apply_server_actions(&key, creation_actions).await;
        if self.inner.requests_tx.send(req).await.is_err() {
            debug!("request consumer gone");
        }
    }

    async fn handle_client_timer(&self, key: ClientKey, timer: TransactionTimer) {
        let actions = match self.inner.client.get_mut(&key) {
            Some(mut entry) => {
                entry.timers.remove(&timer);
                entry.fsm.on_event(ClientEvent::Timer(timer))
            }
            None => return,
        };
        self.apply_client_actions(&key, actions).await;
    }

    async fn handle_server_timer(&self, key: ServerKey, timer: TransactionTimer) {
        let actions = match self.inner.server.get_mut(&key) {
            Some(mut entry) => {
                entry.timers.remove(&timer);
                entry.fsm.on_event(ServerEvent::Timer(timer))
            }
            None => return,
        };
        self.apply_server_actions(&key, actions).await;
    }

    async fn apply_client_actions(&self, key: &ClientKey, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::TransmitOrigin => {
                    let Some((bytes, target)) = self
                        .inner
                        .client
                        .get(key)
                        .map(|e| (e.origin_bytes.clone(), e.target.clone()))
                    else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.send_raw(&bytes, &target).await {
                        warn!(%key, error = %e, "request transmission failed");
                        self.feed_client_transport_error(key, &mut queue);
                    }
                }
                Action::TransmitAck(res) => {
                    let Some((bytes, target)) = self.ack_bytes_for(key, &res) else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.send_raw(&bytes, &target).await {
                        warn!(%key, error = %e, "ACK transmission failed");
                        self.feed_client_transport_error(key, &mut queue);
                    }
                }
                Action::Deliver(res) => {
                    let Some(tx) = self.inner.client.get(key).map(|e| e.responses_tx.clone())
                    else {
                        continue;
                    };
                    if tx.send(res).await.is_err() {
                        debug!(%key, "response consumer gone");
                    }
                }
                Action::Schedule(timer, duration) => {
                    self.schedule_client_timer(key.clone(), timer, duration);
                }
                Action::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                Action::Terminate(reason) => {
                    if let Some((_, mut entry)) = self.inner.client.remove(key) {
                        entry.cancel_all_timers();
                        // Dropping the entry closes the response channel.
                    }
                    info!(%key, ?reason, "client transaction terminated");
                    self.report_termination(key.to_string(), reason).await;
                }
                // Server-only actions never reach a client transaction.
                _ => {}
            }
        }
    }

    async fn apply_server_actions(&self, key: &ServerKey, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::TransmitResponse(res) => {
                    let target = match select_target(&SipMessage::Response(res.clone())) {
                        Ok(target) => target,
                        Err(e) => {
                            warn!(%key, error = %e, "response is unroutable");
                            self.feed_server_transport_error(key, &mut queue);
                            continue;
                        }
                    };
                    let bytes = serialize_response(&res);
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.last_response = Some((bytes.clone(), target.clone()));
                    }
                    if let Err(e) = self.inner.transport.send_raw(&bytes, &target).await {
                        warn!(%key, error = %e, "response transmission failed");
                        self.feed_server_transport_error(key, &mut queue);
                    }
                }
                Action::RetransmitLast => {
                    let Some(Some((bytes, target))) =
                        self.inner.server.get(key).map(|e| e.last_response.clone())
                    else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.send_raw(&bytes, &target).await {
                        warn!(%key, error = %e, "response retransmission failed");
                        self.feed_server_transport_error(key, &mut queue);
                    }
                }
                Action::SendAutoTrying => {
                    let Some(origin) = self.inner.server.get(key).map(|e| e.origin.clone())
                    else {
                        continue;
                    };
                    debug!(%key, "TU silent for 200ms; sending 100 Trying");
                    let trying = Response::from_request(&origin, 100, "Trying");
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        let actions = entry.fsm.on_event(ServerEvent::SendProvisional(trying));
                        drop(entry);
                        queue.extend(actions);
                    }
                }
                Action::DeliverAck(ack) => {
                    let Some(tx) = self.inner.server.get(key).map(|e| e.tu_tx.clone()) else {
                        continue;
                    };
                    if tx.send(ack).await.is_err() {
                        debug!(%key, "peer-message consumer gone");
                    }
                }
                Action::Schedule(timer, duration) => {
                    self.schedule_server_timer(key.clone(), timer, duration);
                }
                Action::CancelTimer(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                Action::Terminate(reason) => {
                    if let Some((_, mut entry)) = self.inner.server.remove(key) {
                        entry.cancel_all_timers();
                        if let Some(lk) = LegacyResponseKey::from_request(&entry.origin) {
                            self.inner.legacy_index.remove(&lk);
                        }
                    }
                    info!(%key, ?reason, "server transaction terminated");
                    self.report_termination(key.to_string(), reason).await;
                }
                // Client-only actions never reach a server transaction.
                _ => {}
            }
        }
    }

    /// Builds (or reuses) the ACK for a non-2xx final. Retransmissions use
    /// the stored bytes so every ACK is byte-identical.
    fn ack_bytes_for(&self, key: &ClientKey, res: &Response) -> Option<(Bytes, Target)> {
        let mut entry = self.inner.client.get_mut(key)?;
        if let Some(bytes) = &entry.ack_bytes {
            return Some((bytes.clone(), entry.target.clone()));
        }
        let ack = build_ack(&entry.origin, res);
        let bytes = serialize_request(&ack);
        entry.ack_bytes = Some(bytes.clone());
        Some((bytes, entry.target.clone()))
    }

    fn feed_client_transport_error(&self, key: &ClientKey, queue: &mut VecDeque<Action>) {
        if let Some(mut entry) = self.inner.client.get_mut(key) {
            queue.extend(entry.fsm.on_event(ClientEvent::TransportError));
        }
    }

    fn feed_server_transport_error(&self, key: &ServerKey, queue: &mut VecDeque<Action>) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            queue.extend(entry.fsm.on_event(ServerEvent::TransportError));
        }
    }

    async fn report_termination(&self, key: String, reason: Termination) {
        let error = match reason {
            Termination::Normal => return,
            Termination::Timeout => TransactionError::Timeout { key: key.into() },
            Termination::TransportError => TransactionError::Transport {
                key: key.into(),
                reason: "send failed".into(),
            },
            Termination::Cancelled => TransactionError::Cancelled { key: key.into() },
        };
        if self.inner.errors_tx.send(error).await.is_err() {
            debug!("error consumer gone");
        }
    }

    /// Arms a timer; re-arming cancels the previous instance so each armed
    /// timer fires at most once. Zero durations fire immediately through
    /// the command channel, keeping per-transaction ordering.
    fn schedule_client_timer(&self, key: ClientKey, timer: TransactionTimer, duration: Duration) {
        let Some(mut entry) = self.inner.client.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let cmd_tx = self.inner.cmd_tx.clone();
        if duration.is_zero() {
            drop(entry);
            tokio::spawn(async move {
                let _ = cmd_tx.send(Command::ClientTimer { key, timer }).await;
            });
            return;
        }
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(Command::ClientTimer { key, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    fn schedule_server_timer(&self, key: ServerKey, timer: TransactionTimer, duration: Duration) {
        let Some(mut entry) = self.inner.server.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let cmd_tx = self.inner.cmd_tx.clone();
        if duration.is_zero() {
            drop(entry);
            tokio::spawn(async move {
                let _ = cmd_tx.send(Command::ServerTimer { key, timer }).await;
            });
            return;
        }
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(Command::ServerTimer { key, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }
}

/// ACK for a non-2xx final (RFC 3261 §17.1.1.3): same Request-URI, Call-ID,
/// From, top Via and CSeq number as the INVITE; To is taken from the
/// response so its tag survives; Route headers are carried over.
fn build_ack(origin: &Request, res: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = origin.top_via() {
        headers.push("Via", via.to_string());
    }
    if let Some(from) = origin.headers().get("From") {
        headers.push("From", from.clone());
    }
    match res.headers().get("To") {
        Some(to) => headers.push("To", to.clone()),
        None => {
            if let Some(to) = origin.headers().get("To") {
                headers.push("To", to.clone());
            }
        }
    }
    if let Some(call_id) = origin.call_id() {
        headers.push("Call-ID", call_id.clone());
    }
    let seq = origin.cseq().map(|c| c.seq).unwrap_or(1);
    headers.push("CSeq", format!("{} ACK", seq));
    for route in origin.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    Request::new(
        RequestLine::new(Method::Ack, origin.uri().clone()),
        headers,
        Bytes::new(),
    )
}

fn closed_receiver() -> mpsc::Receiver<Request> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_reuses_invite_identity() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 127.0.0.1:9001;branch=z9hG4bK-abc");
        headers.push("From", "<sip:alice@example.com>;tag=1928301774");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "abc@127.0.0.1");
        headers.push("CSeq", "7 INVITE");
        headers.push("Route", "<sip:proxy.example.com;lr>");
        let invite = Request::new(
            RequestLine::new(
                Method::Invite,
                sipwire_core::SipUri::parse("sip:bob@example.com").unwrap(),
            ),
            headers,
            Bytes::new(),
        );
        let mut res = Response::from_request(&invite, 486, "Busy Here");
        res.headers_mut().set("To", "<sip:bob@example.com>;tag=served");

        let ack = build_ack(&invite, &res);
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bK-abc"));
        assert_eq!(ack.cseq().unwrap().seq, 7);
        assert_eq!(ack.cseq().unwrap().method, Method::Ack);
        assert_eq!(ack.to_header().unwrap().tag(), Some("served"));
        assert_eq!(
            ack.headers().get("Route").unwrap().as_str(),
            "<sip:proxy.example.com;lr>"
        );
    }
}
