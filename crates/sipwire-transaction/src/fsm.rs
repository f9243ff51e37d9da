// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four RFC 3261 §17 transaction state machines.
//!
//! Each FSM is a pure `state × event → actions` function: it never does
//! I/O, schedules nothing itself, and suspends nowhere. The transaction
//! layer owns the sockets, the serialized byte images, and the timer
//! wheel, and interprets the returned [`Action`] list. That keeps every
//! retransmission byte-identical to the first transmission: the FSM only
//! ever says *transmit the origin again*, never *re-serialize*.
//!
//! An event that is not permitted in the current state yields an empty
//! action list; the layer drops the message and logs it.

use std::time::Duration;

use sipwire_core::{Request, Response};

use crate::timers::{TransactionTimer, TransportTimers};

/// Why a transaction reached Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal completion.
    Normal,
    /// Timer B, F or H fired.
    Timeout,
    /// The transport reported a send or connection failure.
    TransportError,
    /// Layer shutdown.
    Cancelled,
}

/// Instructions handed back to the transaction layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// (Re)send the stored byte image of the origin request.
    TransmitOrigin,
    /// Send the ACK for this non-2xx final; reuse the stored ACK bytes if
    /// one was already generated.
    TransmitAck(Response),
    /// Serialize and send a TU response, remembering it as "last response".
    TransmitResponse(Response),
    /// Re-send the stored byte image of the last response.
    RetransmitLast,
    /// The TU has stayed silent for 200 ms; answer 100 Trying for it.
    SendAutoTrying,
    /// Deliver a response to the TU's response channel.
    Deliver(Response),
    /// Deliver a received ACK to the TU's peer-message channel.
    DeliverAck(Request),
    Schedule(TransactionTimer, Duration),
    CancelTimer(TransactionTimer),
    /// Remove the transaction; close channels; report non-normal causes.
    Terminate(Termination),
}

/// Events driving a client transaction.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transaction was just created; the origin bytes are stored.
    Start,
    Provisional(Response),
    Final(Response),
    Timer(TransactionTimer),
    TransportError,
    Cancel,
}

/// Events driving a server transaction.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The origin request arrived again.
    Retransmission,
    /// The TU submitted a 1xx.
    SendProvisional(Response),
    /// The TU submitted a final response.
    SendFinal(Response),
    /// An ACK matched this transaction.
    Ack(Request),
    Timer(TransactionTimer),
    TransportError,
    Cancel,
}

/// INVITE client transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// INVITE client transaction (RFC 3261 §17.1.1).
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransportTimers,
    a_interval: Duration,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.duration(TransactionTimer::A),
            timers,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<Action> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientEvent::Start) => {
                let mut actions = vec![Action::TransmitOrigin];
                if self.timers.retransmits() {
                    actions.push(Action::Schedule(TransactionTimer::A, self.a_interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::B,
                    self.timers.duration(TransactionTimer::B),
                ));
                actions
            }
            (Calling | Proceeding, ClientEvent::Provisional(res)) => {
                self.state = Proceeding;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    Action::Deliver(res),
                ]
            }
            (Calling | Proceeding, ClientEvent::Final(res)) if res.is_success() => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    Action::CancelTimer(TransactionTimer::B),
                    Action::Deliver(res),
                    Action::Terminate(Termination::Normal),
                ]
            }
            (Calling | Proceeding, ClientEvent::Final(res)) => {
                self.state = Completed;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    Action::CancelTimer(TransactionTimer::B),
                    Action::Deliver(res.clone()),
                    Action::TransmitAck(res),
                    Action::Schedule(
                        TransactionTimer::D,
                        self.timers.duration(TransactionTimer::D),
                    ),
                ]
            }
            // A retransmitted 3xx-6xx final means our ACK was lost.
            (Completed, ClientEvent::Final(res)) if !res.is_success() => {
                vec![Action::TransmitAck(res)]
            }
            (Calling, ClientEvent::Timer(TransactionTimer::A)) => {
                self.a_interval = self.a_interval.saturating_mul(2);
                vec![
                    Action::TransmitOrigin,
                    Action::Schedule(TransactionTimer::A, self.a_interval),
                ]
            }
            (Calling | Proceeding, ClientEvent::Timer(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::A),
                    Action::Terminate(Termination::Timeout),
                ]
            }
            (Completed, ClientEvent::Timer(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Normal)]
            }
            (Calling | Proceeding, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::TransportError)]
            }
            (_, ClientEvent::Cancel) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Cancelled)]
            }
            _ => Vec::new(),
        }
    }
}

/// Non-INVITE client transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE client transaction (RFC 3261 §17.1.2).
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransportTimers,
    e_interval: Duration,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.duration(TransactionTimer::E),
            timers,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<Action> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientEvent::Start) => {
                let mut actions = vec![Action::TransmitOrigin];
                if self.timers.retransmits() {
                    actions.push(Action::Schedule(TransactionTimer::E, self.e_interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::F,
                    self.timers.duration(TransactionTimer::F),
                ));
                actions
            }
            (Trying | Proceeding, ClientEvent::Provisional(res)) => {
                self.state = Proceeding;
                vec![Action::Deliver(res)]
            }
            (Trying | Proceeding, ClientEvent::Final(res)) => {
                self.state = Completed;
                vec![
                    Action::CancelTimer(TransactionTimer::E),
                    Action::CancelTimer(TransactionTimer::F),
                    Action::Deliver(res),
                    Action::Schedule(
                        TransactionTimer::K,
                        self.timers.duration(TransactionTimer::K),
                    ),
                ]
            }
            (Trying, ClientEvent::Timer(TransactionTimer::E)) => {
                // Doubles while Trying, capped at T2.
                self.e_interval = self
                    .e_interval
                    .saturating_mul(2)
                    .min(self.timers.defaults().t2);
                vec![
                    Action::TransmitOrigin,
                    Action::Schedule(TransactionTimer::E, self.e_interval),
                ]
            }
            (Proceeding, ClientEvent::Timer(TransactionTimer::E)) => {
                // Fixed at T2 once a provisional arrived.
                self.e_interval = self.timers.defaults().t2;
                vec![
                    Action::TransmitOrigin,
                    Action::Schedule(TransactionTimer::E, self.e_interval),
                ]
            }
            (Trying | Proceeding, ClientEvent::Timer(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::E),
                    Action::Terminate(Termination::Timeout),
                ]
            }
            (Completed, ClientEvent::Timer(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Normal)]
            }
            (Trying | Proceeding, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::TransportError)]
            }
            (_, ClientEvent::Cancel) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Cancelled)]
            }
            _ => Vec::new(),
        }
    }
}

/// INVITE server transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// INVITE server transaction (RFC 3261 §17.2.1).
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransportTimers,
    g_interval: Duration,
    responded: bool,
}

impl ServerInviteFsm {
    /// Created on an inbound INVITE; arms the automatic 100 Trying delay.
    pub fn new(timers: TransportTimers) -> (Self, Vec<Action>) {
        let fsm = Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.duration(TransactionTimer::G),
            timers,
            responded: false,
        };
        let actions = vec![Action::Schedule(
            TransactionTimer::Trying100,
            fsm.timers.duration(TransactionTimer::Trying100),
        )];
        (fsm, actions)
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Action> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding | Completed, ServerEvent::Retransmission) => {
                vec![Action::RetransmitLast]
            }
            (Proceeding, ServerEvent::SendProvisional(res)) => {
                self.responded = true;
                vec![Action::TransmitResponse(res)]
            }
            (Proceeding, ServerEvent::SendFinal(res)) if res.is_success() => {
                self.responded = true;
                self.state = Terminated;
                // Further 2xx retransmission and ACK matching belong to the
                // TU (RFC 3261 §13.3.1.4).
                vec![
                    Action::TransmitResponse(res),
                    Action::CancelTimer(TransactionTimer::Trying100),
                    Action::Terminate(Termination::Normal),
                ]
            }
            (Proceeding, ServerEvent::SendFinal(res)) => {
                self.responded = true;
                self.state = Completed;
                let mut actions = vec![
                    Action::TransmitResponse(res),
                    Action::CancelTimer(TransactionTimer::Trying100),
                ];
                if self.timers.retransmits() {
                    actions.push(Action::Schedule(TransactionTimer::G, self.g_interval));
                }
                actions.push(Action::Schedule(
                    TransactionTimer::H,
                    self.timers.duration(TransactionTimer::H),
                ));
                actions
            }
            (Completed, ServerEvent::Ack(ack)) => {
                self.state = Confirmed;
                vec![
                    Action::CancelTimer(TransactionTimer::G),
                    Action::CancelTimer(TransactionTimer::H),
                    Action::DeliverAck(ack),
                    Action::Schedule(
                        TransactionTimer::I,
                        self.timers.duration(TransactionTimer::I),
                    ),
                ]
            }
            (Completed, ServerEvent::Timer(TransactionTimer::G)) => {
                self.g_interval = self
                    .g_interval
                    .saturating_mul(2)
                    .min(self.timers.defaults().t2);
                vec![
                    Action::RetransmitLast,
                    Action::Schedule(TransactionTimer::G, self.g_interval),
                ]
            }
            (Completed, ServerEvent::Timer(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    Action::CancelTimer(TransactionTimer::G),
                    Action::Terminate(Termination::Timeout),
                ]
            }
            (Confirmed, ServerEvent::Timer(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Normal)]
            }
            (Proceeding, ServerEvent::Timer(TransactionTimer::Trying100)) if !self.responded => {
                vec![Action::SendAutoTrying]
            }
            (Proceeding | Completed, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::TransportError)]
            }
            (_, ServerEvent::Cancel) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Cancelled)]
            }
            _ => Vec::new(),
        }
    }
}

/// Non-INVITE server transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE server transaction (RFC 3261 §17.2.2).
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TransportTimers,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
        }
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Action> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            // Retransmissions in Trying are discarded; the first response
            // has not been produced yet.
            (Trying, ServerEvent::Retransmission) => Vec::new(),
            (Proceeding | Completed, ServerEvent::Retransmission) => {
                vec![Action::RetransmitLast]
            }
            (Trying | Proceeding, ServerEvent::SendProvisional(res)) => {
                self.state = Proceeding;
                vec![Action::TransmitResponse(res)]
            }
            (Trying | Proceeding, ServerEvent::SendFinal(res)) => {
                self.state = Completed;
                vec![
                    Action::TransmitResponse(res),
                    Action::Schedule(
                        TransactionTimer::J,
                        self.timers.duration(TransactionTimer::J),
                    ),
                ]
            }
            (Completed, ServerEvent::Timer(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Normal)]
            }
            (Trying | Proceeding, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::TransportError)]
            }
            (_, ServerEvent::Cancel) => {
                self.state = Terminated;
                vec![Action::Terminate(Termination::Cancelled)]
            }
            _ => Vec::new(),
        }
    }
}

/// Client FSM variants, selected by the origin method.
pub enum ClientFsm {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

impl ClientFsm {
    pub fn on_event(&mut self, event: ClientEvent) -> Vec<Action> {
        match self {
            ClientFsm::Invite(fsm) => fsm.on_event(event),
            ClientFsm::NonInvite(fsm) => fsm.on_event(event),
        }
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            ClientFsm::Invite(fsm) => fsm.state == ClientInviteState::Terminated,
            ClientFsm::NonInvite(fsm) => fsm.state == ClientNonInviteState::Terminated,
        }
    }
}

/// Server FSM variants, selected by the origin method.
pub enum ServerFsm {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

impl ServerFsm {
    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Action> {
        match self {
            ServerFsm::Invite(fsm) => fsm.on_event(event),
            ServerFsm::NonInvite(fsm) => fsm.on_event(event),
        }
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            ServerFsm::Invite(fsm) => fsm.state == ServerInviteState::Terminated,
            ServerFsm::NonInvite(fsm) => fsm.state == ServerNonInviteState::Terminated,
        }
    }
}
