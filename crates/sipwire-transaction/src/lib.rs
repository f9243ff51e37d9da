// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! The four transaction state machines (INVITE and non-INVITE, client and
//! server) live in [`fsm`]; [`TransactionLayer`] owns their instances,
//! matches inbound messages to them with the keys of [`key`], and runs the
//! RFC timer set of [`timers`] over the transport layer.

use rand::Rng;
use smol_str::SmolStr;
use thiserror::Error;

use sipwire_core::MAGIC_COOKIE;

pub mod fsm;
pub mod key;
pub mod layer;
pub mod timers;

pub use fsm::{
    Action, ClientEvent, ClientFsm, ClientInviteFsm, ClientInviteState, ClientNonInviteFsm,
    ClientNonInviteState, ServerEvent, ServerFsm, ServerInviteFsm, ServerInviteState,
    ServerNonInviteFsm, ServerNonInviteState, Termination,
};
pub use key::{ClientKey, ServerKey};
pub use layer::TransactionLayer;
pub use timers::{TimerDefaults, TransactionTimer, TransportTimers};

/// Failures surfaced by the transaction layer.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// Timer B, F or H fired before the transaction could complete.
    #[error("transaction {key} timed out")]
    Timeout { key: SmolStr },
    /// The transport failed underneath an in-flight transaction.
    #[error("transport failure on transaction {key}: {reason}")]
    Transport { key: SmolStr, reason: String },
    /// The transaction was terminated by layer shutdown.
    #[error("transaction {key} cancelled by shutdown")]
    Cancelled { key: SmolStr },
    /// A transaction with this key is already live.
    #[error("transaction {0} already exists")]
    DuplicateTransaction(SmolStr),
    /// No live transaction matches the message.
    #[error("no transaction matches {0}")]
    NotFound(SmolStr),
    /// The request has no branch parameter in its top Via.
    #[error("message carries no Via branch")]
    MissingBranch,
    /// The message has no parseable CSeq header.
    #[error("message carries no CSeq header")]
    MissingCSeq,
    /// The layer is shut down; no new work is accepted.
    #[error("transaction layer is shut down")]
    Stopped,
}

/// Generates an RFC 3261 branch: the magic cookie followed by 72 random
/// bits, hex-encoded.
pub fn generate_branch() -> SmolStr {
    let mut rng = rand::thread_rng();
    let mut suffix = String::with_capacity(18);
    for _ in 0..9 {
        let byte: u8 = rng.gen();
        suffix.push_str(&format!("{:02x}", byte));
    }
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_carries_magic_cookie_and_72_bits() {
        let branch = generate_branch();
        assert!(branch.starts_with(MAGIC_COOKIE));
        let suffix = &branch[MAGIC_COOKIE.len()..];
        assert_eq!(suffix.len(), 18);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn branches_are_unique() {
        let a = generate_branch();
        let b = generate_branch();
        assert_ne!(a, b);
    }
}
