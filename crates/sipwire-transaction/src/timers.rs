// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values per RFC 3261 §17 Table 4.
//!
//! Reliable transports (TCP) suppress the retransmission timers entirely
//! and collapse the linger timers to zero, so transactions over TCP
//! terminate as soon as their final response is handled. The timeout
//! timers B, F, and H stay at 64·T1 on every transport.

use std::time::Duration;

use sipwire_transport::TransportKind;

/// Timers referenced by the four transaction state machines.
///
/// `Trying100` is not an RFC letter timer: it is the 200 ms delay before an
/// INVITE server transaction answers 100 Trying on the TU's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    Trying100,
}

/// RFC 3261 base timer values (Table 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate, 500 ms by default. Must not go below that on the open
    /// internet; tests shrink it.
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests, 4 s.
    pub t2: Duration,
    /// Maximum time a message stays in the network, 5 s.
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Delay before the automatic 100 Trying when the TU stays silent.
pub const TRYING_100_DELAY: Duration = Duration::from_millis(200);

/// Minimum Timer D wait on unreliable transports.
const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);

/// Computes concrete timer durations for one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportTimers {
    kind: TransportKind,
    defaults: TimerDefaults,
}

impl TransportTimers {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(kind: TransportKind, defaults: TimerDefaults) -> Self {
        Self { kind, defaults }
    }

    pub fn defaults(&self) -> TimerDefaults {
        self.defaults
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// True when the transport needs retransmission timers at all.
    pub fn retransmits(&self) -> bool {
        !self.kind.is_reliable()
    }

    /// Initial duration for a timer; zero means "fire immediately".
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.kind.is_reliable();
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.defaults.t1.saturating_mul(64)
            }
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    TIMER_D_UNRELIABLE
                }
            }
            TransactionTimer::I | TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
            TransactionTimer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1.saturating_mul(64)
                }
            }
            TransactionTimer::Trying100 => TRYING_100_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_uses_full_values() {
        let timers = TransportTimers::new(TransportKind::Udp);
        assert_eq!(
            timers.duration(TransactionTimer::A),
            Duration::from_millis(500)
        );
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::J), Duration::from_secs(32));
        assert!(timers.retransmits());
    }

    #[test]
    fn tcp_collapses_retransmit_and_linger_timers() {
        let timers = TransportTimers::new(TransportKind::Tcp);
        for timer in [
            TransactionTimer::A,
            TransactionTimer::E,
            TransactionTimer::G,
            TransactionTimer::D,
            TransactionTimer::I,
            TransactionTimer::J,
            TransactionTimer::K,
        ] {
            assert_eq!(timers.duration(timer), Duration::ZERO, "{:?}", timer);
        }
        assert!(!timers.retransmits());
    }

    #[test]
    fn timeout_timers_are_64_t1_everywhere() {
        for kind in [TransportKind::Udp, TransportKind::Tcp] {
            let timers = TransportTimers::new(kind);
            for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
                assert_eq!(timers.duration(timer), Duration::from_secs(32));
            }
        }
    }

    #[test]
    fn custom_defaults_scale_timeouts() {
        let defaults = TimerDefaults {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(50),
        };
        let timers = TransportTimers::with_defaults(TransportKind::Udp, defaults);
        assert_eq!(
            timers.duration(TransactionTimer::B),
            Duration::from_millis(640)
        );
        assert_eq!(
            timers.duration(TransactionTimer::K),
            Duration::from_millis(50)
        );
    }
}
