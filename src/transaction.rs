//! Reliability scope of a single confirmable message.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::message::{ExchangeKey, Message};
use crate::shared::RequestHandle;

/// Retransmission state for one outstanding confirmable message
///
/// The initial timeout carries the jitter drawn by the client; each expiry
/// doubles it. The stored wire image is retransmitted verbatim so that the
/// remote's deduplication sees identical copies.
pub(crate) struct Transaction {
    pub(crate) message: Message,
    pub(crate) encoded: Bytes,
    pub(crate) retransmits: u32,
    pub(crate) current_timeout: Duration,
    pub(crate) next_fire: Instant,
    /// The exchange this message belongs to
    pub(crate) exchange: ExchangeKey,
    /// Request whose `timeout` mirrors this transaction's
    pub(crate) parent: Option<RequestHandle>,
}

/// What to do when a transaction's timer fires
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TimeoutVerdict {
    /// Send another copy and keep waiting
    Retransmit,
    /// The retransmission budget is spent
    Exhausted,
}

impl Transaction {
    pub(crate) fn new(
        now: Instant,
        message: Message,
        encoded: Bytes,
        initial_timeout: Duration,
        exchange: ExchangeKey,
        parent: Option<RequestHandle>,
    ) -> Self {
        Self {
            message,
            encoded,
            retransmits: 0,
            current_timeout: initial_timeout,
            next_fire: now + initial_timeout,
            exchange,
            parent,
        }
    }

    pub(crate) fn on_timeout(&mut self, now: Instant, max_retransmit: u32) -> TimeoutVerdict {
        self.retransmits += 1;
        if self.retransmits > max_retransmit {
            return TimeoutVerdict::Exhausted;
        }
        self.current_timeout *= 2;
        self.next_fire = now + self.current_timeout;
        TimeoutVerdict::Retransmit
    }
}
