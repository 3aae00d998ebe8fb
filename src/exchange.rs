//! Per-(endpoint, token) exchange state.
//!
//! An exchange is one logical operation: the original request plus every
//! response, block follow-up, and notification correlated to its token.
//! This module owns the pure state transitions (block segmentation and
//! reassembly, Observe sequence tracking, deadline bookkeeping); the
//! client orchestrates them into messages and events.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::message::{Code, ExchangeKey, Message, TransactionKey};
use crate::option::{szx_for_size, BlockOption, DEFAULT_MAX_AGE};

/// Reordering window for Observe sequence numbers
const OBSERVE_SERIAL_WINDOW: u32 = 1 << 23;
/// A notification older than this is fresh regardless of sequence numbers
const OBSERVE_ROLLOVER_AGE: Duration = Duration::from_millis(128_000);

/// Effective parameters of one exchange, after per-request overrides
#[derive(Debug, Copy, Clone)]
pub(crate) struct ExchangeParams {
    pub(crate) block_size: usize,
    pub(crate) exchange_timeout: Duration,
    pub(crate) max_retransmit: u32,
}

/// Cursor over an outgoing block-wise body
pub(crate) struct Block1Cursor {
    body: Bytes,
    szx: u8,
    next_num: u32,
}

/// Progress of an upload after a Block1 acknowledgement
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Block1Progress {
    /// The block was accepted and more remain
    More,
    /// The last block was accepted
    Complete,
    /// The acknowledgement does not match what we sent
    Mismatch,
}

impl Block1Cursor {
    pub(crate) fn new(body: Bytes, block_size: usize) -> Self {
        Self {
            body,
            szx: szx_for_size(block_size),
            next_num: 0,
        }
    }

    fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// The descriptor and payload slice of the next block, advancing the cursor
    pub(crate) fn next_block(&mut self) -> (BlockOption, Bytes) {
        let num = self.next_num;
        self.next_num += 1;
        let offset = num as usize * self.size();
        let end = (offset + self.size()).min(self.body.len());
        let block = BlockOption::new(num, end < self.body.len(), self.szx);
        (block, self.body.slice(offset..end))
    }

    /// Digest the server's acknowledgement of the block we last sent
    ///
    /// The server may negotiate the block size down; the cursor position is
    /// then recomputed in the new units.
    pub(crate) fn ack(&mut self, acked: BlockOption) -> Block1Progress {
        let sent = match self.next_num.checked_sub(1) {
            Some(num) => num,
            None => return Block1Progress::Mismatch,
        };
        if acked.num != sent || acked.szx > self.szx {
            return Block1Progress::Mismatch;
        }
        if acked.szx < self.szx {
            // Same byte offset, expressed in the smaller block size; the
            // ratio of two block sizes is integral, so this is exact.
            let ratio = (self.size() / acked.size()) as u32;
            self.next_num = (sent + 1) * ratio;
            self.szx = acked.szx;
        }
        if self.next_num as usize * self.size() >= self.body.len() {
            Block1Progress::Complete
        } else {
            Block1Progress::More
        }
    }
}

/// Reassembly state of an incoming block-wise body
pub(crate) struct Block2State {
    current: BlockOption,
    /// Observe value of the first block, pinned for the whole sequence
    observe_seq: Option<u32>,
    payload: BytesMut,
}

/// Verdict on one incoming Block2 block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Block2Verdict {
    /// The block extends the body; more blocks follow
    Accepted,
    /// The block completes the body
    Last,
    /// The block does not continue the sequence and is ignored
    Invalid,
}

/// One in-flight exchange
pub(crate) struct Exchange {
    /// The user's original request
    pub(crate) request: Message,
    pub(crate) key: ExchangeKey,
    pub(crate) params: ExchangeParams,
    /// Outgoing block-wise upload, when the body exceeds the block size
    pub(crate) block1: Option<Block1Cursor>,
    /// Incoming block-wise download, once a Block2 response arrives
    pub(crate) block2: Option<Block2State>,
    /// Whether the client may drive Block2 reassembly for this exchange
    ///
    /// False when the user's request declared its own Block2, taking over
    /// block handling.
    pub(crate) blockwise_response: bool,
    /// GET carrying Observe: eligible to become a subscription
    pub(crate) eligible: bool,
    /// An entry for this exchange exists in the observer index
    pub(crate) observer: bool,
    /// The Uri-Path key of the observer index entry
    pub(crate) observer_path: String,
    /// Sequence number and arrival time of the last accepted notification
    pub(crate) last_observe: Option<(u32, Instant)>,
    /// Max-Age of the last accepted response, for re-arming the deadline
    pub(crate) last_max_age: u32,
    /// The server pushes follow-up blocks without being asked
    pub(crate) server_initiative: bool,
    /// When the exchange times out
    pub(crate) deadline: Instant,
    /// The currently outstanding transaction, if any
    pub(crate) transaction: Option<TransactionKey>,
}

impl Exchange {
    pub(crate) fn new(
        now: Instant,
        request: Message,
        key: ExchangeKey,
        params: ExchangeParams,
        blockwise_response: bool,
    ) -> Self {
        let eligible = request.code == Code::GET && request.observe().is_some();
        let observer_path = request.uri_path();
        Self {
            request,
            key,
            params,
            block1: None,
            block2: None,
            blockwise_response,
            eligible,
            observer: false,
            observer_path,
            last_observe: None,
            last_max_age: DEFAULT_MAX_AGE,
            server_initiative: false,
            deadline: now + params.exchange_timeout,
            transaction: None,
        }
    }

    /// Whether a notification carrying `value` at `at` is newer than the
    /// last accepted one
    ///
    /// Serial-number arithmetic over the 24-bit Observe space, with a
    /// recency override: anything is fresh once the last notification is
    /// old enough that the sequence may have wrapped entirely.
    pub(crate) fn is_newer_observe(&self, value: u32, at: Instant) -> bool {
        match self.last_observe {
            None => true,
            Some((last, last_at)) => {
                (last < value && value - last < OBSERVE_SERIAL_WINDOW)
                    || (last > value && last - value > OBSERVE_SERIAL_WINDOW)
                    || at > last_at + OBSERVE_ROLLOVER_AGE
            }
        }
    }

    /// Record an accepted notification
    pub(crate) fn record_observe(&mut self, value: u32, at: Instant) {
        self.last_observe = Some((value, at));
    }

    /// Offer one incoming Block2 block to the reassembly state
    pub(crate) fn offer_block2(&mut self, block: BlockOption, msg: &Message) -> Block2Verdict {
        // Reserved size exponent, or a block larger than we negotiate
        if block.szx > 6 || block.size() > self.params.block_size {
            return Block2Verdict::Invalid;
        }
        match &mut self.block2 {
            None => {
                // A valid first block has NUM=0
                if block.num != 0 {
                    return Block2Verdict::Invalid;
                }
                let mut payload = BytesMut::with_capacity(msg.payload.len());
                payload.extend_from_slice(&msg.payload);
                self.block2 = Some(Block2State {
                    current: block,
                    observe_seq: msg.observe(),
                    payload,
                });
            }
            Some(state) => {
                if block.num != state.current.num + 1 || block.szx > state.current.szx {
                    return Block2Verdict::Invalid;
                }
                // Notification-driven sequences must not interleave
                if state.observe_seq.is_some() && msg.observe() != state.observe_seq {
                    return Block2Verdict::Invalid;
                }
                state.payload.extend_from_slice(&msg.payload);
                state.current = block;
            }
        }
        if block.m {
            Block2Verdict::Accepted
        } else {
            Block2Verdict::Last
        }
    }

    /// Synthesize the complete response from the final block
    ///
    /// Copies the last block's type, code, ID, token, options, and endpoint,
    /// carrying the concatenated payload; consumes the reassembly state.
    pub(crate) fn assemble_response(&mut self, last: &Message) -> Message {
        let state = self.block2.take().expect("no block2 state to assemble");
        let mut response = last.clone();
        response.payload = state.payload.freeze();
        response
    }

    /// The next Block2 descriptor to request after an accepted block
    pub(crate) fn next_block2_request(&self) -> Option<BlockOption> {
        let state = self.block2.as_ref()?;
        Some(BlockOption::new(
            state.current.num + 1,
            false,
            state.current.szx,
        ))
    }

    /// Re-arm the deadline after progress
    ///
    /// Active subscriptions wait out the server's freshness horizon, so a
    /// missed notification triggers re-registration; everything else keeps
    /// the configured exchange window.
    pub(crate) fn re_arm(&mut self, now: Instant) {
        self.deadline = if self.observer {
            now + Duration::from_secs(u64::from(self.last_max_age))
        } else {
            now + self.params.exchange_timeout
        };
    }
}
