//! The client coordinator.
//!
//! [`Client`] owns every table of the runtime: in-flight transactions and
//! exchanges, the observer index, the duplicate and reply caches, and the
//! identifier allocators. It performs no I/O; the host feeds it datagrams
//! and time, and drains datagrams, deadlines, and events back out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::addr::EndpointAddr;
use crate::config::{ClientConfig, ConfigError, RequestOptions};
use crate::exchange::{Block1Cursor, Block1Progress, Block2Verdict, Exchange, ExchangeParams};
use crate::message::{
    Code, ExchangeKey, InvalidUri, Message, MessageId, MessageKey, TransactionKey, Type,
};
use crate::option::{BlockOption, DEFAULT_MAX_AGE};
use crate::shared::{ClientEvent, Event, RequestEvent, RequestHandle, Transmit};
use crate::token::TokenManager;
use crate::transaction::{TimeoutVerdict, Transaction};

/// Errors from [`Client::request`] and the method shorthands
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RequestError {
    /// The message code is not a request method
    #[error("code {0} is not a request method")]
    InvalidCode(Code),
    /// The message has no remote endpoint
    #[error("no remote endpoint set")]
    MissingRemote,
    /// The request URI could not be parsed
    #[error("invalid request URI: {0}")]
    InvalidUri(#[from] InvalidUri),
    /// The client has been destroyed
    #[error("client destroyed")]
    Destroyed,
}

/// The CoAP client state machine
///
/// This object performs no I/O whatsoever. The host reads datagrams from
/// its sockets and feeds them to [`handle_datagram`](Client::handle_datagram),
/// drives timers by calling [`handle_timeout`](Client::handle_timeout) at
/// the deadline reported by [`poll_timeout`](Client::poll_timeout), writes
/// out everything [`poll_transmit`](Client::poll_transmit) yields, and
/// consumes application events from [`poll_event`](Client::poll_event).
pub struct Client {
    config: ClientConfig,
    rng: StdRng,
    tokens: TokenManager,
    next_id: u16,
    /// Exchange state, indexed by request handle
    requests: Slab<Exchange>,
    /// (endpoint, token) -> request handle
    exchanges: FxHashMap<ExchangeKey, RequestHandle>,
    /// Outstanding confirmable messages awaiting ACK or RST
    transactions: FxHashMap<TransactionKey, Transaction>,
    /// endpoint -> Uri-Path -> subscribed request
    observers: FxHashMap<EndpointAddr, FxHashMap<String, RequestHandle>>,
    /// Recently seen server messages, for duplicate suppression
    duplicates: FxHashMap<MessageKey, TransactionKey>,
    dedup_expiry: BinaryHeap<Reverse<(Instant, MessageKey)>>,
    /// Encoded ACK/RST replies, replayed when their trigger is duplicated
    replies: FxHashMap<TransactionKey, Bytes>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    destroyed: bool,
}

impl Client {
    /// Create a client
    ///
    /// Returns `Err` if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_entropy(),
        };
        let tokens = TokenManager::new(config.max_token_size, config.empty_token_safekeeping);
        Ok(Self {
            config,
            rng,
            tokens,
            next_id: 0,
            requests: Slab::new(),
            exchanges: FxHashMap::default(),
            transactions: FxHashMap::default(),
            observers: FxHashMap::default(),
            duplicates: FxHashMap::default(),
            dedup_expiry: BinaryHeap::new(),
            replies: FxHashMap::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            destroyed: false,
        })
    }

    //
    // Public operations
    //

    /// Issue a request
    ///
    /// Assigns the next message ID and a fresh token, creates the exchange,
    /// and queues the first datagram; bodies larger than the block size go
    /// out block-wise. Events for the returned handle only become visible
    /// through [`poll_event`](Client::poll_event), so a caller always holds
    /// the handle before the first event fires.
    pub fn request(
        &mut self,
        now: Instant,
        mut msg: Message,
        options: RequestOptions,
    ) -> Result<RequestHandle, RequestError> {
        if self.destroyed {
            return Err(RequestError::Destroyed);
        }
        if !msg.code.is_request() {
            return Err(RequestError::InvalidCode(msg.code));
        }
        let remote = msg.remote.ok_or(RequestError::MissingRemote)?;
        msg.ty = if options.confirmable {
            Type::Con
        } else {
            Type::Non
        };
        msg.id = self.next_message_id();
        msg.token = self.tokens.acquire();

        // A user-declared Block2 takes over response block handling
        let user_block2 = msg.block2().is_some();
        let block_size = options.block_size.unwrap_or(self.config.block_size);
        if (options.include_block2 || options.block_size.is_some())
            && msg.code == Code::GET
            && !user_block2
        {
            msg.set_block2(Some(BlockOption::from_size(0, false, block_size)));
        }

        let params = ExchangeParams {
            block_size,
            exchange_timeout: options
                .exchange_timeout
                .unwrap_or_else(|| self.config.effective_exchange_timeout()),
            max_retransmit: options.max_retransmit.unwrap_or(self.config.max_retransmit),
        };
        let key = (remote, msg.token);
        let mut exchange = Exchange::new(now, msg.clone(), key, params, !user_block2);

        let outgoing = if msg.payload.len() > block_size && msg.block1().is_none() {
            let mut cursor = Block1Cursor::new(msg.payload.clone(), block_size);
            let (block, slice) = cursor.next_block();
            exchange.block1 = Some(cursor);
            let mut first = msg;
            first.set_block1(Some(block));
            first.payload = slice;
            first
        } else {
            msg
        };

        let handle = RequestHandle(self.requests.insert(exchange));
        self.exchanges.insert(key, handle);
        debug!(request = handle.0, %remote, code = ?outgoing.code, "new request");
        self.send_request_message(now, handle, remote, outgoing);
        Ok(handle)
    }

    /// GET the given URI
    pub fn get(&mut self, now: Instant, uri: &str) -> Result<RequestHandle, RequestError> {
        let mut msg = Message::request(Code::GET);
        msg.set_uri(uri)?;
        self.request(now, msg, RequestOptions::default())
    }

    /// GET the given URI and register for notifications
    pub fn observe(&mut self, now: Instant, uri: &str) -> Result<RequestHandle, RequestError> {
        let mut msg = Message::request(Code::GET);
        msg.set_uri(uri)?;
        msg.set_observe(Some(0));
        self.request(now, msg, RequestOptions::default())
    }

    /// POST a body to the given URI
    pub fn post(
        &mut self,
        now: Instant,
        uri: &str,
        payload: Bytes,
    ) -> Result<RequestHandle, RequestError> {
        let mut msg = Message::request(Code::POST);
        msg.set_uri(uri)?;
        msg.payload = payload;
        self.request(now, msg, RequestOptions::default())
    }

    /// PUT a body to the given URI
    pub fn put(
        &mut self,
        now: Instant,
        uri: &str,
        payload: Bytes,
    ) -> Result<RequestHandle, RequestError> {
        let mut msg = Message::request(Code::PUT);
        msg.set_uri(uri)?;
        msg.payload = payload;
        self.request(now, msg, RequestOptions::default())
    }

    /// DELETE the given URI
    pub fn delete(&mut self, now: Instant, uri: &str) -> Result<RequestHandle, RequestError> {
        let mut msg = Message::request(Code::DELETE);
        msg.set_uri(uri)?;
        self.request(now, msg, RequestOptions::default())
    }

    /// Cancel a request
    ///
    /// Idempotent. Stops retransmissions, drops any subscription, and
    /// releases the token. Observer-eligible requests see one final
    /// `Cancelled` event; nothing else is emitted afterwards.
    pub fn cancel(&mut self, now: Instant, handle: RequestHandle) {
        if self.destroyed || !self.requests.contains(handle.0) {
            return;
        }
        debug!(request = handle.0, "cancel");
        let eligible = self.requests[handle.0].eligible;
        self.finish_exchange(now, handle);
        if eligible {
            self.events
                .push_back(Event::Request(handle, RequestEvent::Cancelled));
        }
    }

    /// Tear down the client
    ///
    /// Cancels every timer, forgets all state, and empties the queues; no
    /// event is ever observable afterwards. The host closes the sockets.
    pub fn destroy(&mut self) {
        debug!("destroy");
        self.destroyed = true;
        self.requests.clear();
        self.exchanges.clear();
        self.transactions.clear();
        self.observers.clear();
        self.duplicates.clear();
        self.dedup_expiry.clear();
        self.replies.clear();
        self.transmits.clear();
        self.events.clear();
        self.tokens.clear();
    }

    //
    // Polling surface
    //

    /// Get the next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Get the next application event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// The earliest instant at which [`handle_timeout`](Client::handle_timeout)
    /// needs to run
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut merge = |t: Instant| match next {
            Some(n) if n <= t => {}
            _ => next = Some(t),
        };
        for transaction in self.transactions.values() {
            merge(transaction.next_fire);
        }
        for (_, exchange) in self.requests.iter() {
            merge(exchange.deadline);
        }
        if let Some(&Reverse((deadline, _))) = self.dedup_expiry.peek() {
            merge(deadline);
        }
        next
    }

    /// Report a synchronous send failure for a previously polled transmit
    ///
    /// Surfaces as a deferred `Error` event on the originating request, so
    /// that callers subscribing right after `request` still see it.
    pub fn send_failed(&mut self, transmit: &Transmit, error: io::Error) {
        if self.destroyed {
            return;
        }
        warn!(destination = %transmit.destination, %error, "send failed");
        if let Some(handle) = transmit.request {
            if self.requests.contains(handle.0) {
                self.events
                    .push_back(Event::Request(handle, RequestEvent::Error { error }));
            }
        }
    }

    //
    // Incoming dispatch
    //

    /// Process an incoming UDP datagram
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, datagram: &[u8]) {
        if self.destroyed {
            return;
        }
        let remote = EndpointAddr::from(remote);
        let mut msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(error) => {
                warn!(%remote, %error, "malformed datagram");
                self.events
                    .push_back(Event::Client(ClientEvent::Error { remote, error }));
                return;
            }
        };
        msg.remote = Some(remote);
        msg.timestamp = Some(now);
        trace!(%remote, ty = ?msg.ty, code = ?msg.code, id = %msg.id, "receive");
        self.events.push_back(Event::Client(ClientEvent::MessageReceived {
            remote,
            message: msg.clone(),
        }));

        // Duplicate suppression: replay the cached reply, if any, and stop
        let mkey = (remote, msg.id, msg.ty);
        if let Some(&tkey) = self.duplicates.get(&mkey) {
            trace!(%remote, id = %msg.id, "duplicate");
            if let Some(reply) = self.replies.get(&tkey) {
                self.transmits.push_back(Transmit {
                    destination: remote.socket_addr(),
                    contents: reply.clone(),
                    request: None,
                });
            }
            return;
        }
        let tkey: TransactionKey = (remote, msg.id);
        self.duplicates.insert(mkey, tkey);
        self.dedup_expiry.push(Reverse((
            now + self.config.effective_duplicate_timeout(),
            mkey,
        )));

        // Only servers answer requests
        if msg.code.is_request() {
            warn!(%remote, code = ?msg.code, "unsolicited request");
            if msg.ty == Type::Con {
                self.send_reply(remote, rst_for(&msg), tkey);
            }
            return;
        }

        if msg.ty == Type::Rst {
            self.handle_rst(now, tkey, msg);
            return;
        }
        if msg.ty == Type::Ack && msg.code.is_empty() {
            self.handle_empty_ack(tkey, msg);
            return;
        }

        // Correlate the response by token
        let ekey = (remote, msg.token);
        let Some(&handle) = self.exchanges.get(&ekey) else {
            warn!(%remote, token = %msg.token, "unmatched response");
            if msg.ty == Type::Con {
                self.send_reply(remote, rst_for(&msg), tkey);
            }
            return;
        };
        self.handle_exchange_message(now, handle, remote, msg);
    }

    /// Drive every timer whose deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }
        while let Some(&Reverse((deadline, mkey))) = self.dedup_expiry.peek() {
            if deadline > now {
                break;
            }
            self.dedup_expiry.pop();
            if let Some(tkey) = self.duplicates.remove(&mkey) {
                self.replies.remove(&tkey);
            }
        }

        let due = self
            .transactions
            .iter()
            .filter(|(_, t)| t.next_fire <= now)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        for tkey in due {
            self.handle_transaction_timeout(now, tkey);
        }

        let due = self
            .requests
            .iter()
            .filter(|(_, exchange)| exchange.deadline <= now)
            .map(|(index, _)| RequestHandle(index))
            .collect::<Vec<_>>();
        for handle in due {
            if self.requests.contains(handle.0) {
                self.handle_exchange_timeout(now, handle);
            }
        }
    }

    //
    // Transactions
    //

    fn handle_transaction_timeout(&mut self, now: Instant, tkey: TransactionKey) {
        let Some(transaction) = self.transactions.get(&tkey) else {
            return;
        };
        let exchange_key = transaction.exchange;
        let max_retransmit = self
            .exchanges
            .get(&exchange_key)
            .map(|handle| self.requests[handle.0].params.max_retransmit)
            .unwrap_or(self.config.max_retransmit);

        let transaction = self.transactions.get_mut(&tkey).expect("checked above");
        match transaction.on_timeout(now, max_retransmit) {
            TimeoutVerdict::Retransmit => {
                trace!(id = %tkey.1, count = transaction.retransmits, "retransmit");
                let message = transaction.message.clone();
                let contents = transaction.encoded.clone();
                let request = self.exchanges.get(&exchange_key).copied();
                self.queue_transmit(tkey.0, contents, request, message);
            }
            TimeoutVerdict::Exhausted => {
                let transaction = self.transactions.remove(&tkey).expect("checked above");
                debug!(id = %tkey.1, "transaction timeout");
                self.events
                    .push_back(Event::Client(ClientEvent::TransactionTimeout {
                        remote: tkey.0,
                        id: tkey.1,
                        request: transaction.parent,
                    }));
                if let Some(parent) = transaction.parent {
                    if self.requests.contains(parent.0) {
                        self.events
                            .push_back(Event::Request(parent, RequestEvent::Timeout));
                    }
                }
                if let Some(&handle) = self.exchanges.get(&transaction.exchange) {
                    self.finish_exchange(now, handle);
                }
            }
        }
    }

    fn handle_rst(&mut self, now: Instant, tkey: TransactionKey, msg: Message) {
        let Some(transaction) = self.transactions.remove(&tkey) else {
            trace!(id = %tkey.1, "reset for unknown transaction");
            return;
        };
        debug!(id = %tkey.1, "transaction rejected");
        if let Some(parent) = transaction.parent {
            if self.requests.contains(parent.0) {
                self.events
                    .push_back(Event::Request(parent, RequestEvent::Reset { message: msg }));
            }
        }
        if let Some(&handle) = self.exchanges.get(&transaction.exchange) {
            self.finish_exchange(now, handle);
        }
    }

    fn handle_empty_ack(&mut self, tkey: TransactionKey, msg: Message) {
        let Some(transaction) = self.transactions.remove(&tkey) else {
            trace!(id = %tkey.1, "acknowledgement for unknown transaction");
            return;
        };
        // The exchange stays; a separate response follows
        if let Some(&handle) = self.exchanges.get(&transaction.exchange) {
            self.requests[handle.0].transaction = None;
        }
        if let Some(parent) = transaction.parent {
            if self.requests.contains(parent.0)
                && transaction.message.id == self.requests[parent.0].request.id
            {
                self.events.push_back(Event::Request(
                    parent,
                    RequestEvent::Acknowledged { message: msg },
                ));
            }
        }
    }

    //
    // Per-exchange handling
    //

    fn handle_exchange_message(
        &mut self,
        now: Instant,
        handle: RequestHandle,
        remote: EndpointAddr,
        msg: Message,
    ) {
        // Close out the transaction this message answers: by its own ID for
        // piggy-backed ACKs, or the exchange's outstanding one when a
        // separate response closes it implicitly.
        let tkey = (remote, msg.id);
        let mut closed = self.transactions.remove(&tkey).is_some();
        if !closed {
            if let Some(outstanding) = self.requests[handle.0].transaction {
                closed = self.transactions.remove(&outstanding).is_some();
            }
        }
        if closed {
            self.requests[handle.0].transaction = None;
            // Only the acknowledgement of the user's own message surfaces;
            // block follow-ups are acknowledged silently.
            if msg.ty == Type::Ack && msg.id == self.requests[handle.0].request.id {
                self.events.push_back(Event::Request(
                    handle,
                    RequestEvent::Acknowledged {
                        message: msg.clone(),
                    },
                ));
            }
        }

        // Late-notification filter
        if let Some(value) = msg.observe() {
            if !self.requests[handle.0].is_newer_observe(value, now) {
                debug!(observe = value, "late notification");
                if msg.ty == Type::Con {
                    self.send_reply(remote, ack_for(&msg), tkey);
                }
                return;
            }
            self.requests[handle.0].record_observe(value, now);
        }

        // Error responses terminate the exchange, clearing any subscription
        if msg.code.is_error() {
            if msg.ty == Type::Con {
                self.send_reply(remote, ack_for(&msg), tkey);
            }
            let was_subscribed = self.requests[handle.0].observer;
            let eligible = self.requests[handle.0].eligible;
            debug!(request = handle.0, code = ?msg.code, "error response");
            self.events
                .push_back(Event::Request(handle, RequestEvent::Response { message: msg }));
            self.finish_exchange(now, handle);
            if eligible && was_subscribed {
                self.events
                    .push_back(Event::Request(handle, RequestEvent::Cancelled));
            }
            return;
        }

        // Observer bookkeeping
        if msg.code.is_success() && self.requests[handle.0].eligible {
            if msg.observe().is_some() {
                self.register_observer(now, handle);
            } else if self.requests[handle.0].observer {
                debug!(request = handle.0, "observation ended by server");
                let endpoint = self.requests[handle.0].key.0;
                let path = self.requests[handle.0].observer_path.clone();
                self.remove_observer(endpoint, &path, handle);
                self.requests[handle.0].observer = false;
            }
        }

        // Priority order: Block1, then Block2, then a simple response
        if let Some(block1) = msg.block1() {
            if self.requests[handle.0].block1.is_some() {
                self.handle_block1_ack(now, handle, remote, block1, msg);
                return;
            }
        }
        if let Some(block2) = msg.block2() {
            if self.requests[handle.0].blockwise_response {
                self.handle_block2(now, handle, remote, block2, msg);
                return;
            }
        }
        self.deliver_response(now, handle, remote, msg);
    }

    fn register_observer(&mut self, now: Instant, handle: RequestHandle) {
        let endpoint = self.requests[handle.0].key.0;
        let path = self.requests[handle.0].observer_path.clone();
        let previous = self
            .observers
            .entry(endpoint)
            .or_default()
            .insert(path, handle);
        if !self.requests[handle.0].observer {
            debug!(request = handle.0, "observer registered");
            self.requests[handle.0].observer = true;
        }
        if let Some(previous) = previous {
            if previous != handle && self.requests.contains(previous.0) {
                // A newer subscription for the same resource wins
                debug!(request = previous.0, "observer replaced");
                self.requests[previous.0].observer = false;
                let eligible = self.requests[previous.0].eligible;
                self.finish_exchange(now, previous);
                if eligible {
                    self.events
                        .push_back(Event::Request(previous, RequestEvent::Cancelled));
                }
            }
        }
    }

    fn handle_block1_ack(
        &mut self,
        now: Instant,
        handle: RequestHandle,
        remote: EndpointAddr,
        acked: BlockOption,
        msg: Message,
    ) {
        if msg.ty == Type::Con {
            self.send_reply(remote, ack_for(&msg), (remote, msg.id));
        }
        let progress = self.requests[handle.0]
            .block1
            .as_mut()
            .expect("checked by caller")
            .ack(acked);
        match progress {
            Block1Progress::Mismatch => {
                // Stall; the exchange timer will fire eventually
                warn!(block = ?acked, "mismatched Block1 acknowledgement");
            }
            Block1Progress::More => {
                self.events
                    .push_back(Event::Request(handle, RequestEvent::BlockSent { block: acked }));
                self.send_next_block1(now, handle, remote);
            }
            Block1Progress::Complete => {
                self.events
                    .push_back(Event::Request(handle, RequestEvent::BlockSent { block: acked }));
                self.requests[handle.0].block1 = None;
                if let Some(block2) = msg.block2() {
                    // The upload's final ACK opens a block-wise response
                    if self.requests[handle.0].blockwise_response {
                        self.handle_block2(now, handle, remote, block2, msg);
                        return;
                    }
                }
                self.deliver_response(now, handle, remote, msg);
            }
        }
    }

    fn send_next_block1(&mut self, now: Instant, handle: RequestHandle, remote: EndpointAddr) {
        let id = self.next_message_id();
        let exchange = &mut self.requests[handle.0];
        let (block, slice) = exchange
            .block1
            .as_mut()
            .expect("upload in progress")
            .next_block();
        let mut msg = exchange.request.clone();
        msg.id = id;
        msg.set_block1(Some(block));
        msg.payload = slice;
        trace!(block = ?block, "next upload block");
        self.send_request_message(now, handle, remote, msg);
    }

    fn handle_block2(
        &mut self,
        now: Instant,
        handle: RequestHandle,
        remote: EndpointAddr,
        block: BlockOption,
        msg: Message,
    ) {
        let tkey = (remote, msg.id);
        match self.requests[handle.0].offer_block2(block, &msg) {
            Block2Verdict::Invalid => {
                warn!(block = ?block, "invalid block");
                // An ACK stops a confirmable sender's retransmissions when
                // the message is a notification; otherwise reject outright.
                if msg.ty == Type::Con {
                    if msg.observe().is_some() {
                        self.send_reply(remote, ack_for(&msg), tkey);
                    } else {
                        self.send_reply(remote, rst_for(&msg), tkey);
                    }
                }
                // The exchange now runs into its timeout
            }
            Block2Verdict::Accepted => {
                if msg.ty == Type::Con {
                    self.send_reply(remote, ack_for(&msg), tkey);
                }
                if msg.ty != Type::Ack {
                    // A pushed block means the server drives the transfer
                    self.requests[handle.0].server_initiative = true;
                }
                self.note_progress(now, handle, &msg);
                self.events.push_back(Event::Request(
                    handle,
                    RequestEvent::BlockReceived { message: msg },
                ));
                if !self.requests[handle.0].server_initiative {
                    self.request_next_block2(now, handle, remote);
                }
            }
            Block2Verdict::Last => {
                if msg.ty == Type::Con {
                    self.send_reply(remote, ack_for(&msg), tkey);
                }
                self.note_progress(now, handle, &msg);
                self.events.push_back(Event::Request(
                    handle,
                    RequestEvent::BlockReceived {
                        message: msg.clone(),
                    },
                ));
                let response = self.requests[handle.0].assemble_response(&msg);
                let keep = self.requests[handle.0].observer;
                self.events
                    .push_back(Event::Request(handle, RequestEvent::Response { message: response }));
                if !keep {
                    self.finish_exchange(now, handle);
                }
            }
        }
    }

    fn request_next_block2(&mut self, now: Instant, handle: RequestHandle, remote: EndpointAddr) {
        let id = self.next_message_id();
        let exchange = &mut self.requests[handle.0];
        let Some(block) = exchange.next_block2_request() else {
            return;
        };
        let mut msg = exchange.request.clone();
        msg.id = id;
        msg.set_block2(Some(block));
        // Follow-up block requests continue the transfer, not the
        // registration
        msg.set_observe(None);
        msg.payload = Bytes::new();
        trace!(block = ?block, "next download block");
        self.send_request_message(now, handle, remote, msg);
    }

    fn deliver_response(
        &mut self,
        now: Instant,
        handle: RequestHandle,
        remote: EndpointAddr,
        msg: Message,
    ) {
        if msg.ty == Type::Con {
            self.send_reply(remote, ack_for(&msg), (remote, msg.id));
        }
        self.note_progress(now, handle, &msg);
        let keep = self.requests[handle.0].observer;
        self.events
            .push_back(Event::Request(handle, RequestEvent::Response { message: msg }));
        if !keep {
            self.finish_exchange(now, handle);
        }
    }

    /// Record freshness from a successful block or response and re-arm the
    /// exchange timer
    fn note_progress(&mut self, now: Instant, handle: RequestHandle, msg: &Message) {
        let exchange = &mut self.requests[handle.0];
        exchange.last_max_age = msg.max_age().unwrap_or(DEFAULT_MAX_AGE);
        exchange.re_arm(now);
    }

    //
    // Exchange lifecycle
    //

    fn handle_exchange_timeout(&mut self, now: Instant, handle: RequestHandle) {
        self.events
            .push_back(Event::Client(ClientEvent::ExchangeTimeout { request: handle }));
        if self.requests[handle.0].observer {
            // A missed notification: re-register rather than give up
            self.reregister(now, handle);
        } else {
            debug!(request = handle.0, "exchange timeout");
            self.events
                .push_back(Event::Request(handle, RequestEvent::Timeout));
            self.finish_exchange(now, handle);
        }
    }

    /// Reissue an observation whose server went quiet, with a fresh
    /// message ID and token
    fn reregister(&mut self, now: Instant, handle: RequestHandle) {
        debug!(request = handle.0, "re-registering observation");
        let old_key = self.requests[handle.0].key;
        let path = self.requests[handle.0].observer_path.clone();
        self.exchanges.remove(&old_key);
        if let Some(outstanding) = self.requests[handle.0].transaction.take() {
            self.transactions.remove(&outstanding);
        }
        self.remove_observer(old_key.0, &path, handle);
        self.tokens.release(old_key.1, now);

        let token = self.tokens.acquire();
        let id = self.next_message_id();
        let key = (old_key.0, token);
        {
            let exchange = &mut self.requests[handle.0];
            exchange.observer = false;
            exchange.key = key;
            exchange.request.token = token;
            exchange.request.id = id;
            exchange.request.set_observe(Some(0));
            exchange.block1 = None;
            exchange.block2 = None;
            exchange.last_observe = None;
            exchange.server_initiative = false;
            exchange.deadline = now + exchange.params.exchange_timeout;
        }
        self.exchanges.insert(key, handle);
        let msg = self.requests[handle.0].request.clone();
        self.send_request_message(now, handle, old_key.0, msg);
    }

    fn finish_exchange(&mut self, now: Instant, handle: RequestHandle) {
        if !self.requests.contains(handle.0) {
            return;
        }
        let exchange = self.requests.remove(handle.0);
        self.exchanges.remove(&exchange.key);
        if let Some(outstanding) = exchange.transaction {
            self.transactions.remove(&outstanding);
        }
        if exchange.observer {
            self.remove_observer(exchange.key.0, &exchange.observer_path, handle);
        }
        self.tokens.release(exchange.key.1, now);
        trace!(request = handle.0, "exchange finished");
    }

    fn remove_observer(&mut self, endpoint: EndpointAddr, path: &str, handle: RequestHandle) {
        if let Some(paths) = self.observers.get_mut(&endpoint) {
            if paths.get(path) == Some(&handle) {
                paths.remove(path);
                if paths.is_empty() {
                    self.observers.remove(&endpoint);
                }
            }
        }
    }

    //
    // Egress
    //

    /// Encode and queue a message belonging to a request, creating its
    /// transaction when confirmable
    fn send_request_message(
        &mut self,
        now: Instant,
        handle: RequestHandle,
        remote: EndpointAddr,
        msg: Message,
    ) {
        let encoded = msg.encode();
        if msg.ty == Type::Con {
            let timeout = self.initial_timeout();
            let tkey = (remote, msg.id);
            let exchange_key = self.requests[handle.0].key;
            self.requests[handle.0].transaction = Some(tkey);
            self.transactions.insert(
                tkey,
                Transaction::new(now, msg.clone(), encoded.clone(), timeout, exchange_key, Some(handle)),
            );
        }
        self.queue_transmit(remote, encoded, Some(handle), msg);
    }

    /// Queue an ACK or RST answering a server message, and remember it for
    /// duplicate replay
    fn send_reply(&mut self, remote: EndpointAddr, reply: Message, tkey: TransactionKey) {
        let encoded = reply.encode();
        self.replies.insert(tkey, encoded.clone());
        self.queue_transmit(remote, encoded, None, reply);
    }

    fn queue_transmit(
        &mut self,
        remote: EndpointAddr,
        contents: Bytes,
        request: Option<RequestHandle>,
        message: Message,
    ) {
        trace!(%remote, ty = ?message.ty, code = ?message.code, id = %message.id, "send");
        self.transmits.push_back(Transmit {
            destination: remote.socket_addr(),
            contents,
            request,
        });
        self.events
            .push_back(Event::Client(ClientEvent::MessageSent { remote, message }));
    }

    fn next_message_id(&mut self) -> MessageId {
        self.next_id = if self.next_id == u16::MAX {
            1
        } else {
            self.next_id + 1
        };
        MessageId(self.next_id)
    }

    /// The jittered timeout before a confirmable message's first
    /// retransmission
    fn initial_timeout(&mut self) -> Duration {
        if self.config.ack_random_factor <= 1.0 {
            return self.config.ack_timeout;
        }
        self.config
            .ack_timeout
            .mul_f64(self.rng.gen_range(1.0..self.config.ack_random_factor))
    }
}

fn ack_for(msg: &Message) -> Message {
    let mut ack = Message::new(Type::Ack, Code::EMPTY);
    ack.id = msg.id;
    ack.remote = msg.remote;
    ack
}

fn rst_for(msg: &Message) -> Message {
    let mut rst = Message::new(Type::Rst, Code::EMPTY);
    rst.id = msg.id;
    rst.remote = msg.remote;
    rst
}
