//! Types shared between the client and its host: outgoing datagrams,
//! request handles, and the event vocabulary.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::addr::EndpointAddr;
use crate::message::{DecodeError, Message, MessageId};
use crate::option::BlockOption;

/// Handle to an in-flight request within a [`Client`](crate::Client)
///
/// Stable for the lifetime of the request's exchange; request-scoped events
/// are tagged with it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestHandle(pub(crate) usize);

impl From<RequestHandle> for usize {
    fn from(handle: RequestHandle) -> Self {
        handle.0
    }
}

/// An outgoing UDP datagram
///
/// The host writes `contents` to a socket of `destination`'s address
/// family. If the write fails synchronously, the host reports it back with
/// [`Client::send_failed`](crate::Client::send_failed).
#[derive(Debug)]
pub struct Transmit {
    /// The datagram's destination
    pub destination: SocketAddr,
    /// The encoded message
    pub contents: Bytes,
    /// The request this datagram belongs to, when it belongs to one
    pub request: Option<RequestHandle>,
}

/// An event surfaced by [`poll_event`](crate::Client::poll_event)
#[derive(Debug)]
pub enum Event {
    /// Client-level observability events
    Client(ClientEvent),
    /// Events scoped to one request
    Request(RequestHandle, RequestEvent),
}

/// Client-level events
#[derive(Debug)]
pub enum ClientEvent {
    /// A datagram was handed to the transmit queue
    MessageSent {
        /// The destination endpoint
        remote: EndpointAddr,
        /// The message as sent
        message: Message,
    },
    /// A datagram decoded successfully
    MessageReceived {
        /// The source endpoint
        remote: EndpointAddr,
        /// The decoded message
        message: Message,
    },
    /// A datagram failed to decode and was dropped
    Error {
        /// The source endpoint
        remote: EndpointAddr,
        /// Why decoding failed
        error: DecodeError,
    },
    /// A confirmable message exhausted its retransmission budget
    TransactionTimeout {
        /// The destination that never acknowledged
        remote: EndpointAddr,
        /// The message ID of the abandoned transaction
        id: MessageId,
        /// The request the transaction belonged to, if any
        request: Option<RequestHandle>,
    },
    /// An exchange made no progress within its window
    ExchangeTimeout {
        /// The affected request
        request: RequestHandle,
    },
}

/// Events scoped to a single request
#[derive(Debug)]
pub enum RequestEvent {
    /// The remote acknowledged a confirmable message of this exchange
    Acknowledged {
        /// The acknowledgement, possibly carrying a piggy-backed response
        message: Message,
    },
    /// The remote reset a message of this exchange
    Reset {
        /// The reset message
        message: Message,
    },
    /// A complete response body is available
    ///
    /// Emitted once per completed body; for subscriptions, once per
    /// accepted notification sequence.
    Response {
        /// The response, with block transfers already reassembled
        message: Message,
    },
    /// One outgoing block of a block-wise upload was accepted
    BlockSent {
        /// The acknowledged block descriptor
        block: BlockOption,
    },
    /// One incoming block of a block-wise download was accepted
    BlockReceived {
        /// The block message
        message: Message,
    },
    /// The retransmission or exchange budget ran out
    Timeout,
    /// The request was cancelled
    Cancelled,
    /// The host failed to send a datagram of this request
    Error {
        /// The I/O error reported by the host
        error: io::Error,
    },
}
