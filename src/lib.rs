//! Deterministic state machine for the CoAP client protocol.
//!
//! This library implements the client side of CoAP over UDP without
//! performing any I/O of its own: the core request/response layer with
//! confirmable-message reliability, the block-wise transfer extension in
//! both directions, and the Observe extension with automatic
//! re-registration.
//!
//! A [`Client`] consumes incoming datagrams and the current time through
//! [`handle_datagram`](Client::handle_datagram) and
//! [`handle_timeout`](Client::handle_timeout), and produces outgoing
//! datagrams, wake-up deadlines, and application events through
//! [`poll_transmit`](Client::poll_transmit),
//! [`poll_timeout`](Client::poll_timeout), and
//! [`poll_event`](Client::poll_event). The host owns the UDP sockets and
//! the timer; because every input is explicit, the whole protocol runs
//! deterministically under test.

#![warn(missing_docs)]

mod addr;
mod client;
mod coding;
mod config;
mod exchange;
mod message;
mod option;
mod shared;
#[cfg(test)]
mod tests;
mod token;
mod transaction;

pub use crate::addr::{EndpointAddr, InvalidAddr};
pub use crate::client::{Client, RequestError};
pub use crate::config::{ClientConfig, ConfigError, RequestOptions};
pub use crate::message::{Code, DecodeError, InvalidUri, Message, MessageId, Type};
pub use crate::option::{
    BlockOption, CoapOption, ContentFormat, OptionFormat, OptionNumber, DEFAULT_MAX_AGE,
};
pub use crate::shared::{ClientEvent, Event, RequestEvent, RequestHandle, Transmit};
pub use crate::token::{Token, TokenManager};

/// The CoAP protocol version carried in every message header
pub const VERSION: u8 = 1;

/// The default UDP port for CoAP
pub const DEFAULT_PORT: u16 = 5683;

/// The largest token the protocol can express, in bytes
pub const MAX_TOKEN_SIZE: usize = 8;
