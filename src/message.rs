//! The CoAP message: wire codec and typed option access.
//!
//! A datagram is a 4-byte fixed header (version, type, token length, code,
//! message ID), the token, a delta-encoded option list, and an optional
//! payload introduced by the 0xFF marker. [`Message`] is the decoded form;
//! it also carries the remote endpoint and receive timestamp stamped on by
//! the client, which never appear on the wire.

use std::time::Instant;
use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::addr::EndpointAddr;
use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::option::{BlockOption, CoapOption, ContentFormat, OptionNumber};
use crate::token::Token;
use crate::{MAX_TOKEN_SIZE, VERSION};

/// Key of the reliability scope: one message ID at one endpoint
pub(crate) type TransactionKey = (EndpointAddr, MessageId);
/// Key of the logical operation: one token at one endpoint
pub(crate) type ExchangeKey = (EndpointAddr, Token);
/// Key of the duplicate-detection scope
pub(crate) type MessageKey = (EndpointAddr, MessageId, Type);

/// CoAP message type
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Type {
    /// Confirmable; retransmitted until acknowledged or reset
    Con = 0,
    /// Non-confirmable; fire and forget
    Non = 1,
    /// Acknowledgement of a confirmable message
    Ack = 2,
    /// Reset; the referenced message could not be processed
    Rst = 3,
}

impl Type {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Type::Con,
            1 => Type::Non,
            2 => Type::Ack,
            3 => Type::Rst,
            _ => unreachable!(),
        }
    }
}

/// Message code, split into a 3-bit class and a 5-bit detail
///
/// Class 0 holds requests, class 2 success responses, classes 4 and 5
/// client and server errors. `0.00` is the Empty code used by pure ACK and
/// RST messages.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(pub u8);

macro_rules! codes {
    {$($name:ident = $val:expr, $str:expr;)*} => {
        impl Code {
            $(
                #[doc = $str]
                pub const $name: Code = Code($val);
            )*

            /// The registered name of this code, if known
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some($str),)*
                    _ => None,
                }
            }
        }
    }
}

codes! {
    EMPTY = 0x00, "Empty";
    GET = 0x01, "GET";
    POST = 0x02, "POST";
    PUT = 0x03, "PUT";
    DELETE = 0x04, "DELETE";
    CREATED = 0x41, "Created";
    DELETED = 0x42, "Deleted";
    VALID = 0x43, "Valid";
    CHANGED = 0x44, "Changed";
    CONTENT = 0x45, "Content";
    CONTINUE = 0x5F, "Continue";
    BAD_REQUEST = 0x80, "Bad Request";
    UNAUTHORIZED = 0x81, "Unauthorized";
    BAD_OPTION = 0x82, "Bad Option";
    FORBIDDEN = 0x83, "Forbidden";
    NOT_FOUND = 0x84, "Not Found";
    METHOD_NOT_ALLOWED = 0x85, "Method Not Allowed";
    NOT_ACCEPTABLE = 0x86, "Not Acceptable";
    REQUEST_ENTITY_INCOMPLETE = 0x88, "Request Entity Incomplete";
    PRECONDITION_FAILED = 0x8C, "Precondition Failed";
    REQUEST_ENTITY_TOO_LARGE = 0x8D, "Request Entity Too Large";
    UNSUPPORTED_CONTENT_FORMAT = 0x8F, "Unsupported Content-Format";
    INTERNAL_SERVER_ERROR = 0xA0, "Internal Server Error";
    NOT_IMPLEMENTED = 0xA1, "Not Implemented";
    BAD_GATEWAY = 0xA2, "Bad Gateway";
    SERVICE_UNAVAILABLE = 0xA3, "Service Unavailable";
    GATEWAY_TIMEOUT = 0xA4, "Gateway Timeout";
    PROXYING_NOT_SUPPORTED = 0xA5, "Proxying Not Supported";
}

impl Code {
    /// Construct from a class and detail pair
    pub fn new(class: u8, detail: u8) -> Self {
        Self(class << 5 | detail & 0x1F)
    }

    /// The 3-bit code class
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The 5-bit code detail
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Whether this is the Empty code 0.00
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this code is a request method
    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// Whether this code is a response
    pub fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    /// Whether this code is a success response
    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    /// Whether this code is a client or server error response
    pub fn is_error(self) -> bool {
        matches!(self.class(), 4 | 5)
    }

    /// The HTTP status this code maps to under the proxy translation
    pub fn http_status(self) -> u16 {
        u16::from(self.class() & 0x7) * 100 + u16::from(self.detail())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self, name),
            None => write!(f, "{}", self),
        }
    }
}

/// A 16-bit message ID, scoping reliability and duplicate detection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u16);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reasons a datagram failed to decode
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// The version bits were not 1
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    /// The token length field exceeded 8
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    /// An option used the reserved delta or length nibble 15
    #[error("reserved option nibble")]
    ReservedOptionNibble,
    /// Accumulated option deltas left the 16-bit number space
    #[error("option number out of range")]
    OptionNumberOverflow,
    /// A payload marker with no payload bytes after it
    #[error("stray payload marker")]
    StrayPayloadMarker,
    /// An Empty (0.00) message carried options or a payload
    #[error("empty message with content")]
    EmptyWithContent,
    /// A declared length ran past the end of the datagram
    #[error("unexpected end of datagram")]
    UnexpectedEnd,
}

impl From<UnexpectedEnd> for DecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// A decoded CoAP message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type
    pub ty: Type,
    /// Message code
    pub code: Code,
    /// Message ID; assigned by the client on send
    pub id: MessageId,
    /// Correlation token; assigned by the client on send
    pub token: Token,
    /// Options, insertion-ordered within a number
    options: Vec<CoapOption>,
    /// Payload bytes; empty means no payload on the wire
    pub payload: Bytes,
    /// Remote endpoint; stamped by the client, never on the wire
    pub remote: Option<EndpointAddr>,
    /// Receive time; stamped by the client, never on the wire
    pub timestamp: Option<Instant>,
}

impl Message {
    /// Construct a message with no options or payload
    pub fn new(ty: Type, code: Code) -> Self {
        Self {
            ty,
            code,
            id: MessageId(0),
            token: Token::EMPTY,
            options: Vec::new(),
            payload: Bytes::new(),
            remote: None,
            timestamp: None,
        }
    }

    /// Construct a confirmable request with the given method
    pub fn request(code: Code) -> Self {
        Self::new(Type::Con, code)
    }

    //
    // Wire codec
    //

    /// Serialize to the CoAP binary format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + self.token.len() + 8 * self.options.len() + self.payload.len() + 1,
        );
        buf.write(VERSION << 6 | (self.ty as u8) << 4 | self.token.len() as u8);
        buf.write(self.code.0);
        buf.write(self.id.0);
        buf.put_slice(&self.token);

        // Ascending option-number order; the sort is stable, so repeated
        // options keep their insertion order.
        let mut options = self.options.iter().collect::<Vec<_>>();
        options.sort_by_key(|opt| opt.number());
        let mut prev = 0u16;
        for opt in options {
            let value = opt.value();
            put_option_header(&mut buf, opt.number().0 - prev, value.len());
            buf.put_slice(&value);
            prev = opt.number().0;
        }

        if !self.payload.is_empty() {
            buf.put_u8(0xFF);
            buf.put_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Parse a datagram
    ///
    /// The `remote` and `timestamp` fields of the result are unset; the
    /// client stamps them during dispatch.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = io::Cursor::new(datagram);
        let first: u8 = buf.get()?;
        let version = first >> 6;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let ty = Type::from_bits(first >> 4);
        let token_len = first & 0x0F;
        if usize::from(token_len) > MAX_TOKEN_SIZE {
            return Err(DecodeError::InvalidTokenLength(token_len));
        }
        let code = Code(buf.get()?);
        let id = MessageId(buf.get()?);
        if buf.remaining() < usize::from(token_len) {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut token_bytes = [0; MAX_TOKEN_SIZE];
        buf.copy_to_slice(&mut token_bytes[..usize::from(token_len)]);
        let token = Token::new(&token_bytes[..usize::from(token_len)]);

        let mut options = Vec::new();
        let mut payload = Bytes::new();
        let mut number = 0u32;
        while buf.has_remaining() {
            let header = buf.get_u8();
            if header == 0xFF {
                if !buf.has_remaining() {
                    return Err(DecodeError::StrayPayloadMarker);
                }
                payload = Bytes::copy_from_slice(buf.chunk());
                break;
            }
            let delta = extended_field(header >> 4, &mut buf)?;
            let len = extended_field(header & 0x0F, &mut buf)? as usize;
            number += delta;
            if number > u32::from(u16::MAX) {
                return Err(DecodeError::OptionNumberOverflow);
            }
            if buf.remaining() < len {
                return Err(DecodeError::UnexpectedEnd);
            }
            let value = Bytes::copy_from_slice(&buf.chunk()[..len]);
            buf.advance(len);
            options.push(CoapOption::parse(OptionNumber(number as u16), value));
        }

        if code.is_empty() && (!options.is_empty() || !payload.is_empty()) {
            return Err(DecodeError::EmptyWithContent);
        }

        Ok(Self {
            ty,
            code,
            id,
            token,
            options,
            payload,
            remote: None,
            timestamp: None,
        })
    }

    //
    // Options
    //

    /// All options, in insertion order
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Append an option instance
    pub fn push_option(&mut self, option: CoapOption) {
        self.options.push(option);
    }

    /// Remove every instance of the given number
    pub fn remove_options(&mut self, number: OptionNumber) {
        self.options.retain(|opt| opt.number() != number);
    }

    /// Whether at least one instance of the given number is present
    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.options.iter().any(|opt| opt.number() == number)
    }

    fn set_single(&mut self, number: OptionNumber, option: Option<CoapOption>) {
        self.remove_options(number);
        if let Some(option) = option {
            self.options.push(option);
        }
    }

    /// The Observe value, if present
    pub fn observe(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Observe(v) => Some(*v),
            _ => None,
        })
    }

    /// Set or remove the Observe option
    ///
    /// `Some(0)` yields the empty-valued registration form.
    pub fn set_observe(&mut self, value: Option<u32>) {
        self.set_single(OptionNumber::OBSERVE, value.map(CoapOption::Observe));
    }

    /// The request-direction block descriptor, if present
    pub fn block1(&self) -> Option<BlockOption> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Block1(b) => Some(*b),
            _ => None,
        })
    }

    /// Set or remove the Block1 option
    pub fn set_block1(&mut self, block: Option<BlockOption>) {
        self.set_single(OptionNumber::BLOCK1, block.map(CoapOption::Block1));
    }

    /// The response-direction block descriptor, if present
    pub fn block2(&self) -> Option<BlockOption> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Block2(b) => Some(*b),
            _ => None,
        })
    }

    /// Set or remove the Block2 option
    pub fn set_block2(&mut self, block: Option<BlockOption>) {
        self.set_single(OptionNumber::BLOCK2, block.map(CoapOption::Block2));
    }

    /// The Uri-Host option, if present
    pub fn uri_host(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::UriHost(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// The Uri-Port option, if present
    pub fn uri_port(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::UriPort(p) => Some(*p),
            _ => None,
        })
    }

    /// The Content-Format option, if present
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::ContentFormat(v) => Some(ContentFormat(*v)),
            _ => None,
        })
    }

    /// Set or remove the Content-Format option
    pub fn set_content_format(&mut self, format: Option<ContentFormat>) {
        self.set_single(
            OptionNumber::CONTENT_FORMAT,
            format.map(|f| CoapOption::ContentFormat(f.0)),
        );
    }

    /// The Max-Age option in seconds, if present
    pub fn max_age(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::MaxAge(v) => Some(*v),
            _ => None,
        })
    }

    /// Set or remove the Max-Age option
    pub fn set_max_age(&mut self, seconds: Option<u32>) {
        self.set_single(OptionNumber::MAX_AGE, seconds.map(CoapOption::MaxAge));
    }

    /// The first ETag option, if present
    pub fn etag(&self) -> Option<&Bytes> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::ETag(v) => Some(v),
            _ => None,
        })
    }

    /// The Accept option, if present
    pub fn accept(&self) -> Option<ContentFormat> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Accept(v) => Some(ContentFormat(*v)),
            _ => None,
        })
    }

    /// Set or remove the Accept option
    pub fn set_accept(&mut self, format: Option<ContentFormat>) {
        self.set_single(OptionNumber::ACCEPT, format.map(|f| CoapOption::Accept(f.0)));
    }

    /// The Location-Path segments joined with `/`
    pub fn location_path(&self) -> String {
        let mut path = String::new();
        for opt in &self.options {
            if let CoapOption::LocationPath(segment) = opt {
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
            }
        }
        path
    }

    /// The Location-Query arguments in order
    pub fn location_query(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter_map(|opt| match opt {
                CoapOption::LocationQuery(q) => Some(q.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The Proxy-Uri option, if present
    pub fn proxy_uri(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::ProxyUri(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Set or remove the Size1 option
    pub fn set_size1(&mut self, size: Option<u32>) {
        self.set_single(OptionNumber::SIZE1, size.map(CoapOption::Size1));
    }

    /// Set or remove the Size2 option
    pub fn set_size2(&mut self, size: Option<u32>) {
        self.set_single(OptionNumber::SIZE2, size.map(CoapOption::Size2));
    }

    /// The Size1 option, if present
    pub fn size1(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Size1(v) => Some(*v),
            _ => None,
        })
    }

    /// The Size2 option, if present
    pub fn size2(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            CoapOption::Size2(v) => Some(*v),
            _ => None,
        })
    }

    /// The Uri-Path segments joined with `/`
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for opt in &self.options {
            if let CoapOption::UriPath(segment) = opt {
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
            }
        }
        path
    }

    /// Replace the Uri-Path options with the segments of `path`
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_options(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options.push(CoapOption::UriPath(segment.to_owned()));
        }
    }

    /// The Uri-Query arguments in order
    pub fn uri_queries(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter_map(|opt| match opt {
                CoapOption::UriQuery(q) => Some(q.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace the Uri-Query options with the `&`-separated arguments of `query`
    pub fn set_uri_query(&mut self, query: &str) {
        self.remove_options(OptionNumber::URI_QUERY);
        for arg in query.split('&').filter(|s| !s.is_empty()) {
            self.options.push(CoapOption::UriQuery(arg.to_owned()));
        }
    }

    //
    // URI composition
    //

    /// Synthesize the request URI from the remote endpoint and the
    /// Uri-Path/Uri-Query options
    ///
    /// Returns `None` until a remote endpoint has been set.
    pub fn uri(&self) -> Option<String> {
        let remote = self.remote?;
        let mut uri = format!("coap://{}", remote);
        let path = self.uri_path();
        if !path.is_empty() {
            uri.push('/');
            uri.push_str(&path);
        }
        let queries = self.uri_queries();
        if !queries.is_empty() {
            uri.push('?');
            uri.push_str(&queries.join("&"));
        }
        Some(uri)
    }

    /// Parse an absolute or relative CoAP URI into this message
    ///
    /// Absolute forms (`coap://authority/path?query`) set the remote
    /// endpoint; the authority must be an IP literal, since the core has no
    /// resolver. Relative forms only replace the path and query.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), InvalidUri> {
        let rest = if let Some((scheme, rest)) = uri.split_once("://") {
            if !scheme.eq_ignore_ascii_case("coap") {
                return Err(InvalidUri::UnsupportedScheme);
            }
            let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
            let authority = &rest[..authority_end];
            self.remote = Some(authority.parse().map_err(|_| InvalidUri::InvalidAuthority)?);
            &rest[authority_end..]
        } else {
            uri
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        self.set_uri_path(path);
        self.set_uri_query(query);
        Ok(())
    }

    //
    // Keys
    //

    pub(crate) fn transaction_key(&self) -> Option<TransactionKey> {
        self.remote.map(|remote| (remote, self.id))
    }

    pub(crate) fn exchange_key(&self) -> Option<ExchangeKey> {
        self.remote.map(|remote| (remote, self.token))
    }

    pub(crate) fn message_key(&self) -> Option<MessageKey> {
        self.remote.map(|remote| (remote, self.id, self.ty))
    }
}

/// Reasons a URI could not be applied to a message
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum InvalidUri {
    /// Only the `coap` scheme is supported
    #[error("unsupported URI scheme")]
    UnsupportedScheme,
    /// The authority was not an IP literal with an optional port
    #[error("invalid URI authority")]
    InvalidAuthority,
}

fn put_option_header(buf: &mut BytesMut, delta: u16, len: usize) {
    debug_assert!(len < 269 + 65536);
    let (delta_nibble, delta_ext) = nibble(u32::from(delta));
    let (len_nibble, len_ext) = nibble(len as u32);
    buf.put_u8(delta_nibble << 4 | len_nibble);
    put_extension(buf, delta_ext);
    put_extension(buf, len_ext);
}

/// Nibble value plus the extension bytes it calls for
enum Extension {
    None,
    Byte(u8),
    Word(u16),
}

fn nibble(value: u32) -> (u8, Extension) {
    if value < 13 {
        (value as u8, Extension::None)
    } else if value < 269 {
        (13, Extension::Byte((value - 13) as u8))
    } else {
        (14, Extension::Word((value - 269) as u16))
    }
}

fn put_extension(buf: &mut BytesMut, ext: Extension) {
    match ext {
        Extension::None => {}
        Extension::Byte(b) => buf.put_u8(b),
        Extension::Word(w) => buf.put_u16(w),
    }
}

fn extended_field(nibble: u8, buf: &mut io::Cursor<&[u8]>) -> Result<u32, DecodeError> {
    Ok(match nibble {
        n @ 0..=12 => u32::from(n),
        13 => 13 + u32::from(buf.get::<u8>()?),
        14 => 269 + u32::from(buf.get::<u16>()?),
        _ => return Err(DecodeError::ReservedOptionNibble),
    })
}
