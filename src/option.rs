//! CoAP options: the number registry, typed values, and block descriptors.
//!
//! Options travel on the wire as a delta-encoded TLV list (see
//! `message.rs` for the framing); this module owns what the values *mean*.
//! Known numbers decode into typed variants of [`CoapOption`]; unknown
//! numbers are preserved as opaque bytes and re-serialized identically, so
//! that cache-key comparisons by intermediaries remain stable.

use std::fmt;

use bytes::Bytes;

/// Default Max-Age when the option is absent, in seconds
pub const DEFAULT_MAX_AGE: u32 = 60;

/// A CoAP option number
///
/// The low bits of the number classify the option: odd numbers are critical
/// (an endpoint that does not understand one must reject the message),
/// bit 1 marks options unsafe to forward, and the 0b11100 pattern in bits
/// 1-5 marks options excluded from cache keys.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// Whether an endpoint must understand this option to process the message
    pub fn is_critical(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Whether a proxy must not forward this option unprocessed
    pub fn is_unsafe(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// Whether this option is excluded from cache keys
    pub fn is_no_cache_key(self) -> bool {
        self.0 & 0x1e == 0x1c
    }
}

/// Value format of a registered option
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionFormat {
    /// Zero-length value
    Empty,
    /// Big-endian unsigned integer, minimum width
    Uint,
    /// UTF-8 string
    String,
    /// Raw bytes
    Opaque,
}

macro_rules! option_numbers {
    {$($name:ident = $val:expr, $fmt:ident, $str:expr;)*} => {
        impl OptionNumber {
            $(
                #[doc = $str]
                pub const $name: OptionNumber = OptionNumber($val);
            )*

            /// The registered name of this option, if known
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some($str),)*
                    _ => None,
                }
            }

            /// Look up a registered option number by name, case-insensitively
            ///
            /// This is the lookup the HTTP proxy collaborator uses to map
            /// `CoAP-*` headers onto options.
            pub fn from_name(name: &str) -> Option<Self> {
                $(if name.eq_ignore_ascii_case($str) {
                    return Some(Self($val));
                })*
                None
            }

            /// The value format of this option's registered definition
            ///
            /// Unknown numbers are treated as opaque.
            pub fn format(self) -> OptionFormat {
                match self.0 {
                    $($val => OptionFormat::$fmt,)*
                    _ => OptionFormat::Opaque,
                }
            }
        }

        impl fmt::Debug for OptionNumber {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($str),)*
                    x => write!(f, "Option({})", x),
                }
            }
        }
    }
}

option_numbers! {
    IF_MATCH = 1, Opaque, "If-Match";
    URI_HOST = 3, String, "Uri-Host";
    ETAG = 4, Opaque, "ETag";
    IF_NONE_MATCH = 5, Empty, "If-None-Match";
    OBSERVE = 6, Uint, "Observe";
    URI_PORT = 7, Uint, "Uri-Port";
    LOCATION_PATH = 8, String, "Location-Path";
    URI_PATH = 11, String, "Uri-Path";
    CONTENT_FORMAT = 12, Uint, "Content-Format";
    MAX_AGE = 14, Uint, "Max-Age";
    URI_QUERY = 15, String, "Uri-Query";
    ACCEPT = 16, Uint, "Accept";
    LOCATION_QUERY = 20, String, "Location-Query";
    BLOCK2 = 23, Uint, "Block2";
    BLOCK1 = 27, Uint, "Block1";
    SIZE2 = 28, Uint, "Size2";
    PROXY_URI = 35, String, "Proxy-Uri";
    PROXY_SCHEME = 39, String, "Proxy-Scheme";
    SIZE1 = 60, Uint, "Size1";
}

impl fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Encode an unsigned option value in the minimum number of bytes
///
/// Zero encodes as the empty value. Values above 2^32-1 cannot occur in a
/// conforming message; they are carried in the 8-byte IEEE-754 double
/// representation as a compatibility escape.
pub fn encode_uint(value: u64) -> Bytes {
    if value == 0 {
        return Bytes::new();
    }
    if value <= u64::from(u32::MAX) {
        let raw = value.to_be_bytes();
        let skip = raw.iter().position(|&b| b != 0).unwrap_or(7);
        Bytes::copy_from_slice(&raw[skip..])
    } else {
        Bytes::copy_from_slice(&(value as f64).to_be_bytes())
    }
}

/// Decode an unsigned option value
///
/// The empty value means zero. Values of one to four bytes are plain
/// big-endian integers; an 8-byte value is first tried as the IEEE-754
/// double escape of `encode_uint`.
pub fn decode_uint(value: &[u8]) -> u64 {
    if value.len() > 8 {
        return u64::MAX;
    }
    let mut raw = 0u64;
    for &b in value {
        raw = raw << 8 | u64::from(b);
    }
    if value.len() == 8 {
        let float = f64::from_bits(raw);
        if float.is_finite() && float >= 0.0 && float <= u64::MAX as f64 && float.fract() == 0.0 {
            return float as u64;
        }
    }
    raw
}

/// Block transfer descriptor carried by the Block1 and Block2 options
///
/// The wire form is the minimum-width big-endian encoding of
/// `(num << 4) | (m << 3) | szx`, where the block size is `2^(szx + 4)`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BlockOption {
    /// Block number within the transfer
    pub num: u32,
    /// Whether more blocks follow this one
    pub m: bool,
    /// Size exponent
    pub szx: u8,
}

impl BlockOption {
    /// Construct from an explicit size exponent
    pub fn new(num: u32, m: bool, szx: u8) -> Self {
        debug_assert!(szx <= 6);
        Self { num, m, szx }
    }

    /// Construct from a block size in bytes
    ///
    /// Sizes are converted to the exponent form and clamped to the legal
    /// [16, 1024] range.
    pub fn from_size(num: u32, m: bool, size: usize) -> Self {
        Self {
            num,
            m,
            szx: szx_for_size(size),
        }
    }

    /// The block size in bytes, clamped to [16, 1024]
    pub fn size(&self) -> usize {
        1 << (self.szx.min(6) + 4)
    }

    /// The byte offset of this block within the full body
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    pub(crate) fn to_raw(self) -> u32 {
        self.num << 4 | u32::from(self.m) << 3 | u32::from(self.szx & 0x7)
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self {
            num: raw >> 4,
            m: raw & 0x08 != 0,
            szx: (raw & 0x07) as u8,
        }
    }
}

impl fmt::Debug for BlockOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.num,
            if self.m { 1 } else { 0 },
            self.size()
        )
    }
}

/// The size exponent for a block size in bytes: `log2(size) - 4`, clamped
/// to the legal [0, 6] range
pub(crate) fn szx_for_size(size: usize) -> u8 {
    let size = size.clamp(16, 1024);
    (size.ilog2() - 4) as u8
}

/// A single option instance
///
/// Registered numbers parse into typed variants; anything else (including
/// registered numbers whose value fails validation) is retained opaquely.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CoapOption {
    /// 1: request is conditional on an entity-tag match
    IfMatch(Bytes),
    /// 3: host component of the request URI
    UriHost(String),
    /// 4: entity tag of the representation
    ETag(Bytes),
    /// 5: request is conditional on the resource not existing
    IfNoneMatch,
    /// 6: observe registration (requests) or notification sequence (responses)
    Observe(u32),
    /// 7: port component of the request URI
    UriPort(u16),
    /// 8: one segment of the Location path
    LocationPath(String),
    /// 11: one segment of the request path
    UriPath(String),
    /// 12: media type of the payload
    ContentFormat(u16),
    /// 14: freshness horizon in seconds
    MaxAge(u32),
    /// 15: one argument of the request query
    UriQuery(String),
    /// 16: acceptable media type for the response
    Accept(u16),
    /// 20: one argument of the Location query
    LocationQuery(String),
    /// 23: response-direction block descriptor
    Block2(BlockOption),
    /// 27: request-direction block descriptor
    Block1(BlockOption),
    /// 28: total size of the response-direction body
    Size2(u32),
    /// 35: absolute URI for forward proxying
    ProxyUri(String),
    /// 39: scheme for forward proxying
    ProxyScheme(String),
    /// 60: total size of the request-direction body
    Size1(u32),
    /// Any number without a registered definition
    Opaque {
        /// The unrecognized option number
        number: OptionNumber,
        /// The raw value bytes
        value: Bytes,
    },
}

impl CoapOption {
    /// The option number this instance serializes under
    pub fn number(&self) -> OptionNumber {
        use CoapOption::*;
        match self {
            IfMatch(_) => OptionNumber::IF_MATCH,
            UriHost(_) => OptionNumber::URI_HOST,
            ETag(_) => OptionNumber::ETAG,
            IfNoneMatch => OptionNumber::IF_NONE_MATCH,
            Observe(_) => OptionNumber::OBSERVE,
            UriPort(_) => OptionNumber::URI_PORT,
            LocationPath(_) => OptionNumber::LOCATION_PATH,
            UriPath(_) => OptionNumber::URI_PATH,
            ContentFormat(_) => OptionNumber::CONTENT_FORMAT,
            MaxAge(_) => OptionNumber::MAX_AGE,
            UriQuery(_) => OptionNumber::URI_QUERY,
            Accept(_) => OptionNumber::ACCEPT,
            LocationQuery(_) => OptionNumber::LOCATION_QUERY,
            Block2(_) => OptionNumber::BLOCK2,
            Block1(_) => OptionNumber::BLOCK1,
            Size2(_) => OptionNumber::SIZE2,
            ProxyUri(_) => OptionNumber::PROXY_URI,
            ProxyScheme(_) => OptionNumber::PROXY_SCHEME,
            Size1(_) => OptionNumber::SIZE1,
            Opaque { number, .. } => *number,
        }
    }

    /// Parse a raw option value into its typed form
    ///
    /// Lenient by design: a registered option whose value does not fit its
    /// definition (bad UTF-8, out-of-range integer) is retained opaquely
    /// rather than rejected, matching how unknown elective options are
    /// handled.
    pub fn parse(number: OptionNumber, value: Bytes) -> Self {
        use CoapOption::*;
        match number {
            OptionNumber::IF_MATCH => IfMatch(value),
            OptionNumber::URI_HOST => string_option(number, value, UriHost),
            OptionNumber::ETAG => ETag(value),
            OptionNumber::IF_NONE_MATCH if value.is_empty() => IfNoneMatch,
            OptionNumber::OBSERVE => uint_option(number, value, Observe),
            OptionNumber::URI_PORT => uint_option(number, value, UriPort),
            OptionNumber::LOCATION_PATH => string_option(number, value, LocationPath),
            OptionNumber::URI_PATH => string_option(number, value, UriPath),
            OptionNumber::CONTENT_FORMAT => uint_option(number, value, ContentFormat),
            OptionNumber::MAX_AGE => uint_option(number, value, MaxAge),
            OptionNumber::URI_QUERY => string_option(number, value, UriQuery),
            OptionNumber::ACCEPT => uint_option(number, value, Accept),
            OptionNumber::LOCATION_QUERY => string_option(number, value, LocationQuery),
            OptionNumber::BLOCK2 => {
                uint_option(number, value, |raw| Block2(BlockOption::from_raw(raw)))
            }
            OptionNumber::BLOCK1 => {
                uint_option(number, value, |raw| Block1(BlockOption::from_raw(raw)))
            }
            OptionNumber::SIZE2 => uint_option(number, value, Size2),
            OptionNumber::PROXY_URI => string_option(number, value, ProxyUri),
            OptionNumber::PROXY_SCHEME => string_option(number, value, ProxyScheme),
            OptionNumber::SIZE1 => uint_option(number, value, Size1),
            _ => Opaque { number, value },
        }
    }

    /// The serialized value bytes of this option
    pub fn value(&self) -> Bytes {
        use CoapOption::*;
        match self {
            IfMatch(b) | ETag(b) => b.clone(),
            Opaque { value, .. } => value.clone(),
            IfNoneMatch => Bytes::new(),
            UriHost(s) | LocationPath(s) | UriPath(s) | UriQuery(s) | LocationQuery(s)
            | ProxyUri(s) | ProxyScheme(s) => Bytes::copy_from_slice(s.as_bytes()),
            Observe(v) | MaxAge(v) | Size2(v) | Size1(v) => encode_uint(u64::from(*v)),
            UriPort(v) | ContentFormat(v) | Accept(v) => encode_uint(u64::from(*v)),
            Block2(b) | Block1(b) => encode_uint(u64::from(b.to_raw())),
        }
    }
}

fn string_option(
    number: OptionNumber,
    value: Bytes,
    make: impl FnOnce(String) -> CoapOption,
) -> CoapOption {
    match std::str::from_utf8(&value) {
        Ok(s) => make(s.to_owned()),
        Err(_) => CoapOption::Opaque { number, value },
    }
}

fn uint_option<T: TryFrom<u64>>(
    number: OptionNumber,
    value: Bytes,
    make: impl FnOnce(T) -> CoapOption,
) -> CoapOption {
    match T::try_from(decode_uint(&value)) {
        Ok(v) => make(v),
        Err(_) => CoapOption::Opaque { number, value },
    }
}

/// A registered content-format identifier
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContentFormat(pub u16);

macro_rules! content_formats {
    {$($name:ident = $val:expr, $str:expr;)*} => {
        impl ContentFormat {
            $(
                #[doc = $str]
                pub const $name: ContentFormat = ContentFormat($val);
            )*

            /// The registered media type, if known
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some($str),)*
                    _ => None,
                }
            }
        }
    }
}

content_formats! {
    TEXT_PLAIN = 0, "text/plain;charset=utf-8";
    LINK_FORMAT = 40, "application/link-format";
    XML = 41, "application/xml";
    OCTET_STREAM = 42, "application/octet-stream";
    EXI = 47, "application/exi";
    JSON = 50, "application/json";
    CBOR = 60, "application/cbor";
}

impl fmt::Debug for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ContentFormat({})", self.0),
        }
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
