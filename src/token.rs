//! Tokens and their allocation.
//!
//! The token correlates responses (and every notification of an Observe
//! sequence) with the request that caused them, independently of the
//! message ID. The manager hands out a deterministic little-endian counter
//! sequence, skipping values still held by live exchanges, and quarantines
//! the empty token for a safekeeping window after release because an empty
//! token is indistinguishable from "no token" on the wire.

use std::fmt;
use std::ops::Deref;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

use crate::MAX_TOKEN_SIZE;

/// A 0-8 byte opaque request correlation token
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_SIZE],
}

impl Token {
    /// The zero-length token
    pub const EMPTY: Token = Token {
        len: 0,
        bytes: [0; MAX_TOKEN_SIZE],
    };

    /// Construct from raw bytes; at most 8
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_TOKEN_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_TOKEN_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether this is the zero-length token
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for Token {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Allocator for the client's tokens
///
/// Non-empty tokens follow a deterministic sequence: the single byte 0,
/// then successive values of a little-endian counter that grows one byte
/// at a time up to `max_size` and wraps back to the single byte 0.
pub struct TokenManager {
    max_size: usize,
    next: Token,
    acquired: FxHashSet<Token>,
    empty_in_use: bool,
    empty_released_at: Option<Instant>,
    safekeeping: Duration,
}

impl TokenManager {
    /// Create a manager handing out tokens of at most `max_size` bytes
    pub fn new(max_size: usize, safekeeping: Duration) -> Self {
        debug_assert!((1..=MAX_TOKEN_SIZE).contains(&max_size));
        Self {
            max_size,
            next: Token::new(&[0]),
            acquired: FxHashSet::default(),
            empty_in_use: false,
            empty_released_at: None,
            safekeeping,
        }
    }

    /// Acquire the next token not currently in use
    pub fn acquire(&mut self) -> Token {
        loop {
            let candidate = self.next;
            self.next = Self::successor(candidate, self.max_size);
            if self.acquired.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Acquire the empty token, if it is neither in use nor quarantined
    pub fn acquire_empty(&mut self, now: Instant) -> Option<Token> {
        if self.empty_in_use {
            return None;
        }
        if let Some(released) = self.empty_released_at {
            if now < released + self.safekeeping {
                return None;
            }
        }
        self.empty_in_use = true;
        Some(Token::EMPTY)
    }

    /// Return a token to the pool
    ///
    /// Releasing the empty token starts its safekeeping window.
    pub fn release(&mut self, token: Token, now: Instant) {
        if token.is_empty() {
            self.empty_in_use = false;
            self.empty_released_at = Some(now);
        } else {
            self.acquired.remove(&token);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.acquired.clear();
        self.empty_in_use = false;
    }

    fn successor(token: Token, max_size: usize) -> Token {
        let mut next = token;
        for i in 0..next.len() {
            next.bytes[i] = next.bytes[i].wrapping_add(1);
            if next.bytes[i] != 0 {
                return next;
            }
        }
        // Carried off the end of the counter
        if next.len() < max_size {
            next.bytes[next.len()] = 1;
            next.len += 1;
            next
        } else {
            Token::new(&[0])
        }
    }
}
