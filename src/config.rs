//! Parameters governing the client state machine.

use std::time::Duration;

use thiserror::Error;

use crate::MAX_TOKEN_SIZE;

/// Parameters governing the core client state machine
///
/// Default values are the protocol's standard transmission parameters and
/// suit most deployments. Lowering `ack_timeout` or `max_retransmit` trades
/// robustness on lossy links for faster failure detection; `block_size`
/// bounds the largest datagram payload the client will produce or accept
/// during block-wise transfers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) ack_timeout: Duration,
    pub(crate) ack_random_factor: f64,
    pub(crate) max_retransmit: u32,
    pub(crate) exchange_timeout: Option<Duration>,
    pub(crate) duplicate_timeout: Option<Duration>,
    pub(crate) block_size: usize,
    pub(crate) max_token_size: usize,
    pub(crate) empty_token_safekeeping: Duration,
    pub(crate) rng_seed: Option<[u8; 32]>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            exchange_timeout: None,
            duplicate_timeout: None,
            block_size: 512,
            max_token_size: MAX_TOKEN_SIZE,
            empty_token_safekeeping: Duration::from_millis(48_000),
            rng_seed: None,
        }
    }
}

impl ClientConfig {
    /// Base timeout before the first retransmission of a confirmable message
    ///
    /// The actual initial timeout is drawn uniformly from
    /// `[ack_timeout, ack_timeout * ack_random_factor)` and doubles on each
    /// retransmission. Defaults to 2 seconds.
    pub fn ack_timeout(&mut self, value: Duration) -> &mut Self {
        self.ack_timeout = value;
        self
    }

    /// Spreading factor for the initial retransmission timeout
    ///
    /// Must be at least 1.0; exactly 1.0 removes the jitter entirely, which
    /// is useful for tests that assert exact retransmission times. Defaults
    /// to 1.5.
    pub fn ack_random_factor(&mut self, value: f64) -> &mut Self {
        self.ack_random_factor = value;
        self
    }

    /// Number of retransmissions before a confirmable message times out
    ///
    /// At most `max_retransmit + 1` copies of a message are ever sent.
    /// Defaults to 4.
    pub fn max_retransmit(&mut self, value: u32) -> &mut Self {
        self.max_retransmit = value;
        self
    }

    /// Time an exchange may sit without progress before it times out
    ///
    /// `None` derives the default
    /// `ack_timeout * 2^(max_retransmit + 1) * ack_random_factor`,
    /// roughly 96 seconds under the default parameters.
    pub fn exchange_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.exchange_timeout = value;
        self
    }

    /// Lifetime of entries in the duplicate-detection cache
    ///
    /// `None` derives half the exchange timeout.
    pub fn duplicate_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.duplicate_timeout = value;
        self
    }

    /// Preferred block size for block-wise transfers, in bytes
    ///
    /// Must be a power of two in [16, 1024]. Defaults to 512.
    pub fn block_size(&mut self, value: usize) -> &mut Self {
        self.block_size = value;
        self
    }

    /// Largest token the allocator will generate, in bytes
    ///
    /// Must be in [1, 8]. Defaults to 8.
    pub fn max_token_size(&mut self, value: usize) -> &mut Self {
        self.max_token_size = value;
        self
    }

    /// Quarantine applied to the empty token between release and re-use
    ///
    /// Defaults to 48 seconds.
    pub fn empty_token_safekeeping(&mut self, value: Duration) -> &mut Self {
        self.empty_token_safekeeping = value;
        self
    }

    /// Seed for the retransmission-jitter RNG
    ///
    /// Pinning the seed makes the whole state machine deterministic, which
    /// is useful for testing and debugging.
    pub fn rng_seed(&mut self, value: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = value;
        self
    }

    pub(crate) fn effective_exchange_timeout(&self) -> Duration {
        self.exchange_timeout.unwrap_or_else(|| {
            self.ack_timeout
                .mul_f64(f64::from(1u32 << (self.max_retransmit + 1)) * self.ack_random_factor)
        })
    }

    pub(crate) fn effective_duplicate_timeout(&self) -> Duration {
        self.duplicate_timeout
            .unwrap_or_else(|| self.effective_exchange_timeout() / 2)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::IllegalValue("ack_timeout must be nonzero"));
        }
        if !self.ack_random_factor.is_finite() || self.ack_random_factor < 1.0 {
            return Err(ConfigError::IllegalValue(
                "ack_random_factor must be at least 1.0",
            ));
        }
        if self.max_retransmit > 16 {
            return Err(ConfigError::IllegalValue("max_retransmit must be at most 16"));
        }
        if !self.block_size.is_power_of_two() || !(16..=1024).contains(&self.block_size) {
            return Err(ConfigError::IllegalValue(
                "block_size must be a power of two in [16, 1024]",
            ));
        }
        if !(1..=MAX_TOKEN_SIZE).contains(&self.max_token_size) {
            return Err(ConfigError::IllegalValue("max_token_size must be in [1, 8]"));
        }
        Ok(())
    }
}

/// Errors in the configuration of a client
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}

/// Per-request overrides of the client configuration
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Send the request as a confirmable message
    pub confirmable: bool,
    /// Block size for this exchange, overriding the client's
    ///
    /// Supplying a size implies `include_block2` for GET requests.
    pub block_size: Option<usize>,
    /// Attach a Block2 option to a GET so the server negotiates the
    /// response block size up front
    pub include_block2: bool,
    /// Exchange timeout for this exchange, overriding the client's
    pub exchange_timeout: Option<Duration>,
    /// Retransmission budget for this exchange, overriding the client's
    pub max_retransmit: Option<u32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            confirmable: true,
            block_size: None,
            include_block2: false,
            exchange_timeout: None,
            max_retransmit: None,
        }
    }
}
