//! Resolver configuration types
//!
//! [`ResolverConfig`] describes a single upstream recursive resolver and the
//! timing knobs of the engine attached to it. Every field beyond the address
//! and query rate has a serde default matching the engine's design defaults,
//! so a minimal JSON document like `{"address": "8.8.8.8", "qps": 100}` is a
//! complete configuration.
//!
//! # Example
//!
//! ```
//! use recon_resolve::ResolverConfig;
//!
//! let config = ResolverConfig::new("8.8.8.8", 100);
//! assert!(config.validate().is_ok());
//!
//! // Addresses without a port default to :53
//! assert_eq!(config.socket_addr().unwrap().port(), 53);
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, ResolveResult};

/// Default DNS port applied when the configured address omits one.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Configuration for one upstream resolver and its query engine
///
/// # Example
///
/// ```
/// use recon_resolve::ResolverConfig;
///
/// let config = ResolverConfig::new("1.1.1.1:53", 50)
///     .with_exchange_timeout_ms(3000)
///     .with_min_sample_set_size(10);
///
/// assert_eq!(config.exchange_timeout().as_secs(), 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upstream resolver address, `ip` or `ip:port`
    pub address: String,

    /// Initially configured queries per second
    ///
    /// Must be positive. The adaptive limiter may raise the effective rate
    /// from latency samples but reverts to this value when samples indicate
    /// the upstream cannot keep up.
    pub qps: u32,

    /// How long an entry may sit in the exchange table after its message is
    /// on the wire before it is swept as timed out, in milliseconds
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,

    /// Interval of the timeout sweeper, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Deadline for writing a query to the UDP socket, in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Overall deadline for the TCP exchange performed after truncation,
    /// in seconds
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,

    /// How long the dispatch queue may stay empty before the current
    /// sampling burst is considered finished, in milliseconds
    #[serde(default = "default_max_sample_delay_ms")]
    pub max_sample_delay_ms: u64,

    /// Minimum time between two adaptive rate updates, in milliseconds
    #[serde(default = "default_min_sampling_ms")]
    pub min_sampling_ms: u64,

    /// Minimum number of latency samples required before recomputing the rate
    #[serde(default = "default_min_sample_set_size")]
    pub min_sample_set_size: usize,
}

fn default_exchange_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_write_timeout_ms() -> u64 {
    2000
}

fn default_tcp_timeout_secs() -> u64 {
    60
}

fn default_max_sample_delay_ms() -> u64 {
    250
}

fn default_min_sampling_ms() -> u64 {
    5000
}

fn default_min_sample_set_size() -> usize {
    5
}

impl ResolverConfig {
    /// Create a configuration with design-default timing values
    #[must_use]
    pub fn new(address: impl Into<String>, qps: u32) -> Self {
        Self {
            address: address.into(),
            qps,
            exchange_timeout_ms: default_exchange_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
            max_sample_delay_ms: default_max_sample_delay_ms(),
            min_sampling_ms: default_min_sampling_ms(),
            min_sample_set_size: default_min_sample_set_size(),
        }
    }

    /// Set the exchange-table expiry threshold in milliseconds
    #[must_use]
    pub fn with_exchange_timeout_ms(mut self, ms: u64) -> Self {
        self.exchange_timeout_ms = ms;
        self
    }

    /// Set the timeout-sweep interval in milliseconds
    #[must_use]
    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    /// Set the UDP write deadline in milliseconds
    #[must_use]
    pub fn with_write_timeout_ms(mut self, ms: u64) -> Self {
        self.write_timeout_ms = ms;
        self
    }

    /// Set the TCP fallback deadline in seconds
    #[must_use]
    pub fn with_tcp_timeout_secs(mut self, secs: u64) -> Self {
        self.tcp_timeout_secs = secs;
        self
    }

    /// Set the minimum latency sample count for rate recomputation
    #[must_use]
    pub fn with_min_sample_set_size(mut self, size: usize) -> Self {
        self.min_sample_set_size = size;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` when the query rate is zero, the
    /// address is empty or unparseable, or a timing field is zero.
    pub fn validate(&self) -> ResolveResult<()> {
        if self.qps == 0 {
            return Err(ResolveError::config_field(
                "queries per second must be positive",
                "qps",
            ));
        }
        if self.address.is_empty() {
            return Err(ResolveError::config_field(
                "resolver address must not be empty",
                "address",
            ));
        }
        self.socket_addr()?;
        if self.exchange_timeout_ms == 0 {
            return Err(ResolveError::config_field(
                "exchange timeout must be positive",
                "exchange_timeout_ms",
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ResolveError::config_field(
                "sweep interval must be positive",
                "sweep_interval_ms",
            ));
        }
        Ok(())
    }

    /// Resolve the configured address to a socket address
    ///
    /// A bare IP address gets the default DNS port appended.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` when the address is neither an
    /// `ip:port` pair nor a bare IP address.
    pub fn socket_addr(&self) -> ResolveResult<SocketAddr> {
        if let Ok(addr) = self.address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
        }
        Err(ResolveError::config_field(
            format!("invalid resolver address '{}'", self.address),
            "address",
        ))
    }

    /// Exchange-table expiry threshold as a [`Duration`]
    #[must_use]
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Timeout-sweep interval as a [`Duration`]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// UDP write deadline as a [`Duration`]
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// TCP fallback deadline as a [`Duration`]
    #[must_use]
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }

    /// Maximum delay between samples within one burst as a [`Duration`]
    #[must_use]
    pub fn max_sample_delay(&self) -> Duration {
        Duration::from_millis(self.max_sample_delay_ms)
    }

    /// Minimum time between rate updates as a [`Duration`]
    #[must_use]
    pub fn min_sampling(&self) -> Duration {
        Duration::from_millis(self.min_sampling_ms)
    }
}
