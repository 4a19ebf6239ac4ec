//! Error types for the resolver engine
//!
//! Every failure in the engine is expressed as a [`ResolveError`] and carries
//! a DNS-style response code, so callers can branch on `rcode()` uniformly
//! whether the failure came from the upstream server, the network, or the
//! engine itself. Errors are delivered through the same per-request result
//! sinks as successful responses; they never bypass a waiting caller.
//!
//! # Retryability
//!
//! Errors are classified as either retryable or terminal:
//! - **Retryable**: timeouts, write failures, TCP-fallback failures, and
//!   upstream response codes in [`RETRY_CODES`]
//! - **Terminal**: engine shutdown, configuration errors, id exhaustion,
//!   and upstream codes such as `NXDOMAIN`
//!
//! # Example
//!
//! ```
//! use recon_resolve::{ResolveError, TIMEOUT_RCODE};
//!
//! let err = ResolveError::timeout("query on resolver 8.8.8.8:53 timed out");
//! assert!(err.is_retryable());
//! assert_eq!(err.rcode(), TIMEOUT_RCODE);
//! ```

use std::io;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use hickory_proto::error::ProtoError;
use thiserror::Error;

/// Synthetic response code reported for timeouts.
///
/// Sits outside the IANA-assigned rcode range so it can never collide with a
/// code returned by an upstream server.
pub const TIMEOUT_RCODE: u16 = 50;

/// Synthetic response code reported for internal resolver failures.
pub const RESOLVER_ERR_RCODE: u16 = 51;

/// Upstream response codes that indicate a transient condition worth retrying.
pub const RETRY_CODES: [ResponseCode; 3] = [
    ResponseCode::ServFail,
    ResponseCode::NotImp,
    ResponseCode::Refused,
];

/// Error types for resolver operations
///
/// # Response codes
///
/// Every variant maps to a DNS-style code via [`rcode()`](Self::rcode):
/// upstream errors preserve the code the server returned, while engine-local
/// failures report [`TIMEOUT_RCODE`] or [`RESOLVER_ERR_RCODE`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A numeric priority value could not be mapped to a priority class
    #[error("invalid query priority: {value}")]
    InvalidPriority {
        /// The rejected numeric priority
        value: u8,
    },

    /// The engine has been stopped
    ///
    /// Returned for requests submitted after `stop()` and for requests still
    /// in flight when the engine shut down. Never retryable.
    #[error("resolver {resolver} has been stopped")]
    Stopped {
        /// Address of the stopped resolver
        resolver: String,
    },

    /// The request timed out
    ///
    /// Covers write-deadline expiry, exchange-table expiry, and caller-side
    /// cancellation. Always retryable.
    #[error("{context}")]
    Timeout {
        /// Description of what timed out
        context: String,
    },

    /// The upstream server answered with a non-success response code
    #[error("query on resolver {resolver} for {name} type {qtype} returned {rcode:?}")]
    UpstreamRcode {
        /// Address of the upstream resolver
        resolver: String,
        /// The question name
        name: String,
        /// The question type
        qtype: RecordType,
        /// The response code returned by the upstream
        rcode: ResponseCode,
    },

    /// The TCP exchange performed after a truncated UDP response failed
    #[error("failed to perform the exchange via TCP to {resolver}: {reason}")]
    TcpFallback {
        /// Address of the upstream resolver
        resolver: String,
        /// Description of the TCP failure
        reason: String,
    },

    /// Catch-all for socket and other internal resolver failures
    #[error("resolver error: {reason}")]
    Resolver {
        /// Description of the failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// No unused query identifier could be allocated
    #[error("no unused query id available for {name}")]
    IdExhausted {
        /// The question name that could not be keyed
        name: String,
    },

    /// Invalid resolver configuration
    #[error("invalid resolver configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// DNS message encoding or decoding failed
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl ResolveError {
    // ========================================================================
    // Constructor methods
    // ========================================================================

    /// Create an invalid-priority error
    pub fn invalid_priority(value: u8) -> Self {
        Self::InvalidPriority { value }
    }

    /// Create a stopped-engine error
    ///
    /// # Example
    ///
    /// ```
    /// use recon_resolve::ResolveError;
    ///
    /// let err = ResolveError::stopped("8.8.8.8:53");
    /// assert!(!err.is_retryable());
    /// assert!(err.to_string().contains("8.8.8.8:53"));
    /// ```
    pub fn stopped(resolver: impl Into<String>) -> Self {
        Self::Stopped {
            resolver: resolver.into(),
        }
    }

    /// Create a timeout error
    ///
    /// # Example
    ///
    /// ```
    /// use recon_resolve::ResolveError;
    ///
    /// let err = ResolveError::timeout("the request context was cancelled");
    /// assert!(err.is_timeout());
    /// ```
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Create an upstream response-code error
    pub fn upstream_rcode(
        resolver: impl Into<String>,
        name: impl Into<String>,
        qtype: RecordType,
        rcode: ResponseCode,
    ) -> Self {
        Self::UpstreamRcode {
            resolver: resolver.into(),
            name: name.into(),
            qtype,
            rcode,
        }
    }

    /// Create a TCP-fallback error
    pub fn tcp_fallback(resolver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TcpFallback {
            resolver: resolver.into(),
            reason: reason.into(),
        }
    }

    /// Create a resolver error
    pub fn resolver(reason: impl Into<String>) -> Self {
        Self::Resolver {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a resolver error from an I/O error
    pub fn resolver_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Resolver {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create an id-exhaustion error
    pub fn id_exhausted(name: impl Into<String>) -> Self {
        Self::IdExhausted { name: name.into() }
    }

    /// Create a configuration error
    ///
    /// # Example
    ///
    /// ```
    /// use recon_resolve::ResolveError;
    ///
    /// let err = ResolveError::config("queries per second must be positive");
    /// assert!(!err.is_retryable());
    /// ```
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    // ========================================================================
    // Classification methods
    // ========================================================================

    /// Check whether another attempt at the same query may succeed
    ///
    /// Timeouts, TCP-fallback failures, internal resolver errors, and
    /// upstream codes in [`RETRY_CODES`] are retryable. Shutdown, id
    /// exhaustion, configuration errors, and terminal upstream codes such as
    /// `NXDOMAIN` are not.
    ///
    /// # Example
    ///
    /// ```
    /// use hickory_proto::op::ResponseCode;
    /// use hickory_proto::rr::RecordType;
    /// use recon_resolve::ResolveError;
    ///
    /// let servfail = ResolveError::upstream_rcode(
    ///     "8.8.8.8:53", "example.com", RecordType::A, ResponseCode::ServFail,
    /// );
    /// assert!(servfail.is_retryable());
    ///
    /// let nxdomain = ResolveError::upstream_rcode(
    ///     "8.8.8.8:53", "example.com", RecordType::A, ResponseCode::NXDomain,
    /// );
    /// assert!(!nxdomain.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::TcpFallback { .. } | Self::Resolver { .. } => true,
            Self::UpstreamRcode { rcode, .. } => RETRY_CODES.contains(rcode),
            Self::InvalidPriority { .. }
            | Self::Stopped { .. }
            | Self::IdExhausted { .. }
            | Self::Config { .. }
            | Self::Proto(_) => false,
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error indicates engine shutdown
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// Check if this error carries an upstream response code
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamRcode { .. })
    }

    /// Get the DNS-style response code for this error
    ///
    /// Upstream errors preserve the server's code; timeouts report
    /// [`TIMEOUT_RCODE`] and everything else [`RESOLVER_ERR_RCODE`].
    #[must_use]
    pub fn rcode(&self) -> u16 {
        match self {
            Self::Timeout { .. } => TIMEOUT_RCODE,
            Self::UpstreamRcode { rcode, .. } => u16::from(*rcode),
            Self::InvalidPriority { .. }
            | Self::Stopped { .. }
            | Self::TcpFallback { .. }
            | Self::Resolver { .. }
            | Self::IdExhausted { .. }
            | Self::Config { .. }
            | Self::Proto(_) => RESOLVER_ERR_RCODE,
        }
    }
}

impl From<io::Error> for ResolveError {
    fn from(err: io::Error) -> Self {
        Self::Resolver {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`ResolveError`]
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;
