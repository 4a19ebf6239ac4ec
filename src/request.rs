//! Request and priority types for the query engine
//!
//! A caller submits a DNS message together with a [`Priority`] class and an
//! optional [`Retry`] predicate. Internally each attempt becomes a
//! [`ResolveRequest`] owning a single-shot result sink; the engine fulfils
//! every sink exactly once, with either the response message or a
//! [`ResolveError`](crate::ResolveError).

use std::fmt;
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::sync::oneshot;

use crate::error::{ResolveError, ResolveResult};

/// Priority classes for query dispatch
///
/// Dispatch order is strict between classes and FIFO within a class.
///
/// # Example
///
/// ```
/// use recon_resolve::Priority;
///
/// assert!(Priority::Critical < Priority::Low);
/// assert_eq!(Priority::try_from(2).unwrap(), Priority::Normal);
/// assert!(Priority::try_from(7).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Dispatched before everything else; used for wildcard probes
    Critical,
    /// Dispatched before normal traffic
    High,
    /// Default class for enumeration traffic
    Normal,
    /// Background traffic
    Low,
}

/// Number of priority classes.
pub(crate) const PRIORITY_LEVELS: usize = 4;

impl Priority {
    /// Index of this class in dispatch order, `Critical` first
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = ResolveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Critical),
            1 => Ok(Self::High),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Low),
            other => Err(ResolveError::invalid_priority(other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(label)
    }
}

/// Caller-supplied retry predicate
///
/// Invoked after each failed attempt with the attempt count, the request's
/// priority, and the error from the last attempt; returning `true` requests
/// another attempt. The error carries the upstream response code via
/// [`rcode()`](crate::ResolveError::rcode), so policies can branch on the
/// code uniformly.
///
/// # Example
///
/// ```
/// use recon_resolve::{Priority, ResolveError};
///
/// let max_three = |attempts: usize, _: Priority, err: &ResolveError| {
///     attempts < 3 && err.is_retryable()
/// };
/// let err = ResolveError::timeout("timed out");
/// assert!(max_three(1, Priority::Normal, &err));
/// assert!(!max_three(3, Priority::Normal, &err));
/// ```
pub type Retry = dyn Fn(usize, Priority, &ResolveError) -> bool + Send + Sync;

/// One in-flight exchange with the upstream resolver
///
/// Owned by the exchange table between enqueue and completion. The result
/// sink is consumed by [`complete`](Self::complete), which makes double
/// delivery unrepresentable.
pub(crate) struct ResolveRequest {
    /// Query identifier; rewritten by the exchange table on collision
    pub id: u16,
    /// Canonical question name: lowercase, no trailing dot
    pub name: String,
    /// Question type
    pub qtype: RecordType,
    /// The query message, kept for the TCP fallback exchange
    pub msg: Message,
    /// Single-shot result sink
    tx: oneshot::Sender<ResolveResult<Message>>,
    /// When the request was created
    pub created_at: Instant,
    /// When the message was written to the socket; `None` until then
    pub sent_at: Option<Instant>,
}

impl ResolveRequest {
    pub fn new(
        msg: Message,
        name: String,
        qtype: RecordType,
        tx: oneshot::Sender<ResolveResult<Message>>,
    ) -> Self {
        Self {
            id: msg.id(),
            name,
            qtype,
            msg,
            tx,
            created_at: Instant::now(),
            sent_at: None,
        }
    }

    /// Deliver the result to the waiting caller
    ///
    /// A send error means the caller went away (cancelled or dropped); the
    /// result is discarded in that case.
    pub fn complete(self, result: ResolveResult<Message>) {
        let _ = self.tx.send(result);
    }
}

impl fmt::Debug for ResolveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("qtype", &self.qtype)
            .field("sent_at", &self.sent_at)
            .finish_non_exhaustive()
    }
}

/// A query waiting in the dispatch queue, already encoded for the wire
#[derive(Debug)]
pub(crate) struct QueuedQuery {
    pub id: u16,
    pub name: String,
    pub bytes: Vec<u8>,
}
