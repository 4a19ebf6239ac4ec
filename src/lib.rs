//! recon-resolve: concurrent, rate-adaptive DNS resolution for enumeration
//!
//! This crate issues large volumes of DNS queries across upstream recursive
//! resolvers while enforcing per-resolver query rates, tuning those rates
//! from observed response latency, recovering from timeouts and truncation,
//! and telling genuine subdomain answers apart from DNS wildcard synthesis.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Resolvers (pool)                     │
//! │                                                              │
//! │  ┌─────────────┐  ┌─────────────┐       ┌────────────────┐   │
//! │  │ QueryEngine │  │ QueryEngine │  ...  │ QueryEngine    │   │
//! │  │ (1 upstream)│  │ (1 upstream)│       │ (detection)    │   │
//! │  └─────────────┘  └─────────────┘       └───────┬────────┘   │
//! │                                                 │ probes     │
//! │  ┌──────────────────────────────────────────────▼────────┐   │
//! │  │ Wildcard registry: suffix → memoised verdict + answers │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each [`QueryEngine`] owns one UDP connection and four cooperating loops
//! (dispatch, receive, timeout sweep, read handling); see the [`engine`]
//! module docs. Queries carry a [`Priority`] and an optional retry policy.
//! Outbound pacing adapts to the upstream's observed service rate.
//!
//! # Quick start
//!
//! ```no_run
//! use hickory_proto::rr::RecordType;
//! use recon_resolve::{Priority, Resolvers, query_msg};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Resolvers::new();
//! pool.add_resolvers(100, &["8.8.8.8", "1.1.1.1"]).await?;
//!
//! let ctx = CancellationToken::new();
//! let msg = query_msg("www.example.com", RecordType::A)?;
//! let resp = pool.query(&ctx, msg, Priority::Normal, None).await?;
//!
//! if !pool.wildcard_detected(&ctx, &resp, "example.com").await {
//!     for answer in recon_resolve::extract_answers(&resp) {
//!         println!("{} {} {}", answer.name, answer.rtype, answer.data);
//!     }
//! }
//!
//! pool.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: the per-resolver query engine
//! - [`pool`]: the resolver pool and detection-resolver plumbing
//! - [`wildcard`]: wildcard probing, memoisation, and matching
//! - [`answers`]: message builders and answer extraction
//! - [`config`]: resolver configuration
//! - [`error`]: error types and response-code mapping
//! - [`request`]: priorities and retry policies

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod answers;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod request;
pub mod wildcard;

mod limiter;
mod queue;
mod xchg;

// Re-export commonly used types at the crate root
pub use answers::{extract_answers, normalize_name, query_msg, remove_last_dot, ExtractedAnswer};
pub use config::{ResolverConfig, DEFAULT_DNS_PORT};
pub use engine::QueryEngine;
pub use error::{
    ResolveError, ResolveResult, RESOLVER_ERR_RCODE, RETRY_CODES, TIMEOUT_RCODE,
};
pub use pool::Resolvers;
pub use request::{Priority, Retry};
pub use wildcard::{
    unlikely_name, unlikely_name_with, LDH_CHARS, MAX_DNS_LABEL_LEN, MAX_DNS_NAME_LEN,
    MAX_LABEL_LEN, MIN_LABEL_LEN,
};
