//! Resolver pool
//!
//! [`Resolvers`] owns any number of [`QueryEngine`]s and spreads queries over
//! them at random. It also owns the pool-scoped wildcard state: the registry
//! of probed subdomains and the designated detection resolver, which is
//! either installed explicitly via
//! [`set_detection_resolver`](Resolvers::set_detection_resolver) or adopted
//! from the pool on first use.
//!
//! # Example
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
//! let wildcard = pool.wildcard_detected(&ctx, &resp, "example.com").await;
//! println!("wildcard: {wildcard}");
//!
//! pool.stop();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use hickory_proto::op::Message;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::ResolverConfig;
use crate::engine::QueryEngine;
use crate::error::{ResolveError, ResolveResult};
use crate::request::{Priority, Retry};
use crate::wildcard::WildcardRegistry;

/// A pool of per-resolver query engines with shared wildcard state
#[derive(Clone, Default)]
pub struct Resolvers {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    list: RwLock<Vec<QueryEngine>>,
    detector: Mutex<Option<QueryEngine>>,
    wildcards: WildcardRegistry,
}

impl Resolvers {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one engine per address, each pacing at `qps` queries per second
    ///
    /// # Errors
    ///
    /// Fails on the first address that cannot be turned into an engine;
    /// engines created before the failure stay in the pool.
    pub async fn add_resolvers(&self, qps: u32, addrs: &[&str]) -> ResolveResult<()> {
        for addr in addrs {
            let engine = QueryEngine::with_config(ResolverConfig::new(*addr, qps)).await?;
            self.inner.list.write().push(engine);
        }
        Ok(())
    }

    /// Pick a random pool member that has not been stopped
    #[must_use]
    pub fn random_resolver(&self) -> Option<QueryEngine> {
        let list = self.inner.list.read();
        let live: Vec<&QueryEngine> = list.iter().filter(|e| !e.stopped()).collect();
        if live.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..live.len());
        Some(live[pick].clone())
    }

    /// Number of engines in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.list.read().len()
    }

    /// Whether the pool has no engines
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.list.read().is_empty()
    }

    /// Resolve `msg` through a randomly chosen pool member
    ///
    /// # Errors
    ///
    /// `ResolveError::Resolver` when the pool is empty; otherwise whatever
    /// the chosen engine returns.
    pub async fn query(
        &self,
        ctx: &CancellationToken,
        msg: Message,
        priority: Priority,
        retry: Option<&Retry>,
    ) -> ResolveResult<Message> {
        let engine = self
            .random_resolver()
            .ok_or_else(|| ResolveError::resolver("no resolvers have been added to the pool"))?;
        engine.query(ctx, msg, priority, retry).await
    }

    /// Install `addr` as the resolver used for wildcard probes
    ///
    /// The resolver is added to the pool first, so probe traffic is paced
    /// like any other member's.
    ///
    /// # Errors
    ///
    /// Fails when the resolver cannot be added or found back in the pool.
    pub async fn set_detection_resolver(&self, qps: u32, addr: &str) -> ResolveResult<()> {
        self.add_resolvers(qps, &[addr]).await?;

        let canonical = ResolverConfig::new(addr, qps).socket_addr()?.to_string();
        let engine = self.find(&canonical).ok_or_else(|| {
            ResolveError::resolver("failed to add the wildcard detection resolver")
        })?;

        *self.inner.detector.lock() = Some(engine);
        Ok(())
    }

    /// The current detection resolver, adopting a random member on first use
    pub(crate) fn detection_resolver(&self) -> Option<QueryEngine> {
        let mut slot = self.inner.detector.lock();
        if slot.as_ref().is_some_and(QueryEngine::stopped) {
            *slot = None;
        }
        if slot.is_none() {
            *slot = self.random_resolver();
        }
        slot.clone()
    }

    /// Find a pool member by its canonical `ip:port` address
    fn find(&self, address: &str) -> Option<QueryEngine> {
        self.inner
            .list
            .read()
            .iter()
            .find(|e| e.address() == address)
            .cloned()
    }

    pub(crate) fn registry(&self) -> &WildcardRegistry {
        &self.inner.wildcards
    }

    /// Stop every engine in the pool
    ///
    /// Idempotent; every pending request on every member fails with a
    /// non-retryable `Stopped` error.
    pub fn stop(&self) {
        for engine in self.inner.list.read().iter() {
            engine.stop();
        }
    }
}

impl std::fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolvers")
            .field("resolvers", &self.len())
            .field("detector", &self.inner.detector.lock().is_some())
            .finish()
    }
}
