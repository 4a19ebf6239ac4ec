//! Adaptive send-rate limiting
//!
//! Outbound queries pass through a token-per-interval gate built on a
//! governor direct limiter with a burst of one, reproducing slack-free
//! pacing. The limiter lives behind an `ArcSwap`, so the receive loop can
//! install a recomputed rate without ever blocking the dispatch loop's
//! token takes.
//!
//! The rate is recomputed from response-arrival timestamps collected during
//! send bursts: the mean inter-arrival gap approximates the upstream's
//! service rate, and driving slightly above it keeps the pipeline full
//! without overrunning the server. See [`compute_rate`] for the exact rule.
//!
//! Burst boundaries are tracked in [`LatencySampler`], a piece of shared
//! state mutated directly by the dispatch loop. The original design
//! delivered begin/end signals over a channel polled non-blockingly from the
//! read path, which could drop boundary signals under saturation; direct
//! mutation cannot.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use std::sync::Arc;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn direct_limiter(per_sec: u32) -> DirectLimiter {
    let per_sec = NonZeroU32::new(per_sec.max(1)).expect("rate must be at least 1");
    RateLimiter::direct(Quota::per_second(per_sec).allow_burst(NonZeroU32::MIN))
}

/// Hot-swappable token gate for outbound queries
pub(crate) struct SendRateLimiter {
    limiter: ArcSwap<DirectLimiter>,
    configured: u32,
    current: AtomicU32,
}

impl SendRateLimiter {
    pub fn new(per_sec: u32) -> Self {
        Self {
            limiter: ArcSwap::from_pointee(direct_limiter(per_sec)),
            configured: per_sec,
            current: AtomicU32::new(per_sec),
        }
    }

    /// Wait for the next send token from the current limiter
    pub async fn take(&self) {
        let limiter = self.limiter.load_full();
        limiter.until_ready().await;
    }

    /// Replace the limiter with one pacing at `per_sec` queries per second
    pub fn set_rate(&self, per_sec: u32) {
        self.limiter.store(Arc::new(direct_limiter(per_sec)));
        self.current.store(per_sec, Ordering::Relaxed);
    }

    /// The rate the limiter was constructed with
    pub fn configured_rate(&self) -> u32 {
        self.configured
    }

    /// The rate currently in effect
    pub fn current_rate(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
}

/// Collects response-arrival timestamps during send bursts
///
/// The dispatch loop marks burst boundaries with [`begin`](Self::begin) and
/// [`end`](Self::end); the receive loop feeds arrivals through
/// [`record`](Self::record). Both `begin` and a saturated `record` hand back
/// the accumulated sample batch for rate recomputation.
pub(crate) struct LatencySampler {
    state: Mutex<SamplerState>,
    min_set_size: usize,
    min_sampling: Duration,
}

struct SamplerState {
    /// Set while a burst is being measured
    collecting_since: Option<Instant>,
    /// When the last burst ended; stragglers sent before this still count
    stopped_at: Instant,
    samples: Vec<Instant>,
    last_update: Instant,
}

impl LatencySampler {
    pub fn new(min_set_size: usize, min_sampling: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SamplerState {
                collecting_since: None,
                stopped_at: now,
                samples: Vec::new(),
                last_update: now,
            }),
            min_set_size,
            min_sampling,
        }
    }

    /// Mark the start of a burst, flushing samples from the previous one
    pub fn begin(&self, now: Instant) -> Vec<Instant> {
        let mut state = self.state.lock();
        state.collecting_since = Some(now);
        state.last_update = now;
        std::mem::take(&mut state.samples)
    }

    /// Mark the end of the current burst
    pub fn end(&self, now: Instant) {
        let mut state = self.state.lock();
        state.collecting_since = None;
        state.stopped_at = now;
    }

    /// Feed one response arrival
    ///
    /// The arrival is kept when it belongs to the measured burst: sent after
    /// the burst began, or sent before the previous burst ended (a
    /// straggler). When enough samples have piled up and the last update is
    /// old enough, the batch is returned for recomputation instead.
    pub fn record(&self, sent_at: Instant, arrival: Instant) -> Option<Vec<Instant>> {
        let mut state = self.state.lock();

        if let Some(since) = state.collecting_since {
            if sent_at > since {
                state.samples.push(arrival);
                return None;
            }
        } else if sent_at < state.stopped_at {
            state.samples.push(arrival);
            return None;
        }

        if state.samples.len() > self.min_set_size
            && arrival.duration_since(state.last_update) > self.min_sampling
        {
            state.last_update = arrival;
            return Some(std::mem::take(&mut state.samples));
        }
        None
    }
}

/// Derive a new send rate from a batch of response-arrival timestamps
///
/// Requires at least `min_set_size` samples. The mean inter-arrival gap is
/// clamped to one second, then reduced by a quarter so the engine drives
/// just under upstream saturation. A derived rate of one query per second or
/// less falls back to `configured`.
pub(crate) fn compute_rate(samples: &[Instant], configured: u32, min_set_size: usize) -> Option<u32> {
    if samples.len() < min_set_size {
        return None;
    }

    let mut total = Duration::ZERO;
    for pair in samples.windows(2) {
        total += pair[1].duration_since(pair[0]);
    }

    let gaps = u32::try_from(samples.len() - 1).unwrap_or(u32::MAX);
    let mut avg = total / gaps;
    if avg > Duration::from_secs(1) {
        avg = Duration::from_secs(1);
    }
    avg -= avg / 4;

    let per_sec = if avg.is_zero() {
        configured
    } else {
        u32::try_from(Duration::from_secs(1).as_nanos() / avg.as_nanos()).unwrap_or(u32::MAX)
    };

    Some(if per_sec <= 1 { configured } else { per_sec })
}
