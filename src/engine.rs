//! Per-resolver query engine
//!
//! One [`QueryEngine`] owns a single UDP socket connected to one upstream
//! recursive resolver and four cooperating loops:
//!
//! ```text
//!  query() ──▶ exchange table ──▶ priority queue
//!                                      │
//!                                      ▼
//!                               dispatch loop ── rate limiter ──▶ UDP send
//!                                                                    │
//!  caller ◀── result sink ◀── read loop ◀── receive loop ◀───────────┘
//!                    ▲
//!                    └────────── timeout loop (500 ms sweep)
//! ```
//!
//! - **dispatch** pops queued queries in priority order, takes a token from
//!   the adaptive rate limiter, and writes to the socket under a write
//!   deadline; it also marks sampling-burst boundaries.
//! - **receive** reads responses, matches them to in-flight entries by
//!   `(id, question name)`, and feeds latency samples to the limiter.
//! - **timeout** sweeps the exchange table every sweep interval and fails
//!   aged entries with a retryable timeout.
//! - **read handling** classifies responses, spawning a one-shot TCP
//!   exchange when the upstream truncated its answer.
//!
//! All four exit on a shared cancellation token; [`stop`](QueryEngine::stop)
//! then drains the table and the read queue so every pending caller
//! unblocks with a non-retryable [`ResolveError::Stopped`].
//!
//! # Example
//!
//! ```no_run
//! use hickory_proto::rr::RecordType;
//! use recon_resolve::{Priority, QueryEngine, query_msg};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = QueryEngine::new("8.8.8.8", 100).await?;
//!
//! let ctx = CancellationToken::new();
//! let msg = query_msg("www.example.com", RecordType::A)?;
//! let response = engine.query(&ctx, msg, Priority::Normal, None).await?;
//! println!("{} answers", response.answers().len());
//!
//! engine.stop();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::answers::normalize_name;
use crate::config::ResolverConfig;
use crate::error::{ResolveError, ResolveResult};
use crate::limiter::{compute_rate, LatencySampler, SendRateLimiter};
use crate::queue::PriorityQueue;
use crate::request::{Priority, QueuedQuery, ResolveRequest, Retry};
use crate::xchg::ExchangeTable;

/// Receive buffer large enough for EDNS0 responses.
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// A single-connection DNS client bound to one upstream resolver
///
/// Cloning is cheap and shares the underlying engine.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    /// Canonical upstream address, used in errors and log lines
    address: String,
    server_addr: SocketAddr,
    config: ResolverConfig,
    socket: UdpSocket,
    queue: PriorityQueue<QueuedQuery>,
    xchgs: ExchangeTable,
    limiter: SendRateLimiter,
    sampler: LatencySampler,
    read_tx: mpsc::UnboundedSender<(ResolveRequest, Message)>,
    done: CancellationToken,
    stopped: AtomicBool,
}

impl QueryEngine {
    /// Create an engine for `address` pacing at `qps` queries per second
    ///
    /// An address without a port defaults to `:53`.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::Config` for an invalid address or a zero
    /// query rate, and `ResolveError::Resolver` when the UDP socket cannot
    /// be opened.
    pub async fn new(address: &str, qps: u32) -> ResolveResult<Self> {
        Self::with_config(ResolverConfig::new(address, qps)).await
    }

    /// Create an engine from a full configuration
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new); additionally fails when the configuration
    /// does not validate.
    pub async fn with_config(config: ResolverConfig) -> ResolveResult<Self> {
        config.validate()?;
        let server_addr = config.socket_addr()?;

        let bind_addr = if server_addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            ResolveError::resolver_io(format!("failed to bind a UDP socket for {server_addr}"), e)
        })?;
        socket.connect(server_addr).await.map_err(|e| {
            ResolveError::resolver_io(
                format!("failed to establish a UDP connection to {server_addr}"),
                e,
            )
        })?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            address: server_addr.to_string(),
            server_addr,
            socket,
            queue: PriorityQueue::new(),
            xchgs: ExchangeTable::new(config.exchange_timeout()),
            limiter: SendRateLimiter::new(config.qps),
            sampler: LatencySampler::new(config.min_sample_set_size, config.min_sampling()),
            read_tx,
            done: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            config,
        });

        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        tokio::spawn(recv_loop(Arc::clone(&inner)));
        tokio::spawn(timeout_loop(Arc::clone(&inner)));
        tokio::spawn(read_loop(Arc::clone(&inner), read_rx));

        Ok(Self { inner })
    }

    /// Resolve `msg` through the upstream, retrying per the caller's policy
    ///
    /// Blocks until a response arrives, `ctx` is cancelled (a retryable
    /// timeout error), or the retry policy declines another attempt. The
    /// engine itself never retries beyond the TCP fallback on truncation;
    /// every further attempt is the policy's decision.
    ///
    /// # Errors
    ///
    /// Any [`ResolveError`]; branch on
    /// [`is_retryable`](ResolveError::is_retryable) or
    /// [`rcode`](ResolveError::rcode).
    pub async fn query(
        &self,
        ctx: &CancellationToken,
        msg: Message,
        priority: Priority,
        retry: Option<&Retry>,
    ) -> ResolveResult<Message> {
        if self.stopped() {
            return Err(ResolveError::stopped(&self.inner.address));
        }

        let mut attempts = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(ResolveError::timeout("the request context was cancelled"));
            }

            attempts += 1;
            match self.exchange(ctx, msg.clone(), priority).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    let again = retry.is_some_and(|policy| policy(attempts, priority, &err));
                    if !again {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Submit one attempt and wait for its result sink
    async fn exchange(
        &self,
        ctx: &CancellationToken,
        msg: Message,
        priority: Priority,
    ) -> ResolveResult<Message> {
        let question = msg
            .queries()
            .first()
            .ok_or_else(|| ResolveError::resolver("query message has no question section"))?;
        let name = normalize_name(&question.name().to_string());
        let qtype = question.query_type();

        let (tx, rx) = oneshot::channel();
        let req = ResolveRequest::new(msg, name.clone(), qtype, tx);
        let (id, bytes) = self.inner.xchgs.add(req)?;
        self.inner.queue.push(QueuedQuery { id, name, bytes }, priority);

        tokio::select! {
            () = ctx.cancelled() => {
                // The entry stays in the table for the timeout sweeper.
                Err(ResolveError::timeout("the request context was cancelled"))
            }
            result = rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ResolveError::stopped(&self.inner.address)),
            },
        }
    }

    /// Signal every loop to exit and fail all pending requests
    ///
    /// Idempotent; requests submitted afterwards fail immediately with
    /// `ResolveError::Stopped`.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.done.cancel();
        }
    }

    /// Whether [`stop`](Self::stop) has been called
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Canonical `ip:port` address of the upstream
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The send rate currently in effect, queries per second
    #[must_use]
    pub fn current_rate(&self) -> u32 {
        self.inner.limiter.current_rate()
    }

    /// Number of requests currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.xchgs.len()
    }

    /// Number of queries waiting in the dispatch queue
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.inner.queue.len()
    }
}

impl fmt::Display for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.address)
    }
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("address", &self.inner.address)
            .field("stopped", &self.stopped())
            .field("in_flight", &self.in_flight())
            .field("backlog", &self.backlog())
            .finish()
    }
}

/// Pop queued queries, pace them through the limiter, write to the socket
async fn dispatch_loop(inner: Arc<EngineInner>) {
    let mut measuring = false;
    let mut last = Instant::now();
    let max_delay = inner.config.max_sample_delay();

    loop {
        let queued = tokio::select! {
            () = inner.done.cancelled() => return,
            queued = inner.queue.next() => queued,
        };

        inner.limiter.take().await;

        let now = Instant::now();
        if !measuring && !inner.queue.is_empty() {
            let batch = inner.sampler.begin(now);
            apply_rate(&inner, &batch);
            measuring = true;
        } else if measuring && inner.queue.is_empty() && now.duration_since(last) > max_delay {
            inner.sampler.end(now);
            measuring = false;
        }
        last = now;

        write_message(&inner, queued).await;
    }
}

/// Write one query under the write deadline; failures fail the request
async fn write_message(inner: &EngineInner, queued: QueuedQuery) {
    let outcome = tokio::time::timeout(inner.config.write_timeout(), inner.socket.send(&queued.bytes)).await;

    let error = match outcome {
        Ok(Ok(_)) => {
            inner.xchgs.update_timestamp(queued.id, &queued.name);
            return;
        }
        Ok(Err(e)) => format!("failed to write the query message: {e}"),
        Err(_) => format!(
            "write deadline of {:?} exceeded",
            inner.config.write_timeout()
        ),
    };

    warn!(resolver = %inner.address, error = %error, "query write failed");
    if let Some(req) = inner.xchgs.remove(queued.id, &queued.name) {
        let (name, qtype) = (req.name.clone(), req.qtype);
        req.complete(Err(ResolveError::timeout(format!(
            "query on resolver {} for {} type {} was not sent: {error}",
            inner.address, name, qtype
        ))));
    }
}

/// Read responses, match them to in-flight entries, collect latency samples
async fn recv_loop(inner: Arc<EngineInner>) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];

    loop {
        let len = tokio::select! {
            () = inner.done.cancelled() => return,
            received = inner.socket.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    debug!(resolver = %inner.address, error = %e, "UDP receive failed");
                    continue;
                }
            },
        };

        let Ok(msg) = Message::from_vec(&buf[..len]) else {
            debug!(resolver = %inner.address, "discarding unparseable response");
            continue;
        };
        let Some(question) = msg.queries().first() else {
            continue;
        };

        let name = normalize_name(&question.name().to_string());
        let Some(req) = inner.xchgs.remove(msg.id(), &name) else {
            continue;
        };

        let arrival = Instant::now();
        let sent_at = req.sent_at.unwrap_or(req.created_at);
        if let Some(batch) = inner.sampler.record(sent_at, arrival) {
            apply_rate(&inner, &batch);
        }

        if let Err(send_err) = inner.read_tx.send((req, msg)) {
            // The read loop is gone; unblock the caller directly.
            let (req, _) = send_err.0;
            req.complete(Err(ResolveError::stopped(&inner.address)));
            return;
        }
    }
}

/// Recompute the send rate from a flushed sample batch
fn apply_rate(inner: &EngineInner, batch: &[Instant]) {
    if let Some(rate) = compute_rate(
        batch,
        inner.limiter.configured_rate(),
        inner.config.min_sample_set_size,
    ) {
        if rate != inner.limiter.current_rate() {
            debug!(
                resolver = %inner.address,
                rate,
                samples = batch.len(),
                "adjusted send rate from response latency"
            );
        }
        inner.limiter.set_rate(rate);
    }
}

/// Sweep aged entries out of the exchange table; drain it on shutdown
async fn timeout_loop(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval());

    loop {
        tokio::select! {
            () = inner.done.cancelled() => break,
            _ = ticker.tick() => {
                if inner.xchgs.is_empty() {
                    continue;
                }
                for req in inner.xchgs.remove_expired() {
                    let (name, qtype) = (req.name.clone(), req.qtype);
                    req.complete(Err(ResolveError::timeout(format!(
                        "query on resolver {} for {} type {} timed out",
                        inner.address, name, qtype
                    ))));
                }
            }
        }
    }

    // Drain the table so every waiting caller returns.
    for req in inner.xchgs.remove_all() {
        req.complete(Err(ResolveError::stopped(&inner.address)));
    }
}

/// Classify received responses and deliver results
async fn read_loop(
    inner: Arc<EngineInner>,
    mut read_rx: mpsc::UnboundedReceiver<(ResolveRequest, Message)>,
) {
    loop {
        tokio::select! {
            () = inner.done.cancelled() => break,
            next = read_rx.recv() => match next {
                Some((req, resp)) => process_response(&inner, req, resp),
                None => return,
            },
        }
    }

    // Drain queued reads so their callers return.
    while let Ok((req, _)) = read_rx.try_recv() {
        req.complete(Err(ResolveError::stopped(&inner.address)));
    }
}

/// Apply the response-classification rules to one exchange
fn process_response(inner: &Arc<EngineInner>, req: ResolveRequest, resp: Message) {
    let rcode = resp.response_code();
    if rcode != ResponseCode::NoError {
        let err = ResolveError::upstream_rcode(&inner.address, &req.name, req.qtype, rcode);
        req.complete(Err(err));
        return;
    }

    if resp.truncated() {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tcp_exchange(&inner, req).await;
        });
        return;
    }

    req.complete(Ok(resp));
}

/// One-shot TCP exchange after a truncated UDP response
async fn tcp_exchange(inner: &EngineInner, req: ResolveRequest) {
    let deadline = inner.config.tcp_timeout();
    let result = tokio::time::timeout(deadline, exchange_over_tcp(inner.server_addr, &req.msg)).await;

    match result {
        Ok(Ok(resp)) => req.complete(Ok(resp)),
        Ok(Err(err)) => req.complete(Err(ResolveError::tcp_fallback(
            &inner.address,
            err.to_string(),
        ))),
        Err(_) => req.complete(Err(ResolveError::tcp_fallback(
            &inner.address,
            format!("exchange timed out after {deadline:?}"),
        ))),
    }
}

/// Length-prefixed DNS exchange over a fresh TCP connection (RFC 1035 §4.2.2)
async fn exchange_over_tcp(server_addr: SocketAddr, msg: &Message) -> ResolveResult<Message> {
    let bytes = msg.to_vec()?;
    let len = u16::try_from(bytes.len())
        .map_err(|_| ResolveError::resolver("query message exceeds the TCP length prefix"))?;

    let mut stream = TcpStream::connect(server_addr).await?;
    stream.set_nodelay(true).ok();

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let resp_len = usize::from(u16::from_be_bytes(len_buf));

    let mut resp_buf = vec![0u8; resp_len];
    stream.read_exact(&mut resp_buf).await?;
    Ok(Message::from_vec(&resp_buf)?)
}
