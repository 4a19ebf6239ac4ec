//! DNS wildcard detection
//!
//! A wildcard record `*.<suffix>` synthesises answers for every name under
//! `<suffix>`, which makes enumeration output worthless unless synthesised
//! responses are filtered out. Detection probes each suffix of a candidate
//! name with unlikely random labels through the pool's designated detection
//! resolver, remembers the verdict per suffix for the lifetime of the pool,
//! and keeps the *canonical answer set* (the intersection of answer data
//! across all probes) to tell carved-out real records apart from
//! synthesised ones.
//!
//! The per-suffix walk runs innermost-first, from the registrable domain out
//! toward the queried name. When no level matches, a cross-level heuristic
//! catches wildcards that synthesise identical addresses at several depths.
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
//! pool.add_resolvers(100, &["8.8.8.8"]).await?;
//!
//! let ctx = CancellationToken::new();
//! let msg = query_msg("host.sub.example.com", RecordType::A)?;
//! let resp = pool.query(&ctx, msg, Priority::Normal, None).await?;
//!
//! if pool.wildcard_detected(&ctx, &resp, "example.com").await {
//!     println!("synthesised answer, discard");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;

use dashmap::DashMap;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::answers::{extract_answers, normalize_name, query_msg, ExtractedAnswer};
use crate::engine::QueryEngine;
use crate::pool::Resolvers;
use crate::request::Priority;

/// Maximum length of a full DNS name.
pub const MAX_DNS_NAME_LEN: usize = 253;
/// Maximum length of a single DNS label.
pub const MAX_DNS_LABEL_LEN: usize = 63;
/// Minimum length of a generated probe label.
pub const MIN_LABEL_LEN: usize = 6;
/// Maximum length of a generated probe label.
pub const MAX_LABEL_LEN: usize = 24;
/// The letter-digit-hyphen alphabet probe labels are drawn from.
pub const LDH_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-";

/// Probe rounds per suffix.
const NUM_WILDCARD_TESTS: usize = 3;
/// Synchronous exchange attempts per probe query.
const MAX_QUERY_ATTEMPTS: usize = 5;
/// Query types issued per probe round, in order.
const WILDCARD_QUERY_TYPES: [RecordType; 3] = [RecordType::CNAME, RecordType::A, RecordType::AAAA];

/// Generate an unlikely DNS name directly under `sub`
///
/// Uses the thread-local random source; see [`unlikely_name_with`] for a
/// deterministic variant.
#[must_use]
pub fn unlikely_name(sub: &str) -> String {
    unlikely_name_with(&mut rand::thread_rng(), sub)
}

/// Generate an unlikely DNS name under `sub` from the provided random source
///
/// The label length is drawn uniformly from
/// `[MIN_LABEL_LEN, min(MAX_LABEL_LEN, 253 - len(sub) - 1)]` and filled from
/// [`LDH_CHARS`] with replacement. Leading and trailing hyphens are trimmed;
/// an empty string is returned when nothing survives, and callers regenerate.
///
/// # Example
///
/// ```
/// use rand::SeedableRng;
/// use recon_resolve::unlikely_name_with;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(7);
/// let a = unlikely_name_with(&mut rng, "example.com");
/// let mut rng = rand::rngs::StdRng::seed_from_u64(7);
/// let b = unlikely_name_with(&mut rng, "example.com");
/// assert_eq!(a, b);
/// assert!(a.ends_with(".example.com"));
/// ```
#[must_use]
pub fn unlikely_name_with<R: Rng + ?Sized>(rng: &mut R, sub: &str) -> String {
    let ldh: Vec<char> = LDH_CHARS.chars().collect();

    let mut max = MAX_DNS_NAME_LEN.saturating_sub(sub.len() + 1);
    if max > MAX_LABEL_LEN {
        max = MAX_LABEL_LEN;
    }
    if max < MIN_LABEL_LEN {
        max = MIN_LABEL_LEN;
    }

    let len = rng.gen_range(MIN_LABEL_LEN..=max);
    let label: String = (0..len).map(|_| ldh[rng.gen_range(0..ldh.len())]).collect();

    let label = label.trim_matches('-');
    if label.is_empty() {
        return String::new();
    }
    format!("{label}.{sub}")
}

/// Pool-scoped map from subdomain suffix to its wildcard state
///
/// Entries are created on first query under a suffix and never removed.
#[derive(Default)]
pub(crate) struct WildcardRegistry {
    states: DashMap<String, Arc<Wildcard>>,
}

impl WildcardRegistry {
    /// Get the entry for `sub`, creating an unpopulated one on miss
    fn get_or_create(&self, sub: &str) -> Arc<Wildcard> {
        self.states.entry(sub.to_string()).or_default().clone()
    }

    /// Get the entry for `sub` without creating one
    fn peek(&self, sub: &str) -> Option<Arc<Wildcard>> {
        self.states.get(sub).map(|entry| Arc::clone(entry.value()))
    }
}

/// One suffix's wildcard slot
///
/// The mutex covers both first-time population and every later match query,
/// so no caller can observe a half-populated state. `None` means the suffix
/// has not been probed yet; the first caller to take the lock probes it.
#[derive(Default)]
pub(crate) struct Wildcard {
    state: Mutex<Option<WildcardState>>,
}

/// The memoised verdict for one suffix
#[derive(Debug, Clone)]
pub(crate) struct WildcardState {
    /// Whether any probe under this suffix was answered
    detected: bool,
    /// Answers whose data appeared in every probe round
    answers: Vec<ExtractedAnswer>,
}

impl WildcardState {
    /// Test whether a live response looks synthesised by this wildcard
    ///
    /// With no canonical answers recorded, or an empty live answer section,
    /// a detected wildcard matches conservatively.
    fn matches(&self, resp: &Message) -> bool {
        if !self.detected {
            return false;
        }
        if self.answers.is_empty() || resp.answers().is_empty() {
            return true;
        }

        let live: HashSet<String> = extract_answers(resp)
            .into_iter()
            .map(|a| record_data_key(&a.data))
            .collect();
        self.answers
            .iter()
            .any(|a| live.contains(&record_data_key(&a.data)))
    }
}

/// Comparable form of record data: dots trimmed from both ends.
fn record_data_key(data: &str) -> String {
    data.trim_matches('.').to_string()
}

fn data_set(answers: &[ExtractedAnswer]) -> HashSet<String> {
    answers.iter().map(|a| record_data_key(&a.data)).collect()
}

impl Resolvers {
    /// Decide whether `resp` appears to be wildcard-synthesised
    ///
    /// `domain` is the registrable domain the response belongs to. Every
    /// suffix between the domain and the queried name is probed at most once
    /// per pool lifetime; verdicts are memoised. Returns `false` when no
    /// detection resolver exists and none can be adopted from the pool.
    ///
    /// Name comparison is insensitive to case and trailing dots in both the
    /// response's question name and `domain`.
    pub async fn wildcard_detected(
        &self,
        ctx: &CancellationToken,
        resp: &Message,
        domain: &str,
    ) -> bool {
        let Some(detector) = self.detection_resolver() else {
            return false;
        };
        let Some(question) = resp.queries().first() else {
            return false;
        };

        let name = normalize_name(&question.name().to_string());
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return false;
        }

        let base = domain.split('.').count();
        let mut labels: Vec<&str> = name.split('.').collect();
        // The full name itself is not probed, only the suffixes under it.
        if labels.len() > base {
            labels.remove(0);
        }
        if labels.len() < base {
            return false;
        }

        // Walk each suffix starting from the registrable domain.
        for start in (0..=labels.len() - base).rev() {
            let sub = labels[start..].join(".");

            let wildcard = self.registry().get_or_create(&sub);
            let mut state = wildcard.state.lock().await;
            if state.is_none() {
                *state = Some(self.probe(ctx, &detector, &sub).await);
            }
            let matched = state.as_ref().is_some_and(|s| s.matches(resp));
            drop(state);

            if matched {
                return true;
            }
        }

        self.ips_across_levels(&name, &domain).await
    }

    /// Probe `sub` with unlikely names and build its memoised state
    async fn probe(
        &self,
        ctx: &CancellationToken,
        detector: &QueryEngine,
        sub: &str,
    ) -> WildcardState {
        let mut detected = false;
        let mut collected: Vec<ExtractedAnswer> = Vec::new();
        let mut intersection: HashSet<String> = HashSet::new();

        for round in 0..NUM_WILDCARD_TESTS {
            let name = loop {
                let candidate = unlikely_name(sub);
                if !candidate.is_empty() {
                    break candidate;
                }
            };

            let mut round_answers: Vec<ExtractedAnswer> = Vec::new();
            for qtype in WILDCARD_QUERY_TYPES {
                let answers = self.query_attempts(ctx, detector, &name, qtype).await;
                if !answers.is_empty() {
                    detected = true;
                    round_answers.extend(answers);
                }
            }

            let round_set = data_set(&round_answers);
            if round == 0 {
                intersection = round_set;
            } else {
                intersection = intersection.intersection(&round_set).cloned().collect();
            }
            collected.extend(round_answers);
        }

        // Keep one answer per data value that survived every round.
        let mut seen: HashSet<String> = HashSet::new();
        let mut answers = Vec::new();
        for mut answer in collected {
            answer.data = record_data_key(&answer.data);
            if intersection.contains(&answer.data) && seen.insert(answer.data.clone()) {
                answers.push(answer);
            }
        }

        if detected {
            info!("DNS wildcard detected: Resolver {}: *.{}", detector, sub);
        }
        WildcardState { detected, answers }
    }

    /// Issue one probe query, retrying until an answered success or the
    /// attempt budget runs out
    async fn query_attempts(
        &self,
        ctx: &CancellationToken,
        detector: &QueryEngine,
        name: &str,
        qtype: RecordType,
    ) -> Vec<ExtractedAnswer> {
        for _ in 0..MAX_QUERY_ATTEMPTS {
            let Ok(msg) = query_msg(name, qtype) else {
                return Vec::new();
            };

            if let Ok(resp) = detector.query(ctx, msg, Priority::Critical, None).await {
                if resp.response_code() == ResponseCode::NoError && !resp.answers().is_empty() {
                    return extract_answers(&resp);
                }
            }
            if ctx.is_cancelled() {
                break;
            }
        }
        Vec::new()
    }

    /// Cross-level heuristic: identical data synthesised at several depths
    ///
    /// Walks the already-probed suffix states between the name and the
    /// domain; stops at the first unprobed or answerless level. True when
    /// one data value is shared by every level walked.
    async fn ips_across_levels(&self, name: &str, domain: &str) -> bool {
        let base = domain.split('.').count();
        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() <= base || labels.len() - base < 3 {
            return false;
        }

        let depth = labels.len() - base;
        let mut records: HashSet<String> = HashSet::new();

        for dropped in 1..=depth {
            let sub = labels[dropped..].join(".");
            let Some(wildcard) = self.registry().peek(&sub) else {
                break;
            };

            let state = wildcard.state.lock().await;
            let Some(state) = state.as_ref() else {
                break;
            };
            if state.answers.is_empty() {
                break;
            }

            let level = data_set(&state.answers);
            if dropped == 1 {
                records = level;
            } else {
                records = records.intersection(&level).cloned().collect();
            }
        }

        !records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn answer(name: &str, ip: [u8; 4]) -> ExtractedAnswer {
        ExtractedAnswer {
            name: name.to_string(),
            rtype: RecordType::A,
            data: Ipv4Addr::from(ip).to_string(),
        }
    }

    fn response(name: &str, ips: &[[u8; 4]]) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Response);
        let qname = Name::from_str(name).unwrap();
        msg.add_query(Query::query(qname.clone(), RecordType::A));
        for ip in ips {
            let mut record = Record::new();
            record.set_name(qname.clone());
            record.set_record_type(RecordType::A);
            record.set_dns_class(DNSClass::IN);
            record.set_ttl(0);
            record.set_data(Some(RData::A(A(Ipv4Addr::from(*ip)))));
            msg.add_answer(record);
        }
        msg
    }

    // ========================================================================
    // Unlikely Name Tests
    // ========================================================================

    #[test]
    fn test_unlikely_name_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let name = unlikely_name_with(&mut rng, "example.com");
            if name.is_empty() {
                continue;
            }
            let label = name.strip_suffix(".example.com").expect("suffix kept");
            assert!(!label.is_empty() && label.len() <= MAX_LABEL_LEN);
            assert!(!label.starts_with('-') && !label.ends_with('-'));
            assert!(label.chars().all(|c| LDH_CHARS.contains(c)));
        }
    }

    #[test]
    fn test_unlikely_name_deterministic_with_seed() {
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        for _ in 0..10 {
            assert_eq!(
                unlikely_name_with(&mut a, "sub.example.com"),
                unlikely_name_with(&mut b, "sub.example.com")
            );
        }
    }

    #[test]
    fn test_unlikely_name_respects_total_length() {
        let long_sub = format!("{}.example.com", "a".repeat(230));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let name = unlikely_name_with(&mut rng, &long_sub);
            if !name.is_empty() {
                assert!(name.len() <= MAX_DNS_NAME_LEN);
            }
        }
    }

    // ========================================================================
    // Match Rule Tests
    // ========================================================================

    #[test]
    fn test_match_requires_detection() {
        let state = WildcardState {
            detected: false,
            answers: vec![answer("x.example.com", [192, 168, 1, 64])],
        };
        assert!(!state.matches(&response("x.example.com", &[[192, 168, 1, 64]])));
    }

    #[test]
    fn test_match_on_shared_data() {
        let state = WildcardState {
            detected: true,
            answers: vec![answer("w.example.com", [192, 168, 1, 64])],
        };
        assert!(state.matches(&response("q.example.com", &[[192, 168, 1, 64]])));
    }

    #[test]
    fn test_no_match_on_disjoint_data() {
        let state = WildcardState {
            detected: true,
            answers: vec![answer("w.example.com", [192, 168, 1, 64])],
        };
        assert!(!state.matches(&response("ns.example.com", &[[192, 168, 1, 2]])));
    }

    #[test]
    fn test_conservative_match_on_empty_canonical_set() {
        let state = WildcardState {
            detected: true,
            answers: Vec::new(),
        };
        assert!(state.matches(&response("q.example.com", &[[10, 0, 0, 1]])));
    }

    #[test]
    fn test_conservative_match_on_empty_live_answers() {
        let state = WildcardState {
            detected: true,
            answers: vec![answer("w.example.com", [192, 168, 1, 64])],
        };
        assert!(state.matches(&response("q.example.com", &[])));
    }

    // ========================================================================
    // Registry Tests
    // ========================================================================

    #[tokio::test]
    async fn test_registry_get_or_create_is_stable() {
        let registry = WildcardRegistry::default();
        let first = registry.get_or_create("example.com");
        let second = registry.get_or_create("example.com");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_registry_peek_does_not_create() {
        let registry = WildcardRegistry::default();
        assert!(registry.peek("example.com").is_none());
        registry.get_or_create("example.com");
        assert!(registry.peek("example.com").is_some());
    }

    #[tokio::test]
    async fn test_state_populated_once() {
        let registry = WildcardRegistry::default();
        let wildcard = registry.get_or_create("example.com");
        {
            let mut state = wildcard.state.lock().await;
            assert!(state.is_none());
            *state = Some(WildcardState {
                detected: true,
                answers: Vec::new(),
            });
        }
        let again = registry.get_or_create("example.com");
        assert!(again.state.lock().await.is_some());
    }

    // ========================================================================
    // Data Key Tests
    // ========================================================================

    #[test]
    fn test_record_data_key_trims_dots() {
        assert_eq!(record_data_key("target.example.com."), "target.example.com");
        assert_eq!(record_data_key("192.168.1.1"), "192.168.1.1");
    }

    #[test]
    fn test_data_set_dedupes() {
        let answers = vec![
            answer("a.example.com", [10, 0, 0, 1]),
            answer("b.example.com", [10, 0, 0, 1]),
        ];
        assert_eq!(data_set(&answers).len(), 1);
    }
}
