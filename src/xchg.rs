//! In-flight exchange table
//!
//! Maps `(query id, question name)` to the pending [`ResolveRequest`]. The
//! table is the sole source of truth for "this request is in flight": an
//! entry is added before dispatch, stamped when its message hits the wire,
//! and removed exactly once by the receive loop, the timeout sweeper, or
//! shutdown. All operations take the table's single lock, so id assignment
//! and lookups are atomic with respect to each other.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{ResolveError, ResolveResult};
use crate::request::ResolveRequest;

/// Bounded attempts at drawing an unused query id for a name.
const MAX_ID_ATTEMPTS: usize = 64;

pub(crate) struct ExchangeTable {
    entries: Mutex<HashMap<(u16, String), ResolveRequest>>,
    timeout: Duration,
}

impl ExchangeTable {
    /// Create a table whose entries expire `timeout` after being sent
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Insert a request, assigning a query id unused for its question name
    ///
    /// The request's own id is preferred; on collision a bounded number of
    /// random ids are drawn. The chosen id is written back into the request's
    /// message before encoding, so the returned bytes always carry it.
    ///
    /// # Errors
    ///
    /// `ResolveError::IdExhausted` when no free id was found, or a protocol
    /// error when the message cannot be encoded.
    pub fn add(&self, mut req: ResolveRequest) -> ResolveResult<(u16, Vec<u8>)> {
        let mut entries = self.entries.lock();

        let mut id = req.id;
        let mut attempts = 0;
        while entries.contains_key(&(id, req.name.clone())) {
            attempts += 1;
            if attempts > MAX_ID_ATTEMPTS {
                return Err(ResolveError::id_exhausted(&req.name));
            }
            id = rand::thread_rng().gen();
        }

        req.id = id;
        req.msg.set_id(id);
        let bytes = req.msg.to_vec()?;
        entries.insert((id, req.name.clone()), req);
        Ok((id, bytes))
    }

    /// Record that the message for `(id, name)` is now on the wire
    ///
    /// Starts the expiry clock; entries never written are never swept.
    pub fn update_timestamp(&self, id: u16, name: &str) {
        if let Some(req) = self.entries.lock().get_mut(&(id, name.to_string())) {
            req.sent_at = Some(Instant::now());
        }
    }

    /// Remove and return the entry for `(id, name)`
    pub fn remove(&self, id: u16, name: &str) -> Option<ResolveRequest> {
        self.entries.lock().remove(&(id, name.to_string()))
    }

    /// Remove and return every entry whose send timestamp has aged out
    pub fn remove_expired(&self) -> Vec<ResolveRequest> {
        let mut entries = self.entries.lock();
        let expired: Vec<(u16, String)> = entries
            .iter()
            .filter(|(_, req)| {
                req.sent_at
                    .is_some_and(|sent| sent.elapsed() > self.timeout)
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Drain every entry; used at shutdown
    pub fn remove_all(&self) -> Vec<ResolveRequest> {
        let mut entries = self.entries.lock();
        entries.drain().map(|(_, req)| req).collect()
    }

    /// Number of in-flight entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are in flight
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::sync::oneshot;

    fn request(name: &str, id: u16) -> ResolveRequest {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        let (tx, _rx) = oneshot::channel();
        ResolveRequest::new(msg, name.to_string(), RecordType::A, tx)
    }

    fn table() -> ExchangeTable {
        ExchangeTable::new(Duration::from_millis(50))
    }

    // ========================================================================
    // Add Tests
    // ========================================================================

    #[test]
    fn test_add_keeps_caller_id_when_free() {
        let table = table();
        let (id, bytes) = table.add(request("example.com", 0x1234)).unwrap();
        assert_eq!(id, 0x1234);
        assert!(!bytes.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_rekeys_on_collision() {
        let table = table();
        let (first, _) = table.add(request("example.com", 0x1234)).unwrap();
        let (second, _) = table.add(request("example.com", 0x1234)).unwrap();
        assert_eq!(first, 0x1234);
        assert_ne!(second, 0x1234);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_add_rekeyed_bytes_carry_new_id() {
        let table = table();
        table.add(request("example.com", 0x1234)).unwrap();
        let (id, bytes) = table.add(request("example.com", 0x1234)).unwrap();
        let decoded = Message::from_vec(&bytes).unwrap();
        assert_eq!(decoded.id(), id);
    }

    #[test]
    fn test_same_id_different_names_coexist() {
        let table = table();
        let (a, _) = table.add(request("a.example.com", 7)).unwrap();
        let (b, _) = table.add(request("b.example.com", 7)).unwrap();
        assert_eq!(a, 7);
        assert_eq!(b, 7);
    }

    #[test]
    fn test_no_duplicate_in_flight_keys() {
        let table = table();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..200 {
            let (id, _) = table.add(request("example.com", 1)).unwrap();
            assert!(ids.insert(id), "id {id} handed out twice for one name");
        }
    }

    // ========================================================================
    // Remove Tests
    // ========================================================================

    #[test]
    fn test_remove_returns_entry_once() {
        let table = table();
        let (id, _) = table.add(request("example.com", 9)).unwrap();
        assert!(table.remove(id, "example.com").is_some());
        assert!(table.remove(id, "example.com").is_none());
    }

    #[test]
    fn test_remove_unknown_key() {
        let table = table();
        assert!(table.remove(1, "missing.example.com").is_none());
    }

    #[test]
    fn test_remove_all_drains() {
        let table = table();
        assert!(table.is_empty());
        for i in 0..10 {
            table.add(request(&format!("host{i}.example.com"), i)).unwrap();
        }
        assert!(!table.is_empty());
        assert_eq!(table.remove_all().len(), 10);
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
    }

    // ========================================================================
    // Expiry Tests
    // ========================================================================

    #[test]
    fn test_unsent_entries_never_expire() {
        let table = table();
        table.add(request("example.com", 1)).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert!(table.remove_expired().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sent_entries_expire_after_timeout() {
        let table = table();
        let (id, _) = table.add(request("example.com", 1)).unwrap();
        table.update_timestamp(id, "example.com");

        assert!(table.remove_expired().is_empty());
        std::thread::sleep(Duration::from_millis(80));

        let expired = table.remove_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "example.com");
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_expiry_only_sweeps_aged_entries() {
        let table = table();
        let (old, _) = table.add(request("old.example.com", 1)).unwrap();
        table.update_timestamp(old, "old.example.com");
        std::thread::sleep(Duration::from_millis(80));

        let (fresh, _) = table.add(request("fresh.example.com", 2)).unwrap();
        table.update_timestamp(fresh, "fresh.example.com");

        let expired = table.remove_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "old.example.com");
        assert_eq!(table.len(), 1);
    }
}
