//! The request-correlation table: remembers, per outstanding
//! forwarded query, which client addresses are waiting for a
//! response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a correlation entry may live before the sweeper purges it
/// even without a matching response.
pub const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(10);

struct CorrelationEntry {
    waiters: Vec<SocketAddr>,
    created_at: Instant,
}

/// A mapping from in-flight transaction fingerprint to the ordered
/// list of client addresses awaiting an answer.
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, CorrelationEntry>>,
    ttl: Duration,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CORRELATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        CorrelationTable {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record that `client_addr` is waiting for a response to the
    /// outstanding query identified by `fingerprint`.
    pub fn set(&self, fingerprint: &str, client_addr: SocketAddr) {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| CorrelationEntry {
                waiters: Vec::new(),
                created_at: Instant::now(),
            })
            .waiters
            .push(client_addr);
    }

    /// The waiters for `fingerprint`, in insertion order, if present.
    pub fn get(&self, fingerprint: &str) -> Option<Vec<SocketAddr>> {
        self.entries
            .lock()
            .unwrap()
            .get(fingerprint)
            .map(|e| e.waiters.clone())
    }

    /// Remove and return the waiters for `fingerprint`, if present.
    pub fn remove(&self, fingerprint: &str) -> Option<Vec<SocketAddr>> {
        self.entries
            .lock()
            .unwrap()
            .remove(fingerprint)
            .map(|e| e.waiters)
    }

    /// Purge entries older than the configured TTL. Returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.created_at.elapsed() < ttl);
        before - entries.len()
    }

    /// The number of in-flight correlation entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn fan_out_accumulates_and_removes_once() {
        let table = CorrelationTable::new();
        table.set("4660", addr(1));
        table.set("4660", addr(2));

        let waiters = table.remove("4660").unwrap();
        assert_eq!(vec![addr(1), addr(2)], waiters);
        assert!(table.remove("4660").is_none());
    }

    #[test]
    fn get_does_not_consume() {
        let table = CorrelationTable::new();
        table.set("4660", addr(1));
        assert_eq!(1, table.get("4660").unwrap().len());
        assert_eq!(1, table.get("4660").unwrap().len());
    }

    #[test]
    fn len_reflects_set_and_remove() {
        let table = CorrelationTable::new();
        assert_eq!(0, table.len());
        table.set("4660", addr(1));
        assert_eq!(1, table.len());
        table.remove("4660");
        assert_eq!(0, table.len());
    }

    #[test]
    fn sweep_purges_stale_entries() {
        let table = CorrelationTable::with_ttl(Duration::from_millis(1));
        table.set("4660", addr(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(1, table.sweep());
        assert!(table.get("4660").is_none());
    }
}
