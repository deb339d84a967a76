//! A TTL-bounded cache of answers learned from forwarders, keyed by
//! normalized question key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::record::DnsRecord;

/// Default time a bundle of forwarded answers stays valid for.
pub const DEFAULT_ANSWER_TTL: Duration = Duration::from_secs(300);

struct Bundle {
    created_at: Instant,
    ttl: Duration,
    records: Vec<DnsRecord>,
}

impl Bundle {
    fn is_valid(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

/// A cache of record bundles ingested from forwarder responses,
/// indexed by normalized question key.
#[derive(Default)]
pub struct AnswerCache {
    entries: Mutex<HashMap<String, Vec<Bundle>>>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The union of all valid bundles for `key`, deduplicated by
    /// encoded form. Empty on a miss or if every bundle has expired.
    pub fn get(&self, key: &str) -> Vec<DnsRecord> {
        let entries = self.entries.lock().unwrap();
        let Some(bundles) = entries.get(key) else {
            return Vec::new();
        };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for bundle in bundles.iter().filter(|b| b.is_valid()) {
            for record in &bundle.records {
                if seen.insert(record.encoded.clone()) {
                    out.push(record.clone());
                }
            }
        }
        out
    }

    /// Append a bundle of records with the default TTL.
    pub fn set(&self, key: &str, records: Vec<DnsRecord>) {
        self.entries
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Bundle {
                created_at: Instant::now(),
                ttl: DEFAULT_ANSWER_TTL,
                records,
            });
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Append a bundle with an explicit TTL. Exposed for tests that
    /// need to exercise expiry without waiting out the default TTL.
    #[cfg(test)]
    fn set_with_ttl(&self, key: &str, records: Vec<DnsRecord>, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Bundle {
                created_at: Instant::now(),
                ttl,
                records,
            });
    }

    /// Drop expired bundles, and any key left with no valid bundles.
    /// Returns the number of keys removed entirely.
    pub fn trim(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, bundles| {
            bundles.retain(Bundle::is_valid);
            !bundles.is_empty()
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;

    fn record() -> DnsRecord {
        DnsRecord {
            hostname: "unknown.test".to_string(),
            record_type: crate::record::RecordKind::A,
            address: Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
            text: None,
            encoded: vec![1, 2, 3],
            ttl: 300,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn miss_returns_empty() {
        let cache = AnswerCache::new();
        assert!(cache.get("unknown.test:1").is_empty());
    }

    #[test]
    fn set_then_get_returns_bundle() {
        let cache = AnswerCache::new();
        cache.set("unknown.test:1", vec![record()]);
        assert_eq!(1, cache.get("unknown.test:1").len());
    }

    #[test]
    fn get_deduplicates_across_bundles() {
        let cache = AnswerCache::new();
        cache.set("unknown.test:1", vec![record()]);
        cache.set("unknown.test:1", vec![record()]);
        assert_eq!(1, cache.get("unknown.test:1").len());
    }

    #[test]
    fn remove_clears_key() {
        let cache = AnswerCache::new();
        cache.set("unknown.test:1", vec![record()]);
        cache.remove("unknown.test:1");
        assert!(cache.get("unknown.test:1").is_empty());
    }

    #[test]
    fn expired_bundle_is_not_returned_and_trim_drops_the_key() {
        let cache = AnswerCache::new();
        cache.set_with_ttl("unknown.test:1", vec![record()], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("unknown.test:1").is_empty());
        assert_eq!(1, cache.trim());
        assert!(!cache.entries.lock().unwrap().contains_key("unknown.test:1"));
    }
}
