//! The per-group record store: an in-memory hostname -> records
//! table, persisted as a `bincode` blob.
//!
//! The on-disk shape mirrors the original system's `DNSRecord`: each
//! stored record keeps both a decoded summary (for REST responses and
//! matching) and the full wire-encoded resource record (so it can be
//! dropped straight into a response packet without re-encoding).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::SystemTime;

use dns_types::protocol::deserialise::ConsumableBuffer;
use dns_types::protocol::serialise::WritableBuffer;
use dns_types::protocol::types::{RecordClass, RecordType, RecordTypeWithData, ResourceRecord};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The record types constructible and servable through this system.
/// A subset of `dns_types::protocol::types::RecordType`: the ones
/// this specification's data model names explicitly.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Aaaa,
    Srv,
    Txt,
    Other(u16),
}

impl From<RecordType> for RecordKind {
    fn from(rtype: RecordType) -> Self {
        match rtype {
            RecordType::A => RecordKind::A,
            RecordType::NS => RecordKind::Ns,
            RecordType::CNAME => RecordKind::Cname,
            RecordType::SOA => RecordKind::Soa,
            RecordType::PTR => RecordKind::Ptr,
            RecordType::MX => RecordKind::Mx,
            RecordType::AAAA => RecordKind::Aaaa,
            RecordType::SRV => RecordKind::Srv,
            RecordType::TXT => RecordKind::Txt,
            other => RecordKind::Other(other.into()),
        }
    }
}

/// A single stored DNS record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    pub hostname: String,
    pub record_type: RecordKind,
    pub address: Option<IpAddr>,
    pub text: Option<String>,
    pub encoded: Vec<u8>,
    pub ttl: u32,
    pub created_at: SystemTime,
}

impl DnsRecord {
    /// Build a stored record from a decoded resource record, keeping
    /// both the summary fields and the full wire encoding.
    ///
    /// # Errors
    ///
    /// If the resource record's RDATA is too long to encode.
    pub fn from_resource_record(hostname: &str, rr: ResourceRecord) -> Result<Self, Error> {
        let record_type = rr.rtype_with_data.rtype().into();
        let (address, text) = summarize(&rr.rtype_with_data);
        let ttl = rr.ttl;
        let mut buffer = WritableBuffer::default();
        rr.serialise(&mut buffer)?;
        Ok(DnsRecord {
            hostname: hostname.to_string(),
            record_type,
            address,
            text,
            encoded: buffer.octets,
            ttl,
            created_at: SystemTime::now(),
        })
    }

    /// Decode the stored wire bytes back into a `ResourceRecord`, with
    /// the given name and TTL (callers typically want the TTL
    /// recomputed relative to now, rather than the stored value).
    ///
    /// # Errors
    ///
    /// If the stored bytes are corrupt.
    pub fn to_resource_record(
        &self,
        name: dns_types::protocol::types::DomainName,
        ttl: u32,
    ) -> Result<ResourceRecord, dns_types::protocol::deserialise::Error> {
        let mut buffer = ConsumableBuffer::new(&self.encoded);
        let mut rr = ResourceRecord::deserialise(0, &mut buffer)?;
        rr.name = name;
        rr.ttl = ttl;
        Ok(rr)
    }
}

fn summarize(data: &RecordTypeWithData) -> (Option<IpAddr>, Option<String>) {
    match data {
        RecordTypeWithData::A { address } => (Some(IpAddr::V4(*address)), None),
        RecordTypeWithData::AAAA { address } => (Some(IpAddr::V6(*address)), None),
        RecordTypeWithData::NS { nsdname } => (None, Some(nsdname.to_dotted_string())),
        RecordTypeWithData::CNAME { cname } => (None, Some(cname.to_dotted_string())),
        RecordTypeWithData::PTR { ptrdname } => (None, Some(ptrdname.to_dotted_string())),
        RecordTypeWithData::MX { exchange, .. } => (None, Some(exchange.to_dotted_string())),
        RecordTypeWithData::SRV { target, .. } => (None, Some(target.to_dotted_string())),
        RecordTypeWithData::TXT { octets } => {
            (None, Some(String::from_utf8_lossy(octets).into_owned()))
        }
        RecordTypeWithData::SOA { mname, rname, .. } => (
            None,
            Some(format!(
                "{} {}",
                mname.to_dotted_string(),
                rname.to_dotted_string()
            )),
        ),
        _ => (None, None),
    }
}

/// An upstream resolver a group forwards unresolved queries to.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Forwarder {
    pub ip: IpAddr,
    pub port: u16,
    pub zone: String,
}

/// Deduplicate a list of forwarders by `(ip, port, zone)`, preserving
/// first-occurrence order.
pub fn dedup_forwarders(forwarders: Vec<Forwarder>) -> Vec<Forwarder> {
    let mut seen = std::collections::HashSet::new();
    forwarders
        .into_iter()
        .filter(|f| seen.insert(f.clone()))
        .collect()
}

/// An in-memory, single-group record table, persisted as a binary
/// blob containing the record map plus a snapshot of the owning
/// group's domains, forwarders and identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordStore {
    group_id: String,
    domains: Vec<String>,
    forwarders: Vec<Forwarder>,
    records: HashMap<String, Vec<DnsRecord>>,
}

impl RecordStore {
    /// Create a new, empty record store for a group.
    pub fn new(group_id: impl Into<String>, domains: Vec<String>, forwarders: Vec<Forwarder>) -> Self {
        RecordStore {
            group_id: group_id.into(),
            domains,
            forwarders: dedup_forwarders(forwarders),
            records: HashMap::new(),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group_id
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn forwarders(&self) -> &[Forwarder] {
        &self.forwarders
    }

    /// Overlay the catalogue's current view of this group's metadata.
    /// The catalogue is the source of truth for domains/forwarders;
    /// the blob's own snapshot is overwritten on load.
    pub fn apply_metadata(&mut self, domains: Vec<String>, forwarders: Vec<Forwarder>) {
        self.domains = domains;
        self.forwarders = dedup_forwarders(forwarders);
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn get(&self, host: &str) -> Vec<DnsRecord> {
        self.records.get(host).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, host: &str, record: DnsRecord) {
        self.records.entry(host.to_string()).or_default().push(record);
    }

    /// Atomically substitute the records for `host`.
    pub fn replace(&mut self, host: &str, records: Vec<DnsRecord>) {
        self.records.insert(host.to_string(), records);
    }

    /// Remove the given host's entry. Returns `true` iff it existed.
    pub fn remove(&mut self, host: &str) -> bool {
        self.records.remove(host).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Load a record store from its blob file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or the blob is corrupt.
    pub async fn load_from_file(path: &Path) -> Result<Self, Error> {
        let bytes = tokio::fs::read(path).await?;
        let store = bincode::deserialize(&bytes)?;
        Ok(store)
    }

    /// Write this store to its blob file, replacing any previous
    /// contents. Must be called under the owning group's store mutex.
    ///
    /// # Errors
    ///
    /// If the file cannot be written or the store cannot be encoded.
    pub async fn save_to_file(&self, path: &Path) -> Result<(), Error> {
        let bytes = bincode::serialize(self)?;
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::DomainName;
    use std::net::Ipv4Addr;

    fn domain(s: &str) -> DomainName {
        DomainName::from_dotted_string(s).unwrap()
    }

    fn a_record(hostname: &str) -> DnsRecord {
        let rr = ResourceRecord {
            name: domain(&format!("{hostname}.")),
            rtype_with_data: RecordTypeWithData::A {
                address: Ipv4Addr::new(203, 0, 113, 7),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        DnsRecord::from_resource_record(hostname, rr).unwrap()
    }

    #[test]
    fn set_and_get_round_trips() {
        let mut store = RecordStore::new("default", vec![], vec![]);
        store.set("example.com", a_record("example.com"));
        let got = store.get("example.com");
        assert_eq!(1, got.len());
        assert_eq!(Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))), got[0].address);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = RecordStore::new("default", vec![], vec![]);
        store.set("example.com", a_record("example.com"));
        assert!(store.remove("example.com"));
        assert!(!store.remove("example.com"));
    }

    #[test]
    fn replace_is_atomic_substitution() {
        let mut store = RecordStore::new("default", vec![], vec![]);
        store.set("example.com", a_record("example.com"));
        store.set("example.com", a_record("example.com"));
        assert_eq!(2, store.get("example.com").len());

        store.replace("example.com", vec![a_record("example.com")]);
        assert_eq!(1, store.get("example.com").len());
    }

    #[test]
    fn encode_decode_round_trip_preserves_wire_bytes() {
        let record = a_record("example.com");
        let rr = record
            .to_resource_record(domain("example.com."), 300)
            .unwrap();
        match rr.rtype_with_data {
            RecordTypeWithData::A { address } => {
                assert_eq!(Ipv4Addr::new(203, 0, 113, 7), address);
            }
            other => panic!("unexpected record data: {other:?}"),
        }
    }

    #[test]
    fn forwarders_dedup_by_ip_port_zone() {
        let f = Forwarder {
            ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            port: 53,
            zone: String::new(),
        };
        let deduped = dedup_forwarders(vec![f.clone(), f.clone(), f]);
        assert_eq!(1, deduped.len());
    }
}
