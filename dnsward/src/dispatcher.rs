//! The query dispatcher: the UDP listener's per-packet handler, and
//! the mutation interface shared by the control channel and the REST
//! admin API.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::UdpSocket;

use dns_groups::answer_cache::AnswerCache;
use dns_groups::correlation::CorrelationTable;
use dns_groups::error::Error;
use dns_groups::group::{Group, GroupIndex};
use dns_groups::group_cache::GroupCache;
use dns_groups::normalize::{domain_candidates, fingerprint, normalize_question_key, question_key};
use dns_groups::record::DnsRecord;
use dns_types::protocol::types::{DomainName, Message, Opcode, Question, Rcode};

use crate::metrics;

/// Everything the per-packet handler needs, bundled so it can be
/// cloned cheaply into each spawned task.
#[derive(Clone)]
pub struct Dispatcher {
    pub group_index: Arc<GroupIndex>,
    pub group_cache: Arc<GroupCache>,
    pub answer_cache: Arc<AnswerCache>,
    pub correlation: Arc<CorrelationTable>,
    socket: Arc<UdpSocket>,
    /// The question that was forwarded for a given fingerprint, kept
    /// only long enough to verify the forwarder's echoed question
    /// before trusting its answers.
    forwarded_questions: Arc<Mutex<HashMap<String, Question>>>,
}

fn hostname_key(name: &DomainName) -> String {
    let dotted = name.to_dotted_string();
    dotted.strip_suffix('.').unwrap_or(&dotted).to_string()
}

impl Dispatcher {
    pub fn new(
        group_index: Arc<GroupIndex>,
        group_cache: Arc<GroupCache>,
        answer_cache: Arc<AnswerCache>,
        correlation: Arc<CorrelationTable>,
        socket: Arc<UdpSocket>,
    ) -> Self {
        Dispatcher {
            group_index,
            group_cache,
            answer_cache,
            correlation,
            socket,
            forwarded_questions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The groups whose domain list matches any of `hostname`'s
    /// domain candidates, deduplicated by identifier.
    async fn matching_groups(&self, hostname: &str) -> Vec<Group> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for candidate in domain_candidates(hostname) {
            for group in self.group_index.get_by_domain(&candidate).await {
                if seen.insert(group.id.clone()) {
                    out.push(group);
                }
            }
        }
        out
    }

    async fn send(&self, bytes: Vec<u8>, addr: SocketAddr) {
        if let Err(error) = self.socket.send_to(&bytes, addr).await {
            tracing::debug!(?addr, ?error, "UDP send error");
        }
    }

    /// The listen loop: read datagrams and spawn a handler per
    /// packet. Runs until the socket errors out or the process
    /// exits.
    pub async fn listen(self: Arc<Self>) {
        let mut buf = vec![0u8; 512];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, peer)) => {
                    metrics::DNS_REQUESTS_TOTAL.inc();
                    let bytes = BytesMut::from(&buf[..size]);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_packet(&bytes, peer).await;
                    });
                }
                Err(error) => tracing::debug!(?error, "UDP recv error"),
            }
        }
    }

    async fn handle_packet(&self, buf: &[u8], peer: SocketAddr) {
        let message = match Message::from_octets(buf) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(?peer, ?error, "malformed DNS packet");
                return;
            }
        };

        if message.questions.is_empty() {
            tracing::debug!(?peer, "packet with no questions, discarding");
            return;
        }

        if message.header.is_response {
            self.handle_response(message).await;
        } else if message.header.opcode == Opcode::Standard {
            self.handle_query(message, peer).await;
        } else {
            tracing::debug!(?peer, opcode = ?message.header.opcode, "unsupported opcode, discarding");
        }
    }

    async fn handle_response(&self, message: Message) {
        metrics::FORWARDER_RESPONSES_TOTAL.inc();
        let fp = fingerprint(message.header.id);

        let Some(waiters) = self.correlation.remove(&fp) else {
            metrics::FORWARDER_RESPONSES_UNMATCHED_TOTAL.inc();
            tracing::debug!(%fp, "forwarder response with no waiting client, discarding");
            return;
        };
        metrics::CORRELATION_TABLE_SIZE.set(self.correlation.len() as i64);

        let expected = self.forwarded_questions.lock().unwrap().remove(&fp);
        let echoed_question = message.questions.first();
        let matches = match (&expected, echoed_question) {
            (Some(expected), Some(got)) => {
                expected.name == got.name && expected.qtype == got.qtype
            }
            _ => false,
        };
        if !matches {
            metrics::FORWARDER_RESPONSES_MISMATCHED_TOTAL.inc();
            tracing::warn!(%fp, "forwarder response echoed a different question, dropping");
            return;
        }

        let bytes = match message.clone().into_octets() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(?error, "could not re-serialise forwarder response");
                return;
            }
        };
        for addr in waiters {
            let this_bytes = bytes.clone();
            let socket = self.socket.clone();
            tokio::spawn(async move {
                if let Err(error) = socket.send_to(&this_bytes, addr).await {
                    tracing::debug!(?addr, ?error, "UDP send error");
                }
            });
        }
        metrics::DNS_RESPONSES_TOTAL.with_label_values(&["forwarder"]).inc();

        let Some(question) = echoed_question else {
            return;
        };
        let host = hostname_key(&question.name);
        let records: Vec<DnsRecord> = message
            .answers
            .iter()
            .filter_map(|rr| DnsRecord::from_resource_record(&host, rr.clone()).ok())
            .collect();

        let key = normalize_question_key(&question_key(question));
        self.answer_cache.set(&key, records.clone());

        for group in self.matching_groups(&question.name.to_dotted_string()).await {
            if let Ok(store) = self.group_cache.get(&group.id).await {
                let mut guard = store.lock().await;
                guard.replace(&host, records.clone());
                drop(guard);
                self.schedule_flush(group, store);
            }
        }
    }

    async fn handle_query(&self, message: Message, peer: SocketAddr) {
        let question = message.questions[0].clone();
        let raw_key = question_key(&question);
        let key = normalize_question_key(&raw_key);

        let cached = self.answer_cache.get(&key);
        if !cached.is_empty() {
            metrics::ANSWER_CACHE_HIT_TOTAL.inc();
            self.respond_with_records(&message, &question, cached, peer, false)
                .await;
            return;
        }
        metrics::ANSWER_CACHE_MISS_TOTAL.inc();

        let host = hostname_key(&question.name);
        let groups = self.matching_groups(&question.name.to_dotted_string()).await;

        let mut found_records = Vec::new();
        let mut forwarders = Vec::new();
        for group in &groups {
            if let Ok(store) = self.group_cache.get(&group.id).await {
                let guard = store.lock().await;
                found_records.extend(guard.get(&host));
                forwarders.extend(guard.forwarders().to_vec());
            }
        }
        let forwarders = dns_groups::record::dedup_forwarders(forwarders);

        if !found_records.is_empty() {
            metrics::RECORD_STORE_HIT_TOTAL.inc();
            self.answer_cache.set(&key, found_records.clone());
            self.respond_with_records(&message, &question, found_records, peer, true)
                .await;
            return;
        }

        if forwarders.is_empty() {
            metrics::DROPPED_TOTAL.inc();
            tracing::warn!(name = ?question.name, "no record and no forwarder, dropping query");
            return;
        }

        metrics::FORWARDED_TOTAL.inc();
        let fp = fingerprint(message.header.id);
        self.correlation.set(&fp, peer);
        metrics::CORRELATION_TABLE_SIZE.set(self.correlation.len() as i64);
        self.forwarded_questions
            .lock()
            .unwrap()
            .insert(fp, question.clone());

        let bytes = match message.clone().into_octets() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(?error, "could not re-serialise query for forwarding");
                return;
            }
        };
        for forwarder in forwarders {
            let addr = SocketAddr::new(forwarder.ip, forwarder.port);
            let socket = self.socket.clone();
            let this_bytes = bytes.clone();
            tokio::spawn(async move {
                if let Err(error) = socket.send_to(&this_bytes, addr).await {
                    tracing::debug!(?addr, ?error, "UDP send error forwarding query");
                }
            });
        }
    }

    async fn respond_with_records(
        &self,
        query: &Message,
        question: &Question,
        records: Vec<DnsRecord>,
        peer: SocketAddr,
        is_authoritative: bool,
    ) {
        let mut response = query.make_response();
        response.header.is_authoritative = is_authoritative;
        for record in records {
            match record.to_resource_record(question.name.clone(), record.ttl) {
                Ok(rr) => response.answers.push(rr),
                Err(error) => tracing::warn!(?error, "corrupt stored record, skipping"),
            }
        }
        if response.answers.is_empty() {
            response.header.rcode = Rcode::ServerFailure;
        }
        let source = if is_authoritative { "local" } else { "cache" };

        let mut bytes = None;
        loop {
            match response.clone().into_octets() {
                Ok(encoded) => {
                    bytes = Some(encoded);
                    break;
                }
                Err(dns_types::protocol::serialise::Error::TooLarge { size, limit }) => {
                    if !response.header.is_truncated {
                        tracing::debug!(name = ?question.name, size, limit, "response over the UDP size limit, truncating");
                    }
                    response.header.is_truncated = true;
                    if response.answers.pop().is_none() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(?error, "could not serialise response");
                    break;
                }
            }
        }
        let Some(bytes) = bytes else {
            return;
        };

        metrics::DNS_RESPONSES_TOTAL.with_label_values(&[source]).inc();
        self.send(bytes, peer).await;
    }

    fn schedule_flush(&self, group: Group, store: Arc<tokio::sync::Mutex<dns_groups::record::RecordStore>>) {
        let index = self.group_index.clone();
        tokio::spawn(async move {
            let snapshot = store.lock().await.clone();
            if let Err(error) = index.save_group(&snapshot, group).await {
                tracing::error!(?error, "could not flush group store");
            }
        });
    }

    /// Upsert `record` into the store(s) of every group whose domain
    /// list matches `key`'s domain candidates. If `old` is given, the
    /// record whose encoded form matches it is replaced in place.
    ///
    /// `client_ip` and `text_data` are carried through from the
    /// mutation request for parity with the original interface; the
    /// record store itself does not key on them.
    ///
    /// # Errors
    ///
    /// If no group matches, or the store cannot be loaded.
    pub async fn save(
        &self,
        key: &str,
        record: DnsRecord,
        client_ip: Option<std::net::IpAddr>,
        text_data: Option<String>,
        old: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        tracing::debug!(?client_ip, ?text_data, key, "save request");
        let groups = self.matching_groups(key).await;
        if groups.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        for group in groups {
            let store = self.group_cache.get(&group.id).await?;
            let mut guard = store.lock().await;
            let mut existing = guard.get(key);
            if let Some(old) = &old {
                if let Some(pos) = existing.iter().position(|r| &r.encoded == old) {
                    existing[pos] = record.clone();
                    guard.replace(key, existing);
                } else {
                    guard.set(key, record.clone());
                }
            } else {
                guard.set(key, record.clone());
            }
            drop(guard);
            self.schedule_flush(group, store);
        }
        Ok(())
    }

    /// Atomically replace all records under `key`, for every group
    /// whose domain list matches it.
    ///
    /// # Errors
    ///
    /// If no group matches, or the store cannot be loaded.
    pub async fn save_bulk(&self, key: &str, records: Vec<DnsRecord>) -> Result<(), Error> {
        let groups = self.matching_groups(key).await;
        if groups.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        for group in groups {
            let store = self.group_cache.get(&group.id).await?;
            let mut guard = store.lock().await;
            guard.replace(key, records.clone());
            drop(guard);
            self.schedule_flush(group, store);
        }
        Ok(())
    }

    /// Delete either a specific record (if `resource` is given) or
    /// the whole key, from every group whose domain list matches it.
    /// Returns `true` iff anything was removed.
    ///
    /// # Errors
    ///
    /// If the store cannot be loaded.
    pub async fn remove(&self, key: &str, resource: Option<Vec<u8>>) -> Result<bool, Error> {
        let groups = self.matching_groups(key).await;
        let mut removed_any = false;
        for group in groups {
            let store = self.group_cache.get(&group.id).await?;
            let mut guard = store.lock().await;
            let removed = if let Some(resource) = &resource {
                let mut existing = guard.get(key);
                let before = existing.len();
                existing.retain(|r| &r.encoded != resource);
                let changed = existing.len() != before;
                if changed {
                    guard.replace(key, existing);
                }
                changed
            } else {
                guard.remove(key)
            };
            removed_any |= removed;
            drop(guard);
            if removed {
                self.schedule_flush(group, store);
            }
        }
        Ok(removed_any)
    }

    /// A snapshot of all records across all currently loaded groups,
    /// as `(group id, hostname, record)` triples.
    pub async fn all(&self) -> Vec<(String, String, DnsRecord)> {
        let mut out = Vec::new();
        for group in self.group_index.list_groups().await {
            if let Ok(store) = self.group_cache.get(&group.id).await {
                let guard = store.lock().await;
                for host in guard.keys() {
                    for record in guard.get(&host) {
                        out.push((group.id.clone(), host.clone(), record));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr as StdSocketAddr};
    use std::time::Duration;

    use dns_types::protocol::types::{
        DomainName, QueryClass, QueryType, RecordClass, RecordType, RecordTypeWithData,
        ResourceRecord,
    };
    use tokio::time::timeout;

    fn domain(s: &str) -> DomainName {
        DomainName::from_dotted_string(s).unwrap()
    }

    fn a_question(name: &str, id: u16) -> Message {
        Message::from_question(
            id,
            Question {
                name: domain(name),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
    }

    fn a_record(hostname: &str, octets: [u8; 4]) -> DnsRecord {
        let rr = ResourceRecord {
            name: domain(&format!("{hostname}.")),
            rtype_with_data: RecordTypeWithData::A {
                address: Ipv4Addr::from(octets),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        DnsRecord::from_resource_record(hostname, rr).unwrap()
    }

    async fn temp_dispatcher(
        tag: &str,
        default_forwarders: Vec<dns_groups::record::Forwarder>,
    ) -> (Arc<Dispatcher>, std::path::PathBuf, SocketAddr) {
        let dir = std::env::temp_dir().join(format!(
            "dnsward-dispatcher-test-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        let group_index = Arc::new(GroupIndex::load(dir.clone(), default_forwarders).await.unwrap());
        let group_cache = Arc::new(GroupCache::new(group_index.clone()));
        let answer_cache = Arc::new(AnswerCache::new());
        let correlation = Arc::new(CorrelationTable::new());
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let addr = socket.local_addr().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            group_index,
            group_cache,
            answer_cache,
            correlation,
            socket,
        ));
        (dispatcher, dir, addr)
    }

    async fn client_socket() -> (UdpSocket, StdSocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn authoritative_a_record_is_answered_directly() {
        let (dispatcher, dir, _server_addr) = temp_dispatcher("a-record", Vec::new()).await;
        let store = dispatcher.group_cache.get("default").await.unwrap();
        store.lock().await.set("example.com", a_record("example.com", [203, 0, 113, 7]));

        let (client, client_addr) = client_socket().await;
        let query = a_question("example.com", 0x1234);
        dispatcher.handle_query(query, client_addr).await;

        let mut buf = [0u8; 512];
        let (size, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_octets(&buf[..size]).unwrap();
        assert!(response.header.is_response);
        assert_eq!(0x1234, response.header.id);
        assert_eq!(1, response.answers.len());
        match response.answers[0].rtype_with_data {
            RecordTypeWithData::A { address } => assert_eq!(Ipv4Addr::new(203, 0, 113, 7), address),
            ref other => panic!("unexpected answer: {other:?}"),
        }

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn oversized_answer_set_is_truncated_with_tc_bit_set() {
        let (dispatcher, dir, _server_addr) = temp_dispatcher("truncate", Vec::new()).await;
        let store = dispatcher.group_cache.get("default").await.unwrap();
        {
            let mut guard = store.lock().await;
            for i in 0..64u8 {
                guard.set("big.test", a_record("big.test", [203, 0, 113, i]));
            }
        }

        let (client, client_addr) = client_socket().await;
        let query = a_question("big.test", 0x4242);
        dispatcher.handle_query(query, client_addr).await;

        let mut buf = [0u8; 512];
        let (size, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(size <= 512);
        let response = Message::from_octets(&buf[..size]).unwrap();
        assert!(response.header.is_truncated);
        assert!(response.answers.len() < 64);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn unknown_name_is_forwarded_and_cached_then_served_from_cache() {
        // a fake forwarder the default group is configured to use
        let forwarder_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let forwarder_addr = forwarder_socket.local_addr().unwrap();
        let (dispatcher, dir, _server_addr) = temp_dispatcher(
            "forward-cache",
            vec![dns_groups::record::Forwarder {
                ip: forwarder_addr.ip(),
                port: forwarder_addr.port(),
                zone: String::new(),
            }],
        )
        .await;

        let (client, client_addr) = client_socket().await;
        let query = a_question("unknown.test", 0xbeef);
        dispatcher.handle_query(query.clone(), client_addr).await;

        // the forwarder should have received exactly the forwarded bytes
        let mut fwd_buf = [0u8; 512];
        let (size, _origin) = timeout(
            Duration::from_secs(1),
            forwarder_socket.recv_from(&mut fwd_buf),
        )
        .await
        .unwrap()
        .unwrap();
        let forwarded = Message::from_octets(&fwd_buf[..size]).unwrap();
        assert_eq!(0xbeef, forwarded.header.id);
        assert_eq!(query.questions, forwarded.questions);

        // the forwarder answers with one A record
        let mut answer = forwarded.make_response();
        answer.answers.push(ResourceRecord {
            name: domain("unknown.test."),
            rtype_with_data: RecordTypeWithData::A {
                address: Ipv4Addr::new(198, 51, 100, 9),
            },
            rclass: RecordClass::IN,
            ttl: 60,
        });
        let answer_bytes = answer.into_octets().unwrap();
        dispatcher.handle_response(Message::from_octets(&answer_bytes).unwrap()).await;

        let mut client_buf = [0u8; 512];
        let (size, _) = timeout(Duration::from_secs(1), client.recv_from(&mut client_buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_octets(&client_buf[..size]).unwrap();
        assert_eq!(1, response.answers.len());

        // S3: a second query for the same name is answered from the
        // answer cache, with no further forwarder traffic
        let (client2, client2_addr) = client_socket().await;
        let requery = a_question("unknown.test", 0xfeed);
        dispatcher.handle_query(requery, client2_addr).await;

        let mut client2_buf = [0u8; 512];
        let (size, _) = timeout(Duration::from_secs(1), client2.recv_from(&mut client2_buf))
            .await
            .unwrap()
            .unwrap();
        let cached_response = Message::from_octets(&client2_buf[..size]).unwrap();
        assert_eq!(1, cached_response.answers.len());

        assert!(timeout(Duration::from_millis(100), {
            let mut probe = [0u8; 512];
            async { forwarder_socket.recv_from(&mut probe).await }
        })
        .await
        .is_err());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn concurrent_clients_same_fingerprint_both_receive_the_answer() {
        let (dispatcher, dir, _server_addr) = temp_dispatcher("fan-out", Vec::new()).await;

        let (client_a, addr_a) = client_socket().await;
        let (client_b, addr_b) = client_socket().await;

        let fp = fingerprint(0x7777);
        dispatcher.correlation.set(&fp, addr_a);
        dispatcher.correlation.set(&fp, addr_b);
        dispatcher
            .forwarded_questions
            .lock()
            .unwrap()
            .insert(fp, a_question("shared.test", 0x7777).questions[0].clone());

        let mut answer = a_question("shared.test", 0x7777).make_response();
        answer.answers.push(ResourceRecord {
            name: domain("shared.test."),
            rtype_with_data: RecordTypeWithData::AAAA {
                address: Ipv6Addr::LOCALHOST,
            },
            rclass: RecordClass::IN,
            ttl: 60,
        });
        dispatcher.handle_response(answer).await;

        let mut buf_a = [0u8; 512];
        let (size_a, _) = timeout(Duration::from_secs(1), client_a.recv_from(&mut buf_a))
            .await
            .unwrap()
            .unwrap();
        let mut buf_b = [0u8; 512];
        let (size_b, _) = timeout(Duration::from_secs(1), client_b.recv_from(&mut buf_b))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf_a[..size_a], &buf_b[..size_b]);

        assert!(dispatcher.correlation.remove(&fingerprint(0x7777)).is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
