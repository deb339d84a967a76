//! The REST administrative API: a thin JSON translation layer over
//! the group index and the dispatcher's mutation interface.

use std::net::{IpAddr, Ipv4Addr};

use actix_web::{delete, get, post, put, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};

use dns_groups::error::Error;
use dns_groups::group::GroupIndex;
use dns_groups::record::{DnsRecord, Forwarder, RecordKind};
use dns_types::protocol::types::{RecordClass, RecordTypeWithData, ResourceRecord};

use crate::dispatcher::Dispatcher;

#[derive(Clone)]
struct AppState {
    group_index: std::sync::Arc<GroupIndex>,
    dispatcher: std::sync::Arc<Dispatcher>,
}

fn error_response(error: &Error) -> HttpResponse {
    match error {
        Error::AlreadyExists(_) => HttpResponse::Conflict().json(ErrorBody::new(error)),
        Error::NotFound(_) => HttpResponse::NotFound().json(ErrorBody::new(error)),
        Error::TypeNotSupported(_) | Error::InvalidAddress(_) => {
            HttpResponse::BadRequest().json(ErrorBody::new(error))
        }
        Error::Io(_) | Error::Encode(_) | Error::Yaml(_) | Error::Wire(_) => {
            HttpResponse::InternalServerError().json(ErrorBody::new(error))
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ErrorBody {
    fn new(error: &Error) -> Self {
        ErrorBody {
            error: error.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GroupBody {
    id: String,
    name: String,
    #[serde(rename = "numberOfRecords")]
    num_records: usize,
    domains: Vec<String>,
    forwarders: Vec<ForwarderBody>,
}

#[derive(Serialize, Deserialize)]
struct ForwarderBody {
    ip: IpAddr,
    port: u16,
    zone: String,
}

impl From<Forwarder> for ForwarderBody {
    fn from(f: Forwarder) -> Self {
        ForwarderBody {
            ip: f.ip,
            port: f.port,
            zone: f.zone,
        }
    }
}

impl From<ForwarderBody> for Forwarder {
    fn from(f: ForwarderBody) -> Self {
        Forwarder {
            ip: f.ip,
            port: f.port,
            zone: f.zone,
        }
    }
}

impl From<dns_groups::group::Group> for GroupBody {
    fn from(g: dns_groups::group::Group) -> Self {
        GroupBody {
            id: g.id,
            name: g.name,
            num_records: g.num_records,
            domains: g.domains,
            forwarders: g.forwarders.into_iter().map(ForwarderBody::from).collect(),
        }
    }
}

#[get("/groups")]
async fn list_groups(state: web::Data<AppState>) -> HttpResponse {
    let groups: Vec<GroupBody> = state
        .group_index
        .list_groups()
        .await
        .into_iter()
        .map(GroupBody::from)
        .collect();
    HttpResponse::Ok().json(groups)
}

#[derive(Serialize, Deserialize)]
struct CreateGroupBody {
    name: String,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    forwarders: Vec<ForwarderBody>,
}

#[post("/groups")]
async fn create_group(state: web::Data<AppState>, body: web::Json<CreateGroupBody>) -> HttpResponse {
    let body = body.into_inner();
    let forwarders = body.forwarders.into_iter().map(Forwarder::from).collect();
    match state
        .group_index
        .create(&body.name, body.domains, forwarders)
        .await
    {
        Ok((group, _store)) => HttpResponse::Ok().json(GroupBody::from(group)),
        Err(error) => error_response(&error),
    }
}

#[get("/groups/{id}")]
async fn get_group(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.group_index.get_by_id(&path).await {
        Some(group) => HttpResponse::Ok().json(GroupBody::from(group)),
        None => error_response(&Error::NotFound(path.into_inner())),
    }
}

#[delete("/groups/{id}")]
async fn delete_group(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.group_index.delete(&path).await {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(error) => error_response(&error),
    }
}

#[derive(Serialize, Deserialize)]
struct RecordBody {
    hostname: String,
    #[serde(rename = "type")]
    record_type: String,
    value: String,
    ttl: u32,
}

fn record_kind_name(kind: RecordKind) -> String {
    match kind {
        RecordKind::A => "A".to_string(),
        RecordKind::Ns => "NS".to_string(),
        RecordKind::Cname => "CNAME".to_string(),
        RecordKind::Soa => "SOA".to_string(),
        RecordKind::Ptr => "PTR".to_string(),
        RecordKind::Mx => "MX".to_string(),
        RecordKind::Aaaa => "AAAA".to_string(),
        RecordKind::Srv => "SRV".to_string(),
        RecordKind::Txt => "TXT".to_string(),
        RecordKind::Other(n) => n.to_string(),
    }
}

fn record_body(host: &str, record: &DnsRecord) -> RecordBody {
    let value = record
        .address
        .map(|a| a.to_string())
        .or_else(|| record.text.clone())
        .unwrap_or_default();
    RecordBody {
        hostname: host.to_string(),
        record_type: record_kind_name(record.record_type),
        value,
        ttl: record.ttl,
    }
}

#[get("/groups/{id}/records")]
async fn get_group_records(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let group_id = path.into_inner();
    if state.group_index.get_by_id(&group_id).await.is_none() {
        return error_response(&Error::NotFound(group_id));
    }
    let store = match state.dispatcher.group_cache.get(&group_id).await {
        Ok(store) => store,
        Err(error) => return error_response(&error),
    };
    let guard = store.lock().await;
    let mut out = Vec::new();
    for host in guard.keys() {
        for record in guard.get(&host) {
            out.push(record_body(&host, &record));
        }
    }
    HttpResponse::Ok().json(out)
}

#[derive(Serialize, Deserialize)]
struct SaveRecordBody {
    hostname: String,
    #[serde(rename = "type")]
    record_type: String,
    value: String,
    #[serde(default = "default_ttl")]
    ttl: u32,
    #[serde(rename = "address", default)]
    client_ip: Option<IpAddr>,
    #[serde(rename = "recordData", default)]
    text_data: Option<String>,
}

fn default_ttl() -> u32 {
    300
}

fn build_resource_record(
    hostname: &str,
    record_type: &str,
    value: &str,
    ttl: u32,
) -> Result<ResourceRecord, Error> {
    let name = dns_types::protocol::types::DomainName::from_dotted_string(&format!("{hostname}."))
        .ok_or_else(|| Error::InvalidAddress(hostname.to_string()))?;
    let rtype_with_data = match record_type.to_ascii_uppercase().as_str() {
        "A" => {
            let address: std::net::Ipv4Addr = value
                .parse()
                .map_err(|_| Error::InvalidAddress(value.to_string()))?;
            RecordTypeWithData::A { address }
        }
        "AAAA" => {
            let address: std::net::Ipv6Addr = value
                .parse()
                .map_err(|_| Error::InvalidAddress(value.to_string()))?;
            RecordTypeWithData::AAAA { address }
        }
        "CNAME" => {
            let cname = dns_types::protocol::types::DomainName::from_dotted_string(value)
                .ok_or_else(|| Error::InvalidAddress(value.to_string()))?;
            RecordTypeWithData::CNAME { cname }
        }
        "TXT" => RecordTypeWithData::TXT {
            octets: value.as_bytes().to_vec(),
        },
        other => return Err(Error::TypeNotSupported(other.to_string())),
    };
    Ok(ResourceRecord {
        name,
        rtype_with_data,
        rclass: RecordClass::IN,
        ttl,
    })
}

#[post("/groups/{id}/records")]
async fn save_record(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SaveRecordBody>,
) -> HttpResponse {
    let group_id = path.into_inner();
    if state.group_index.get_by_id(&group_id).await.is_none() {
        return error_response(&Error::NotFound(group_id));
    }
    let body = body.into_inner();
    let rr = match build_resource_record(&body.hostname, &body.record_type, &body.value, body.ttl) {
        Ok(rr) => rr,
        Err(error) => return error_response(&error),
    };
    let record = match DnsRecord::from_resource_record(&body.hostname, rr) {
        Ok(record) => record,
        Err(error) => return error_response(&error),
    };
    match state
        .dispatcher
        .save(&body.hostname, record, body.client_ip, body.text_data.clone(), None)
        .await
    {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(error) => error_response(&error),
    }
}

#[derive(Deserialize)]
struct BulkRecordEntry {
    #[serde(rename = "type")]
    record_type: String,
    value: String,
    #[serde(default = "default_ttl")]
    ttl: u32,
}

#[put("/groups/{id}/records/{host}")]
async fn replace_records(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<Vec<BulkRecordEntry>>,
) -> HttpResponse {
    let (group_id, host) = path.into_inner();
    if state.group_index.get_by_id(&group_id).await.is_none() {
        return error_response(&Error::NotFound(group_id));
    }
    let mut records = Vec::new();
    for entry in body.into_inner() {
        let rr = match build_resource_record(&host, &entry.record_type, &entry.value, entry.ttl) {
            Ok(rr) => rr,
            Err(error) => return error_response(&error),
        };
        match DnsRecord::from_resource_record(&host, rr) {
            Ok(record) => records.push(record),
            Err(error) => return error_response(&error),
        }
    }
    match state.dispatcher.save_bulk(&host, records).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(error) => error_response(&error),
    }
}

#[delete("/groups/{id}/records/{host}")]
async fn remove_records(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (group_id, host) = path.into_inner();
    if state.group_index.get_by_id(&group_id).await.is_none() {
        return error_response(&Error::NotFound(group_id));
    }
    match state.dispatcher.remove(&host, None).await {
        Ok(removed) => HttpResponse::Ok().json(removed),
        Err(error) => error_response(&error),
    }
}

#[get("/records")]
async fn all_records(state: web::Data<AppState>) -> HttpResponse {
    let out: Vec<RecordBody> = state
        .dispatcher
        .all()
        .await
        .into_iter()
        .map(|(_group, host, record)| record_body(&host, &record))
        .collect();
    HttpResponse::Ok().json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::{call_service, init_service, read_body_json, TestRequest};
    use dns_groups::answer_cache::AnswerCache;
    use dns_groups::correlation::CorrelationTable;
    use dns_groups::group_cache::GroupCache;
    use std::net::Ipv4Addr;

    async fn temp_state(tag: &str) -> (AppState, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "dnsward-rest-test-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        let group_index = std::sync::Arc::new(GroupIndex::load(dir.clone(), Vec::new()).await.unwrap());
        let group_cache = std::sync::Arc::new(GroupCache::new(group_index.clone()));
        let answer_cache = std::sync::Arc::new(AnswerCache::new());
        let correlation = std::sync::Arc::new(CorrelationTable::new());
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let dispatcher = std::sync::Arc::new(crate::dispatcher::Dispatcher::new(
            group_index.clone(),
            group_cache,
            answer_cache,
            correlation,
            std::sync::Arc::new(socket),
        ));
        (
            AppState {
                group_index,
                dispatcher,
            },
            dir,
        )
    }

    #[actix_web::test]
    async fn list_groups_starts_with_only_the_default_group() {
        let (state, dir) = temp_state("list").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(list_groups),
        )
        .await;
        let req = TestRequest::get().uri("/groups").to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());
        let groups: Vec<GroupBody> = read_body_json(resp).await;
        assert_eq!(1, groups.len());
        assert_eq!("default", groups[0].id);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[actix_web::test]
    async fn create_then_get_then_delete_group_round_trips() {
        let (state, dir) = temp_state("crud").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(create_group)
                .service(get_group)
                .service(delete_group),
        )
        .await;

        let req = TestRequest::post()
            .uri("/groups")
            .set_json(CreateGroupBody {
                name: "LAN Group".to_string(),
                domains: vec!["lan.corp".to_string()],
                forwarders: vec![],
            })
            .to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());
        let created: GroupBody = read_body_json(resp).await;
        assert_eq!("lan-group", created.id);
        assert_eq!(vec!["lan.corp".to_string()], created.domains);

        let req = TestRequest::get().uri("/groups/lan-group").to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = TestRequest::delete().uri("/groups/lan-group").to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = TestRequest::get().uri("/groups/lan-group").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(404, resp.status().as_u16());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[actix_web::test]
    async fn deleting_the_default_group_is_rejected() {
        let (state, dir) = temp_state("delete-default").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(delete_group),
        )
        .await;
        let req = TestRequest::delete().uri("/groups/default").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(404, resp.status().as_u16());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[actix_web::test]
    async fn save_record_then_list_records_round_trips() {
        let (state, dir) = temp_state("save-record").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(save_record)
                .service(get_group_records),
        )
        .await;

        let req = TestRequest::post()
            .uri("/groups/default/records")
            .set_json(SaveRecordBody {
                hostname: "example.com".to_string(),
                record_type: "A".to_string(),
                value: "203.0.113.7".to_string(),
                ttl: 300,
                client_ip: None,
                text_data: None,
            })
            .to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = TestRequest::get()
            .uri("/groups/default/records")
            .to_request();
        let resp = call_service(&app, req).await;
        let records: Vec<RecordBody> = read_body_json(resp).await;
        assert_eq!(1, records.len());
        assert_eq!("example.com", records[0].hostname);
        assert_eq!("A", records[0].record_type);
        assert_eq!("203.0.113.7", records[0].value);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[actix_web::test]
    async fn save_record_with_unsupported_type_is_a_bad_request() {
        let (state, dir) = temp_state("unsupported-type").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(save_record),
        )
        .await;
        let req = TestRequest::post()
            .uri("/groups/default/records")
            .set_json(SaveRecordBody {
                hostname: "example.com".to_string(),
                record_type: "SRV".to_string(),
                value: "anything".to_string(),
                ttl: 300,
                client_ip: None,
                text_data: None,
            })
            .to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(400, resp.status().as_u16());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[actix_web::test]
    async fn remove_records_is_idempotent() {
        let (state, dir) = temp_state("remove-idempotent").await;
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(save_record)
                .service(remove_records),
        )
        .await;

        let req = TestRequest::post()
            .uri("/groups/default/records")
            .set_json(SaveRecordBody {
                hostname: "example.com".to_string(),
                record_type: "A".to_string(),
                value: "203.0.113.7".to_string(),
                ttl: 300,
                client_ip: None,
                text_data: None,
            })
            .to_request();
        call_service(&app, req).await;

        let req = TestRequest::delete()
            .uri("/groups/default/records/example.com")
            .to_request();
        let resp = call_service(&app, req).await;
        let removed: bool = read_body_json(resp).await;
        assert!(removed);

        let req = TestRequest::delete()
            .uri("/groups/default/records/example.com")
            .to_request();
        let resp = call_service(&app, req).await;
        let removed_again: bool = read_body_json(resp).await;
        assert!(!removed_again);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

pub async fn serve_rest_endpoint_task(
    address: Ipv4Addr,
    port: u16,
    group_index: std::sync::Arc<GroupIndex>,
    dispatcher: std::sync::Arc<Dispatcher>,
) -> std::io::Result<()> {
    let state = AppState {
        group_index,
        dispatcher,
    };
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(list_groups)
            .service(create_group)
            .service(get_group)
            .service(delete_group)
            .service(get_group_records)
            .service(save_record)
            .service(replace_records)
            .service(remove_records)
            .service(all_records)
    })
    .bind((address, port))?
    .run()
    .await
}
