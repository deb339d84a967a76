//! Prometheus registry and the `/metrics` HTTP endpoint.

use actix_web::{get, http::header::ContentType, App, HttpResponse, HttpServer, Responder};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge, TextEncoder,
};
use std::net::Ipv4Addr;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounter =
        register_int_counter!("dnsward_dns_requests_total", "DNS queries received").unwrap();
    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsward_dns_responses_total",
        "DNS responses sent, by source",
        &["source"]
    )
    .unwrap();
    pub static ref ANSWER_CACHE_HIT_TOTAL: IntCounter = register_int_counter!(
        "dnsward_answer_cache_hit_total",
        "Queries answered from the answer cache"
    )
    .unwrap();
    pub static ref ANSWER_CACHE_MISS_TOTAL: IntCounter = register_int_counter!(
        "dnsward_answer_cache_miss_total",
        "Queries not found in the answer cache"
    )
    .unwrap();
    pub static ref RECORD_STORE_HIT_TOTAL: IntCounter = register_int_counter!(
        "dnsward_record_store_hit_total",
        "Queries answered from a group's record store"
    )
    .unwrap();
    pub static ref FORWARDED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_forwarded_total",
        "Queries forwarded upstream"
    )
    .unwrap();
    pub static ref DROPPED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_dropped_total",
        "Queries dropped with no forwarder available"
    )
    .unwrap();
    pub static ref FORWARDER_RESPONSES_TOTAL: IntCounter = register_int_counter!(
        "dnsward_forwarder_responses_total",
        "Responses received from forwarders"
    )
    .unwrap();
    pub static ref FORWARDER_RESPONSES_UNMATCHED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_forwarder_responses_unmatched_total",
        "Forwarder responses with no waiting correlation entry"
    )
    .unwrap();
    pub static ref FORWARDER_RESPONSES_MISMATCHED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_forwarder_responses_mismatched_total",
        "Forwarder responses whose echoed question did not match and were dropped"
    )
    .unwrap();
    pub static ref CORRELATION_TABLE_SIZE: IntGauge = register_int_gauge!(
        "dnsward_correlation_table_size",
        "Number of in-flight correlation entries"
    )
    .unwrap();
    pub static ref GROUP_CACHE_TRIMMED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_group_cache_trimmed_total",
        "Group cache entries evicted by the sweeper"
    )
    .unwrap();
    pub static ref ANSWER_CACHE_TRIMMED_TOTAL: IntCounter = register_int_counter!(
        "dnsward_answer_cache_trimmed_total",
        "Answer cache keys evicted by the sweeper"
    )
    .unwrap();
    pub static ref CORRELATION_TABLE_SWEPT_TOTAL: IntCounter = register_int_counter!(
        "dnsward_correlation_table_swept_total",
        "Correlation entries purged by the sweeper for exceeding the TTL"
    )
    .unwrap();
}

#[get("/metrics")]
async fn get_metrics() -> impl Responder {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => HttpResponse::Ok()
            .content_type(ContentType::plaintext())
            .body(metrics_str),
        Err(err) => {
            tracing::error!(?err, "could not serialise metrics");
            HttpResponse::InternalServerError()
                .content_type(ContentType::plaintext())
                .body(err.to_string())
        }
    }
}

pub async fn serve_prometheus_endpoint_task(address: Ipv4Addr, port: u16) -> std::io::Result<()> {
    HttpServer::new(|| App::new().service(get_metrics))
        .bind((address, port))?
        .run()
        .await
}
