mod control;
mod dispatcher;
mod metrics;
mod rest;

use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use dns_groups::answer_cache::AnswerCache;
use dns_groups::correlation::CorrelationTable;
use dns_groups::group::GroupIndex;
use dns_groups::group_cache::GroupCache;
use dns_groups::record::Forwarder;

use dispatcher::Dispatcher;

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

/// Parse a `--forwarder <ip>;<port>;<zone>` flag into a `Forwarder`.
fn parse_forwarder(s: &str) -> Result<Forwarder, String> {
    let mut parts = s.splitn(3, ';');
    let ip: IpAddr = parts
        .next()
        .ok_or_else(|| "missing ip".to_string())?
        .parse()
        .map_err(|e| format!("invalid ip: {e}"))?;
    let port: u16 = parts
        .next()
        .ok_or_else(|| "missing port".to_string())?
        .parse()
        .map_err(|e| format!("invalid port: {e}"))?;
    let zone = parts.next().unwrap_or("").to_string();
    Ok(Forwarder { ip, port, zone })
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// A group-aware DNS server for home and office LANs.
///
/// dnsward answers queries from per-group record stores, forwards
/// anything it doesn't hold authoritatively, and caches forwarded
/// answers until their TTL expires.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}:{metrics_port}/metrics", and the
/// administrative REST API at
/// "http://{rest_interface}:{rest_port}/groups".
struct Args {
    /// Directory holding the group catalogue and record blobs
    #[clap(long, value_parser, default_value = "/var/lib/dnsward")]
    data_dir: std::path::PathBuf,

    /// Interface to listen on for DNS queries
    #[clap(long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    listen_ip: Ipv4Addr,

    /// Port to listen on for DNS queries
    #[clap(long, value_parser, default_value_t = 53)]
    listen_port: u16,

    /// Interface to listen on for the control channel
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    pipe_ip: Ipv4Addr,

    /// Port to listen on for the control channel
    #[clap(long, value_parser, default_value_t = 9421)]
    pipe_port: u16,

    /// Unused by the single-connection control channel; kept for
    /// compatibility with the original two-port CLI surface
    #[clap(long, value_parser, default_value_t = 9422)]
    pipe_reply_port: u16,

    /// Default group's forwarders, as `<ip>;<port>;<zone>`; may be
    /// given more than once
    #[clap(long, value_parser = parse_forwarder)]
    forwarder: Vec<Forwarder>,

    /// Interface to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    metrics_interface: Ipv4Addr,

    /// Port to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,

    /// Interface to listen on to serve the REST administrative API
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    rest_interface: Ipv4Addr,

    /// Port to listen on to serve the REST administrative API
    #[clap(long, value_parser, default_value_t = 9423)]
    rest_port: u16,

    /// How long, in seconds, a loaded group's record store stays
    /// cached before being reloaded from disk
    #[clap(long, value_parser, default_value_t = 300)]
    group_cache_size: u64,
}

async fn sweep_group_cache_task(group_cache: Arc<GroupCache>) {
    loop {
        sleep(Duration::from_secs(60 * 5)).await;
        let trimmed = group_cache.trim();
        if trimmed > 0 {
            metrics::GROUP_CACHE_TRIMMED_TOTAL.inc_by(trimmed as u64);
            tracing::info!(%trimmed, "trimmed group cache");
        }
    }
}

async fn sweep_answer_cache_task(answer_cache: Arc<AnswerCache>) {
    loop {
        sleep(Duration::from_secs(60 * 5)).await;
        let trimmed = answer_cache.trim();
        if trimmed > 0 {
            metrics::ANSWER_CACHE_TRIMMED_TOTAL.inc_by(trimmed as u64);
            tracing::info!(%trimmed, "trimmed answer cache");
        }
    }
}

async fn sweep_correlation_table_task(correlation: Arc<CorrelationTable>) {
    loop {
        sleep(Duration::from_secs(2)).await;
        let swept = correlation.sweep();
        if swept > 0 {
            metrics::CORRELATION_TABLE_SWEPT_TOTAL.inc_by(swept as u64);
        }
        metrics::CORRELATION_TABLE_SIZE.set(correlation.len() as i64);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    tracing::info!(data_dir = ?args.data_dir, "loading group catalogue");
    let group_index = match GroupIndex::load(args.data_dir.clone(), args.forwarder.clone()).await {
        Ok(index) => Arc::new(index),
        Err(error) => {
            tracing::error!(?error, "could not load group catalogue");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.listen_ip, port = %args.listen_port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((args.listen_ip, args.listen_port)).await {
        Ok(s) => Arc::new(s),
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    let group_cache = Arc::new(GroupCache::with_ttl(
        group_index.clone(),
        Duration::from_secs(args.group_cache_size),
    ));
    let answer_cache = Arc::new(AnswerCache::new());
    let correlation = Arc::new(CorrelationTable::new());

    let dispatcher = Arc::new(Dispatcher::new(
        group_index.clone(),
        group_cache.clone(),
        answer_cache.clone(),
        correlation.clone(),
        udp,
    ));

    tracing::info!(interface = %args.pipe_ip, port = %args.pipe_port, "binding control channel socket");
    match TcpListener::bind((args.pipe_ip, args.pipe_port)).await {
        Ok(listener) => {
            tokio::spawn(control::serve(listener, group_index.clone(), group_cache.clone()));
        }
        Err(error) => {
            tracing::error!(?error, "could not bind control channel socket, control channel disabled");
        }
    }

    tokio::spawn(sweep_group_cache_task(group_cache.clone()));
    tokio::spawn(sweep_answer_cache_task(answer_cache));
    tokio::spawn(sweep_correlation_table_task(correlation));

    tracing::info!(interface = %args.rest_interface, port = %args.rest_port, "binding REST admin HTTP socket");
    let rest_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(error) =
            rest::serve_rest_endpoint_task(args.rest_interface, args.rest_port, group_index, rest_dispatcher)
                .await
        {
            tracing::error!(?error, "REST admin HTTP server exited, REST admin API disabled");
        }
    });

    tracing::info!(interface = %args.metrics_interface, port = %args.metrics_port, "binding metrics HTTP socket");
    tokio::spawn(async move {
        if let Err(error) =
            metrics::serve_prometheus_endpoint_task(args.metrics_interface, args.metrics_port).await
        {
            tracing::error!(?error, "metrics HTTP server exited, metrics endpoint disabled");
        }
    });

    // The listen loop never returns under normal operation (transient
    // receive errors are logged and it keeps going); only a fatal
    // startup failure above, or the control channel's `shutdown`
    // command, ends the process.
    dispatcher.listen().await;
}
