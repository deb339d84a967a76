//! The control channel: a local TCP listener accepting single-line
//! textual commands to reload the catalogue, preload a group, or
//! shut the server down.
//!
//! Collapsed to a single bidirectional connection per client rather
//! than the listen/reply socket pair: the server reads a line,
//! processes it, and writes the reply back on the same connection.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use dns_groups::group::GroupIndex;
use dns_groups::group_cache::GroupCache;

/// Run the control channel: accept connections on `listener` forever,
/// handling one command per connection.
pub async fn serve(listener: TcpListener, group_index: Arc<GroupIndex>, group_cache: Arc<GroupCache>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let group_index = group_index.clone();
                let group_cache = group_cache.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, &group_index, &group_cache).await {
                        tracing::warn!(?peer, ?error, "control channel connection error");
                    }
                });
            }
            Err(error) => tracing::warn!(?error, "control channel accept error"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    group_index: &GroupIndex,
    group_cache: &GroupCache,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(reply) = handle_command(&line, group_index, group_cache).await else {
            tracing::debug!(%line, "unrecognised control command, ignoring");
            continue;
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        if line.trim_start().starts_with("shutdown") {
            writer.flush().await?;
            tracing::info!("shutdown command received, exiting");
            std::process::exit(0);
        }
    }
    Ok(())
}

async fn handle_command(
    line: &str,
    group_index: &GroupIndex,
    group_cache: &GroupCache,
) -> Option<String> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "reload" => {
            let token = parts.next()?;
            match group_index.reload().await {
                Ok(()) => Some(format!("response ok {token}")),
                Err(error) => {
                    tracing::error!(?error, "catalogue reload failed");
                    Some(format!("response error {token}"))
                }
            }
        }
        "load" => {
            let group_id = parts.next()?;
            let token = parts.next()?;
            group_cache.invalidate(group_id);
            match group_cache.get(group_id).await {
                Ok(_) => Some(format!("response ok {token}")),
                Err(error) => {
                    tracing::error!(?error, group_id, "group preload failed");
                    Some(format!("response error {token}"))
                }
            }
        }
        "shutdown" => {
            let token = parts.next()?;
            Some(format!("response ok {token}"))
        }
        _ => None,
    }
}
