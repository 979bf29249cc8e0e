//! Management protocol: a JSON-RPC 2.0 server over
//! newline-delimited JSON on its own lightweight task, never a worker.
//! Statistics methods post a snapshot request to every worker via a
//! `tokio::sync::oneshot` reply channel, await all replies, and reduce
//! them before responding.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::reload;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::stats::WorkerSnapshot;

/// One request to a worker's management inbox: take a statistics snapshot
/// and reply on the given channel.
pub struct SnapshotRequest {
    pub reply: oneshot::Sender<WorkerSnapshot>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    result: Value,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    jsonrpc: &'static str,
    error: RpcErrorBody,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i32,
    message: String,
}

/// Handle shared across connections: worker inboxes plus the live log
/// filter toggled by `debug_on`/`debug_off`.
pub struct ManagementState {
    worker_inboxes: Vec<mpsc::Sender<SnapshotRequest>>,
    filter_handle: Option<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl ManagementState {
    pub fn new(
        worker_inboxes: Vec<mpsc::Sender<SnapshotRequest>>,
        filter_handle: Option<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> ManagementState {
        ManagementState {
            worker_inboxes,
            filter_handle,
        }
    }

    async fn collect_snapshot(&self) -> WorkerSnapshot {
        let mut receivers = Vec::with_capacity(self.worker_inboxes.len());
        for inbox in &self.worker_inboxes {
            let (tx, rx) = oneshot::channel();
            if inbox.send(SnapshotRequest { reply: tx }).await.is_ok() {
                receivers.push(rx);
            }
        }
        let mut total = WorkerSnapshot::default();
        for rx in receivers {
            if let Ok(snapshot) = rx.await {
                total.merge(&snapshot);
            }
        }
        total
    }

    fn set_debug(&self, enabled: bool) -> Result<()> {
        let handle = self
            .filter_handle
            .as_ref()
            .ok_or_else(|| Error::new_rpc("debug toggling not configured"))?;
        let directive = if enabled { "debug" } else { "info" };
        handle
            .reload(EnvFilter::new(directive))
            .map_err(Error::new_rpc)
    }
}

pub async fn serve(listen: TcpListener, state: Arc<ManagementState>) -> Result<()> {
    loop {
        let (socket, _) = listen.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let _ = handle_connection(socket, state).await;
        });
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<ManagementState>) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, &state).await;
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

async fn dispatch(line: &str, state: &ManagementState) -> String {
    let req: RpcRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return serde_json::to_string(&RpcError {
                jsonrpc: "2.0",
                error: RpcErrorBody {
                    code: -32700,
                    message: format!("parse error: {e}"),
                },
                id: Value::Null,
            })
            .unwrap();
        }
    };

    let result = match req.method.as_str() {
        "debug_on" => state.set_debug(true).map(|_| Value::Bool(true)),
        "debug_off" => state.set_debug(false).map(|_| Value::Bool(true)),
        "summary_net_stats" => {
            let s = state.collect_snapshot().await;
            Ok(serde_json::json!({
                "connections_accepted": s.net.connections_accepted,
                "bytes_from_client": s.net.bytes_from_client,
                "bytes_to_client": s.net.bytes_to_client,
                "bytes_from_origin": s.net.bytes_from_origin,
                "bytes_to_origin": s.net.bytes_to_origin,
            }))
        }
        "summary_http_stats" => {
            let s = state.collect_snapshot().await;
            Ok(serde_json::json!({
                "requests_total": s.var.requests_total,
                "cache_hit": s.var.cache_hit,
                "cache_miss": s.var.cache_miss,
                "cache_csum_miss": s.var.cache_csum_miss,
                "blind_tunnel": s.var.blind_tunnel,
                "done_error": s.var.done_error,
                "done_unsupported": s.var.done_unsupported,
                "server_talks_first": s.var.server_talks_first,
            }))
        }
        "resp_size_http_stats" => {
            let s = state.collect_snapshot().await;
            Ok(serde_json::json!({ "buckets": s.resp_size.buckets() }))
        }
        "summary_cache_stats" | "detailed_cache_stats" | "summary_internal_cache_stats" => {
            let s = state.collect_snapshot().await;
            Ok(serde_json::json!({
                "bpctrl_entries": s.cache.bpctrl_entries,
                "compare_skip": s.cache.compare_skip,
                "compare_ok": s.cache.compare_ok,
                "compare_fail": s.cache.compare_fail,
                "bytes_compared": s.cache.bytes_compared,
            }))
        }
        other => Err(Error::new_rpc(format!("unknown method: {other}"))),
    };

    match result {
        Ok(value) => serde_json::to_string(&RpcResponse {
            jsonrpc: "2.0",
            result: value,
            id: req.id,
        })
        .unwrap(),
        Err(e) => serde_json::to_string(&RpcError {
            jsonrpc: "2.0",
            error: RpcErrorBody {
                code: -32000,
                message: e.to_string(),
            },
            id: req.id,
        })
        .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_reports_rpc_error() {
        let state = ManagementState::new(Vec::new(), None);
        let response = dispatch(r#"{"jsonrpc":"2.0","method":"bogus","id":1}"#, &state).await;
        assert!(response.contains("\"error\""));
    }

    #[tokio::test]
    async fn summary_http_stats_reduces_across_workers() {
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if let Some(req) = rx.recv().await {
                let mut snap = WorkerSnapshot::default();
                snap.var.requests_total = 5;
                let _ = req.reply.send(snap);
            }
        });
        let state = ManagementState::new(vec![tx], None);
        let response = dispatch(r#"{"jsonrpc":"2.0","method":"summary_http_stats","id":1}"#, &state).await;
        assert!(response.contains("\"requests_total\":5"));
    }
}
