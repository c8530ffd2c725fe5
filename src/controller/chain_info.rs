//! Chain-tip snapshot task.
//!
//! One-shot `getblockchaininfo` request whose parsed result drives the
//! controller's next state.

use super::TaskCtx;
use crate::task::TaskCore;
use crate::upstream::{RpcResponse, UpstreamClient};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Snapshot of the upstream node's view of its chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    /// Header count as reported, -1 when absent.
    pub headers: i64,
    pub best_block_hash: [u8; 32],
    pub difficulty: f64,
    pub median_time_past: i64,
    pub verification_progress: f64,
    pub initial_block_download: bool,
    /// Decoded chain work, at most 32 bytes.
    pub chain_work: Vec<u8>,
    pub size_on_disk: u64,
    pub pruned: bool,
    pub warnings: String,
}

impl fmt::Display for ChainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ChainInfo chain: \"{}\" blocks: {} headers: {} bestBlockHash: {} \
             difficulty: {:.9} mtp: {} verificationProgress: {:.6} ibd: {} chainWork: {} \
             sizeOnDisk: {} pruned: {} warnings: \"{}\")",
            self.chain,
            self.blocks,
            self.headers,
            hex::encode(self.best_block_hash),
            self.difficulty,
            self.median_time_past,
            self.verification_progress,
            self.initial_block_download,
            hex::encode(&self.chain_work),
            self.size_on_disk,
            self.pruned,
            self.warnings,
        )
    }
}

/// Parse a `getblockchaininfo` result. `blocks`, `chain`,
/// `bestblockhash` and `initialblockdownload` are mandatory; everything
/// else defaults on failure. The error is the name of the offending
/// field.
fn parse_chain_info(resp: &RpcResponse) -> Result<ChainInfo, &'static str> {
    let map = resp
        .result
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or("response; expected map")?;

    let blocks = map
        .get("blocks")
        .and_then(Value::as_i64)
        .filter(|b| *b >= 0)
        .ok_or("blocks")? as u64;

    let chain = map
        .get("chain")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or("chain")?
        .to_string();

    let headers = map.get("headers").and_then(Value::as_i64).unwrap_or(-1);

    let best_block_hash: [u8; 32] = map
        .get("bestblockhash")
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
        .and_then(|b| b.try_into().ok())
        .ok_or("bestblockhash")?;

    let initial_block_download = map
        .get("initialblockdownload")
        .and_then(Value::as_bool)
        .ok_or("initialblockdownload")?;

    let chain_work = map
        .get("chainwork")
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
        .filter(|b| b.len() <= 32)
        .unwrap_or_default();

    let warnings = match map.get("warnings") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    };

    Ok(ChainInfo {
        chain,
        blocks,
        headers,
        best_block_hash,
        difficulty: map.get("difficulty").and_then(Value::as_f64).unwrap_or(0.0),
        median_time_past: map.get("mediantime").and_then(Value::as_i64).unwrap_or(0),
        verification_progress: map
            .get("verificationprogress")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        initial_block_download,
        chain_work,
        size_on_disk: map.get("size_on_disk").and_then(Value::as_u64).unwrap_or(0),
        pruned: map.get("pruned").and_then(Value::as_bool).unwrap_or(false),
        warnings,
    })
}

/// Task wrapper around the one-shot request. The parsed result is
/// drained by the supervisor after the success event.
pub struct ChainInfoTask {
    core: Arc<TaskCore>,
    info: Mutex<Option<ChainInfo>>,
}

impl ChainInfoTask {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(TaskCore::new("Task.GetChainInfo")),
            info: Mutex::new(None),
        })
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    pub(crate) fn take_info(&self) -> Option<ChainInfo> {
        self.info.lock().expect("info lock poisoned").take()
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        upstream: Arc<dyn UpstreamClient>,
        ctx: Arc<TaskCtx>,
        cancel: CancellationToken,
    ) {
        ctx.started();
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = upstream.submit("getblockchaininfo", Vec::new()) => match res {
                Err(e) => {
                    warn!("getblockchaininfo: error response: {}", e);
                    let code = e.task_error_code();
                    let message = e.message().to_string();
                    ctx.errored_with(|| self.core.set_error(code, message));
                }
                Ok(resp) => match parse_chain_info(&resp) {
                    Err(field) => {
                        let message = format!("Failed to parse {field}");
                        error!("INTERNAL ERROR: {}", message);
                        let id = resp.id as i64;
                        ctx.errored_with(|| self.core.set_error(id, message));
                    }
                    Ok(info) => {
                        debug!("{}", info);
                        *self.info.lock().expect("info lock poisoned") = Some(info);
                        ctx.success();
                    }
                },
            }
        }
        ctx.finished();
    }
}
