//! HTTP JSON-RPC client for a Bitcoin full node.
//!
//! One pooled HTTP client with basic auth; a background monitor probes
//! the node and surfaces connection-health transitions as
//! [`UpstreamEvent`]s. Warm-up is recognized by the node's `-28` error
//! code.

use super::{RpcError, RpcResponse, UpstreamClient, UpstreamEvent};
use crate::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Size of the connection pool kept to the node.
const N_CLIENTS: usize = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// JSON-RPC error code bitcoind returns while loading the block index.
const RPC_IN_WARMUP: i64 = -28;

pub struct HttpUpstreamClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    events: broadcast::Sender<UpstreamEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HttpUpstreamClient {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(N_CLIENTS)
            .build()
            .context("building HTTP client")?;
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(Self {
            url: format!("http://{}:{}/", config.upstream_host, config.upstream_port),
            user: config.rpc_user.clone(),
            password: config.rpc_password.clone(),
            client,
            next_id: AtomicU64::new(0),
            events,
            monitor: Mutex::new(None),
        }))
    }

    /// Start the health probe. Emits `FirstGoodConnection` when the node
    /// first answers, `AllConnectionsLost` when it stops answering, and
    /// `InWarmup` while it is still loading.
    pub fn start_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut healthy = false;
            loop {
                match this.call("getblockchaininfo", Vec::new()).await {
                    Ok(_) => {
                        if !healthy {
                            healthy = true;
                            let _ = this.events.send(UpstreamEvent::FirstGoodConnection);
                        }
                    }
                    Err(RpcError::Rpc {
                        code: RPC_IN_WARMUP,
                        message,
                        ..
                    }) => {
                        let _ = this.events.send(UpstreamEvent::InWarmup(message));
                        if healthy {
                            healthy = false;
                            let _ = this.events.send(UpstreamEvent::AllConnectionsLost);
                        }
                    }
                    Err(e) => {
                        debug!("upstream probe failed: {}", e);
                        if healthy {
                            healthy = false;
                            let _ = this.events.send(UpstreamEvent::AllConnectionsLost);
                        }
                    }
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        });
        *self.monitor.lock().expect("monitor lock poisoned") = Some(handle);
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<RpcResponse, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport {
                id,
                message: e.to_string(),
            })?;
        let envelope: Value = response.json().await.map_err(|e| RpcError::Transport {
            id,
            message: format!("malformed response: {e}"),
        })?;

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Rpc {
                id,
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(RpcResponse {
            id,
            result: envelope.get("result").cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn submit(&self, method: &str, params: Vec<Value>) -> Result<RpcResponse, RpcError> {
        self.call(method, params).await
    }

    fn max_clients(&self) -> usize {
        N_CLIENTS
    }

    fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    async fn cleanup(&self) {
        if let Some(monitor) = self.monitor.lock().expect("monitor lock poisoned").take() {
            monitor.abort();
        }
    }

    fn stats_safe(&self) -> Value {
        json!({
            "url": self.url,
            "requests": self.next_id.load(Ordering::SeqCst),
        })
    }
}
