//! Shared fixtures: a scripted upstream node, header-chain builders and
//! a recording server manager.

use async_trait::async_trait;
use serde_json::{json, Value};
use spv_node::store::hashing::{hash_rev, sha256d};
use spv_node::{
    RpcError, RpcResponse, ServerManager, UpstreamClient, UpstreamEvent, HEADER_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::broadcast;

static INIT_LOGGING: Once = Once::new();

/// Route controller logs through the test harness. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=spv_node=debug`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Raw blocks forming a linked header chain. Block `i` carries one
/// transaction with one input and one output.
pub fn build_chain(n: usize) -> Vec<Vec<u8>> {
    build_chain_salted(n, 0)
}

/// Like [`build_chain`], with `salt` mixed into every merkle root so two
/// chains with different salts share no headers.
pub fn build_chain_salted(n: usize, salt: u8) -> Vec<Vec<u8>> {
    let mut blocks = Vec::with_capacity(n);
    let mut prev = [0u8; 32];
    for i in 0..n {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&1u32.to_le_bytes()); // version
        header.extend_from_slice(&prev);
        let mut merkle = [0u8; 32];
        merkle[0] = i as u8;
        merkle[1] = (i >> 8) as u8;
        merkle[2] = salt;
        header.extend_from_slice(&merkle);
        header.extend_from_slice(&1231006505u32.to_le_bytes()); // time
        header.extend_from_slice(&0x1d00ffffu32.to_le_bytes()); // bits
        header.extend_from_slice(&(i as u32).to_le_bytes()); // nonce
        prev = sha256d(&header);

        let mut raw = header;
        raw.push(1); // tx count
        raw.extend_from_slice(&1u32.to_le_bytes()); // tx version
        raw.push(1); // input count
        raw.extend_from_slice(&[0u8; 36]); // outpoint
        raw.push(0); // script length
        raw.extend_from_slice(&0xffffffffu32.to_le_bytes()); // sequence
        raw.push(1); // output count
        raw.extend_from_slice(&5000u64.to_le_bytes()); // value
        raw.push(0); // script length
        raw.extend_from_slice(&0u32.to_le_bytes()); // lock time
        blocks.push(raw);
    }
    blocks
}

pub fn header_of(raw: &[u8]) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&raw[..HEADER_SIZE]);
    header
}

pub fn block_hash_hex(raw: &[u8]) -> String {
    hex::encode(hash_rev(&raw[..HEADER_SIZE]))
}

pub fn chain_info_value(chain: &str, blocks: i64, ibd: bool, best_hash_hex: &str) -> Value {
    json!({
        "chain": chain,
        "blocks": blocks,
        "headers": blocks,
        "bestblockhash": best_hash_hex,
        "difficulty": 1.0,
        "mediantime": 1231006505,
        "verificationprogress": 1.0,
        "initialblockdownload": ibd,
        "chainwork": "0000000000000000000000000000000000000000000000000000000100010001",
        "size_on_disk": 285, "pruned": false, "warnings": ""
    })
}

/// Upstream node whose responses are scripted by the test.
pub struct ScriptedUpstream {
    next_id: AtomicU64,
    chain_infos: Mutex<Vec<Value>>,
    info_cursor: AtomicUsize,
    block_hashes: Mutex<HashMap<u64, String>>,
    blocks: Mutex<HashMap<String, String>>,
    block_delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    events: broadcast::Sender<UpstreamEvent>,
    max_clients: usize,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            chain_infos: Mutex::new(Vec::new()),
            info_cursor: AtomicUsize::new(0),
            block_hashes: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            block_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
            max_clients: 3,
        })
    }

    /// Queue a `getblockchaininfo` response. The last queued response
    /// repeats for every poll after it.
    pub fn push_chain_info(&self, value: Value) {
        self.chain_infos.lock().unwrap().push(value);
    }

    /// Serve `raw` at `height`, reporting its real header hash.
    pub fn add_block(&self, height: u64, raw: &[u8]) {
        let hash = block_hash_hex(raw);
        self.block_hashes.lock().unwrap().insert(height, hash.clone());
        self.blocks.lock().unwrap().insert(hash, hex::encode(raw));
    }

    /// Serve `raw` at `height` but report `hash_hex` from `getblockhash`.
    pub fn add_block_with_hash(&self, height: u64, raw: &[u8], hash_hex: &str) {
        self.block_hashes
            .lock()
            .unwrap()
            .insert(height, hash_hex.to_string());
        self.blocks
            .lock()
            .unwrap()
            .insert(hash_hex.to_string(), hex::encode(raw));
    }

    /// Delay the `getblock` reply for the block at `height`.
    pub fn delay_block(&self, height: u64, delay: Duration) {
        let hash = self
            .block_hashes
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .expect("delay_block: height not scripted");
        self.block_delays.lock().unwrap().insert(hash, delay);
    }

    pub fn fire_first_good_connection(&self) {
        let _ = self.events.send(UpstreamEvent::FirstGoodConnection);
    }

    pub fn fire_all_connections_lost(&self) {
        let _ = self.events.send(UpstreamEvent::AllConnectionsLost);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn submit(&self, method: &str, params: Vec<Value>) -> Result<RpcResponse, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().unwrap().push(method.to_string());

        match method {
            "getblockchaininfo" => {
                let infos = self.chain_infos.lock().unwrap();
                if infos.is_empty() {
                    return Err(RpcError::Transport {
                        id,
                        message: "no chain info scripted".into(),
                    });
                }
                let cursor = self.info_cursor.fetch_add(1, Ordering::SeqCst);
                let result = infos[cursor.min(infos.len() - 1)].clone();
                Ok(RpcResponse { id, result })
            }
            "getblockhash" => {
                let height = params
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or(RpcError::Rpc {
                        id,
                        code: -8,
                        message: "invalid height".into(),
                    })?;
                match self.block_hashes.lock().unwrap().get(&height) {
                    Some(hash) => Ok(RpcResponse {
                        id,
                        result: json!(hash),
                    }),
                    None => Err(RpcError::Rpc {
                        id,
                        code: -8,
                        message: "block height out of range".into(),
                    }),
                }
            }
            "getblock" => {
                let hash = params
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let delay = self.block_delays.lock().unwrap().get(&hash).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match self.blocks.lock().unwrap().get(&hash) {
                    Some(raw) => Ok(RpcResponse {
                        id,
                        result: json!(raw),
                    }),
                    None => Err(RpcError::Rpc {
                        id,
                        code: -5,
                        message: "block not found".into(),
                    }),
                }
            }
            _ => Err(RpcError::Rpc {
                id,
                code: -32601,
                message: format!("method not found: {method}"),
            }),
        }
    }

    fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }

    fn stats_safe(&self) -> Value {
        json!({ "requests": self.calls.lock().unwrap().len() })
    }
}

/// Server manager that records startup calls instead of binding sockets.
#[derive(Default)]
pub struct RecordingServerManager {
    pub started: AtomicUsize,
    pub fail_startup: bool,
}

impl RecordingServerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            fail_startup: true,
        })
    }

    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl ServerManager for RecordingServerManager {
    fn startup(&self) -> anyhow::Result<()> {
        if self.fail_startup {
            anyhow::bail!("address already in use");
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) {}

    fn stats_safe(&self) -> Value {
        json!({ "clients": 0 })
    }
}
