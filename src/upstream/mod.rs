//! Upstream node contract.
//!
//! The controller talks to one Bitcoin full node over JSON-RPC 2.0. The
//! transport itself lives behind [`UpstreamClient`]; the controller only
//! sees request submission, typed failures and connection-health events.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// A successful JSON-RPC reply. The id assigned at submission is echoed
/// back so callers can attribute responses.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Value,
}

/// Failure delivering or executing a request.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code} for request {id}: {message}")]
    Rpc { id: u64, code: i64, message: String },
    /// The request never produced a reply (connection loss, timeout,
    /// malformed envelope).
    #[error("transport failure for request {id}: {message}")]
    Transport { id: u64, message: String },
}

impl RpcError {
    /// The id of the request this failure belongs to.
    pub fn id(&self) -> u64 {
        match self {
            RpcError::Rpc { id, .. } | RpcError::Transport { id, .. } => *id,
        }
    }

    /// Numeric code for task error reporting: the RPC error code when the
    /// node answered, otherwise the request id.
    pub fn task_error_code(&self) -> i64 {
        match self {
            RpcError::Rpc { code, .. } => *code,
            RpcError::Transport { id, .. } => *id as i64,
        }
    }

    /// The bare failure message, without the envelope details.
    pub fn message(&self) -> &str {
        match self {
            RpcError::Rpc { message, .. } | RpcError::Transport { message, .. } => message,
        }
    }
}

/// Connection-health notifications surfaced by the transport.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// The first connection of the pool authenticated successfully.
    FirstGoodConnection,
    /// Every connection of the pool dropped; the transport will retry.
    AllConnectionsLost,
    /// The node rejected the connection because it is still warming up.
    InWarmup(String),
}

/// JSON-RPC access to the upstream node.
///
/// Implementations own a small connection pool and assign a fresh id to
/// every submitted request.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Submit one request and wait for its reply.
    async fn submit(&self, method: &str, params: Vec<Value>) -> Result<RpcResponse, RpcError>;

    /// Size of the connection pool. Download tasks size their request
    /// window from this.
    fn max_clients(&self) -> usize;

    /// Subscribe to connection-health events.
    fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent>;

    /// Tear down the pool. Pending requests fail with transport errors.
    async fn cleanup(&self) {}

    /// Point-in-time transport statistics for the stats endpoint.
    fn stats_safe(&self) -> Value {
        Value::Null
    }
}
