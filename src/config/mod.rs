//! Node configuration.
//!
//! The controller takes a fully-formed [`Config`]; loading and CLI
//! parsing are the embedding binary's concern.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the synchronization controller and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream node RPC host.
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Upstream node RPC port.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// RPC username for the upstream node.
    #[serde(default)]
    pub rpc_user: String,

    /// RPC password for the upstream node.
    #[serde(default)]
    pub rpc_password: String,

    /// Interfaces the server manager listens on once the index is caught up.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<SocketAddr>,

    /// Delay before re-polling the upstream tip after an idle or failed pass.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Extended poll delay while the upstream node is in initial block
    /// download and its tip is not authoritative.
    #[serde(default = "default_ibd_poll_interval")]
    pub ibd_poll_interval_secs: u64,

    /// Number of concurrent download tasks per catch-up run.
    #[serde(default = "default_dl_concurrency")]
    pub dl_concurrency: usize,

    /// Per-task cap on outstanding RPC requests. Defaults to the upstream
    /// connection pool size plus one.
    #[serde(default)]
    pub max_inflight: Option<usize>,

    /// Request an asynchronous header flush every this many appended headers.
    #[serde(default = "default_header_save_interval")]
    pub header_save_interval: u64,
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    8332
}

fn default_interfaces() -> Vec<SocketAddr> {
    vec!["127.0.0.1:50001".parse().expect("static address")]
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ibd_poll_interval() -> u64 {
    60
}

fn default_dl_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cores.saturating_sub(1).max(1)
}

fn default_header_save_interval() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            interfaces: default_interfaces(),
            poll_interval_secs: default_poll_interval(),
            ibd_poll_interval_secs: default_ibd_poll_interval(),
            dl_concurrency: default_dl_concurrency(),
            max_inflight: None,
            header_save_interval: default_header_save_interval(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn ibd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ibd_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.ibd_poll_interval_secs, 60);
        assert!(config.dl_concurrency >= 1);
        assert_eq!(config.header_save_interval, 10_000);
        assert!(config.max_inflight.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"upstream_host": "10.0.0.7", "poll_interval_secs": 2}"#)
                .unwrap();
        assert_eq!(config.upstream_host, "10.0.0.7");
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.upstream_port, 8332);
        assert_eq!(config.ibd_poll_interval_secs, 60);
    }
}
