//! Listening server manager.
//!
//! The controller keeps the server side dark until the local index has
//! caught up with the upstream tip at least once; only then does it call
//! `startup` here, so no external client ever observes a desynchronized
//! index. Serving the client protocol itself lives outside this crate.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::sync::Mutex;
use tracing::info;

/// Externally-listening side of the node.
pub trait ServerManager: Send + Sync {
    /// Bind and start listening. A bind failure is fatal to the process.
    fn startup(&self) -> Result<()>;

    /// Stop listening and drop all sockets.
    fn cleanup(&self);

    /// Point-in-time statistics, callable from any context.
    fn stats_safe(&self) -> Value;
}

/// Minimal manager that binds the configured interfaces.
pub struct TcpServerManager {
    interfaces: Vec<SocketAddr>,
    listeners: Mutex<Vec<TcpListener>>,
}

impl TcpServerManager {
    pub fn new(interfaces: Vec<SocketAddr>) -> Self {
        Self {
            interfaces,
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl ServerManager for TcpServerManager {
    fn startup(&self) -> Result<()> {
        let mut listeners = self.listeners.lock().expect("listeners lock poisoned");
        for addr in &self.interfaces {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("binding listener on {addr}"))?;
            info!("Listening on {}", addr);
            listeners.push(listener);
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .clear();
    }

    fn stats_safe(&self) -> Value {
        let bound = self
            .listeners
            .lock()
            .expect("listeners lock poisoned")
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .map(|a| a.to_string())
            .collect::<Vec<_>>();
        json!({ "interfaces": bound })
    }
}
