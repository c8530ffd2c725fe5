//! Header storage.
//!
//! The store owns the append-only header vector and the stateful chain
//! verifier, both behind locks the controller acquires for short critical
//! sections. Persistence is a flat file of 80-byte records, written by a
//! background saver so the controller never blocks on disk.

pub mod hashing;

use crate::block::{RawHeader, HEADER_SIZE};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use tracing::{debug, error, info};

const HEADERS_FILE: &str = "headers.dat";
const CHAIN_FILE: &str = "chain";

/// What to flush. Headers are the only persisted item at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveRequest {
    Headers,
}

/// Stateful chain verifier.
///
/// Tracks the hash and height of the last accepted header and checks that
/// each candidate links to it. Cheap to copy, so callers snapshot it
/// before a `verify` and restore the snapshot to undo a failure.
#[derive(Debug, Clone)]
pub struct HeaderVerifier {
    prev_hash: [u8; 32],
    height: i64,
    last: Option<(u64, RawHeader)>,
}

impl HeaderVerifier {
    /// Verifier for an empty chain. The first header must carry an
    /// all-zero previous-hash field (genesis).
    pub fn new() -> Self {
        Self {
            prev_hash: [0u8; 32],
            height: -1,
            last: None,
        }
    }

    /// Verifier resuming after `header` was accepted at `height`.
    pub fn seeded(height: u64, header: &RawHeader) -> Self {
        Self {
            prev_hash: hashing::sha256d(header),
            height: height as i64,
            last: Some((height, *header)),
        }
    }

    /// Check that `header` links to the last accepted header and advance.
    /// On error the verifier state is unchanged.
    pub fn verify(&mut self, header: &RawHeader) -> std::result::Result<(), String> {
        if header[4..36] != self.prev_hash {
            return Err(format!(
                "header at height {} does not link to the previous header (expected prev {}, got {})",
                self.height + 1,
                hex::encode(self.prev_hash),
                hex::encode(&header[4..36]),
            ));
        }
        self.prev_hash = hashing::sha256d(header);
        self.height += 1;
        self.last = Some((self.height as u64, *header));
        Ok(())
    }

    /// Height and raw bytes of the most recently accepted header.
    pub fn last_header_processed(&self) -> Option<(u64, RawHeader)> {
        self.last
    }

    /// Height of the last accepted header, -1 when none.
    pub fn height(&self) -> i64 {
        self.height
    }
}

impl Default for HeaderVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Header and chain-tag storage consumed by the controller.
///
/// Lock guards are returned directly; callers must not hold them across
/// await points.
pub trait Store: Send + Sync {
    fn startup(&self) -> Result<()>;
    fn cleanup(&self) -> Result<()>;

    /// Chain tag ("main", "test", ...), empty until first set.
    fn get_chain(&self) -> String;
    fn set_chain(&self, chain: &str);

    fn headers(&self) -> RwLockReadGuard<'_, Vec<RawHeader>>;
    fn mutable_headers(&self) -> RwLockWriteGuard<'_, Vec<RawHeader>>;
    fn header_verifier(&self) -> MutexGuard<'_, HeaderVerifier>;

    /// Enqueue an asynchronous flush. Never blocks.
    fn save(&self, req: SaveRequest);
}

enum SaverMsg {
    Save(SaveRequest),
    Quit,
}

struct Saver {
    tx: mpsc::Sender<SaverMsg>,
    handle: thread::JoinHandle<()>,
}

/// Default store: header vector in memory, optionally mirrored to a flat
/// file of 80-byte records under a data directory.
pub struct HeaderStore {
    dir: Option<PathBuf>,
    chain: RwLock<String>,
    headers: Arc<RwLock<Vec<RawHeader>>>,
    verifier: Mutex<HeaderVerifier>,
    persisted: Arc<AtomicUsize>,
    saver: Mutex<Option<Saver>>,
}

impl HeaderStore {
    /// Purely in-memory store. `save` requests become no-ops.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            chain: RwLock::new(String::new()),
            headers: Arc::new(RwLock::new(Vec::new())),
            verifier: Mutex::new(HeaderVerifier::new()),
            persisted: Arc::new(AtomicUsize::new(0)),
            saver: Mutex::new(None),
        }
    }

    /// Store backed by `dir`. Existing records are loaded on `startup`.
    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        let mut store = Self::in_memory();
        store.dir = Some(dir.into());
        store
    }

    fn load(&self, dir: &Path) -> Result<()> {
        let chain_path = dir.join(CHAIN_FILE);
        if chain_path.exists() {
            let tag = std::fs::read_to_string(&chain_path)
                .with_context(|| format!("reading {}", chain_path.display()))?;
            *self.chain.write().expect("chain lock poisoned") = tag.trim().to_string();
        }

        let headers_path = dir.join(HEADERS_FILE);
        if !headers_path.exists() {
            return Ok(());
        }
        let mut file = File::open(&headers_path)
            .with_context(|| format!("opening {}", headers_path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .with_context(|| format!("reading {}", headers_path.display()))?;
        if buf.len() % HEADER_SIZE != 0 {
            anyhow::bail!(
                "{} is corrupt: {} bytes is not a multiple of {}",
                headers_path.display(),
                buf.len(),
                HEADER_SIZE
            );
        }

        let mut headers = self.headers.write().expect("headers lock poisoned");
        headers.clear();
        for chunk in buf.chunks_exact(HEADER_SIZE) {
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(chunk);
            headers.push(header);
        }
        self.persisted.store(headers.len(), Ordering::SeqCst);
        if let Some(last) = headers.last() {
            let height = (headers.len() - 1) as u64;
            *self.verifier.lock().expect("verifier lock poisoned") =
                HeaderVerifier::seeded(height, last);
        }
        info!("Loaded {} headers from {}", headers.len(), headers_path.display());
        Ok(())
    }

    fn flush(
        path: &Path,
        headers: &RwLock<Vec<RawHeader>>,
        persisted: &AtomicUsize,
    ) -> std::io::Result<usize> {
        // Snapshot the unpersisted tail so the write happens outside the lock.
        let tail: Vec<RawHeader> = {
            let headers = headers.read().expect("headers lock poisoned");
            let from = persisted.load(Ordering::SeqCst).min(headers.len());
            headers[from..].to_vec()
        };
        if tail.is_empty() {
            return Ok(0);
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for header in &tail {
            file.write_all(header)?;
        }
        file.sync_data()?;
        persisted.fetch_add(tail.len(), Ordering::SeqCst);
        Ok(tail.len())
    }
}

impl Store for HeaderStore {
    fn startup(&self) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        self.load(&dir)?;

        let (tx, rx) = mpsc::channel::<SaverMsg>();
        let headers = Arc::clone(&self.headers);
        let persisted = Arc::clone(&self.persisted);
        let path = dir.join(HEADERS_FILE);
        let handle = thread::Builder::new()
            .name("header-saver".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    let quitting = matches!(msg, SaverMsg::Quit);
                    match Self::flush(&path, &headers, &persisted) {
                        Ok(0) => {}
                        Ok(n) => debug!("Flushed {} headers to {}", n, path.display()),
                        Err(e) => error!("Failed to flush headers to {}: {}", path.display(), e),
                    }
                    if quitting {
                        break;
                    }
                }
            })
            .context("spawning header saver thread")?;
        *self.saver.lock().expect("saver lock poisoned") = Some(Saver { tx, handle });
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let Some(saver) = self.saver.lock().expect("saver lock poisoned").take() {
            let _ = saver.tx.send(SaverMsg::Quit);
            if saver.handle.join().is_err() {
                anyhow::bail!("header saver thread panicked");
            }
        }
        Ok(())
    }

    fn get_chain(&self) -> String {
        self.chain.read().expect("chain lock poisoned").clone()
    }

    fn set_chain(&self, chain: &str) {
        *self.chain.write().expect("chain lock poisoned") = chain.to_string();
        if let Some(dir) = &self.dir {
            if let Err(e) = std::fs::write(dir.join(CHAIN_FILE), chain) {
                error!("Failed to persist chain tag: {}", e);
            }
        }
    }

    fn headers(&self) -> RwLockReadGuard<'_, Vec<RawHeader>> {
        self.headers.read().expect("headers lock poisoned")
    }

    fn mutable_headers(&self) -> RwLockWriteGuard<'_, Vec<RawHeader>> {
        self.headers.write().expect("headers lock poisoned")
    }

    fn header_verifier(&self) -> MutexGuard<'_, HeaderVerifier> {
        self.verifier.lock().expect("verifier lock poisoned")
    }

    fn save(&self, req: SaveRequest) {
        let saver = self.saver.lock().expect("saver lock poisoned");
        if let Some(saver) = saver.as_ref() {
            // A closed channel means cleanup already ran; drop the request.
            let _ = saver.tx.send(SaverMsg::Save(req));
        }
    }
}
