//! Synchronization controller.
//!
//! Drives the catch-up cycle against the upstream node: poll the chain
//! tip, fan out strided download tasks, reassemble their out-of-order
//! output into a strictly monotone stream, verify and append each header,
//! then idle-poll for further growth. All observable effects happen on a
//! single event loop fed by posted messages, so state transitions are
//! totally ordered.

pub mod chain_info;
pub mod download;
mod stats;

use crate::block::{BlockParser, PreProcessedBlock, WireBlockParser};
use crate::config::Config;
use crate::server::ServerManager;
use crate::store::{SaveRequest, Store};
use crate::task::{TaskCore, TaskEvent, TaskId};
use crate::upstream::{UpstreamClient, UpstreamEvent};
use anyhow::{Context, Result};
use chain_info::{ChainInfo, ChainInfoTask};
use download::DownloadRangeTask;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WAIT_TIMER: &str = "wait4upstream";
const POLL_TIMER: &str = "pollTimer";
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(10);
const WARMUP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Notifications emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The local header count matches the upstream tip.
    UpToDate,
    /// A catch-up run started.
    Synchronizing,
    /// A catch-up pass failed or was deferred; a retry poll is scheduled.
    SynchFailure,
    /// Unrecoverable condition. The controller stops making transitions;
    /// the embedding process is expected to exit.
    Fatal(String),
}

/// Messages posted to the controller's event loop.
pub(crate) enum CtlMsg {
    Process { silent: bool },
    PutBlock { task: TaskId, block: Arc<PreProcessedBlock> },
    Task { task: TaskId, event: TaskEvent },
    PollTimer,
    WaitTimer,
    Upstream(UpstreamEvent),
    Stats(oneshot::Sender<Value>),
    Shutdown(oneshot::Sender<()>),
}

/// A task's sending side: posts lifecycle events and blocks back to the
/// controller. The gate enforces the lifecycle contract: at most one of
/// success/errored, nothing but `finished` after a terminal event, and
/// `finished` once.
pub(crate) struct TaskCtx {
    id: TaskId,
    tx: mpsc::UnboundedSender<CtlMsg>,
    gate: StdMutex<Gate>,
}

#[derive(Default)]
struct Gate {
    terminal: bool,
    finished: bool,
}

impl TaskCtx {
    fn new(id: TaskId, tx: mpsc::UnboundedSender<CtlMsg>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tx,
            gate: StdMutex::new(Gate::default()),
        })
    }

    fn post(&self, event: TaskEvent) {
        let _ = self.tx.send(CtlMsg::Task {
            task: self.id,
            event,
        });
    }

    pub fn started(&self) {
        let gate = self.gate.lock().expect("task gate poisoned");
        if !gate.terminal {
            self.post(TaskEvent::Started);
        }
    }

    pub fn progress(&self, progress: f64) {
        let gate = self.gate.lock().expect("task gate poisoned");
        if !gate.terminal {
            self.post(TaskEvent::Progress(progress));
        }
    }

    /// Claim the terminal slot with a success. Returns false if some
    /// other outcome got there first.
    pub fn success(&self) -> bool {
        let mut gate = self.gate.lock().expect("task gate poisoned");
        if gate.terminal {
            return false;
        }
        gate.terminal = true;
        self.post(TaskEvent::Success);
        true
    }

    /// Claim the terminal slot with an error. `before_send` runs under
    /// the gate, so the first failure's details win and are published
    /// before the event is observable.
    pub fn errored_with(&self, before_send: impl FnOnce()) -> bool {
        let mut gate = self.gate.lock().expect("task gate poisoned");
        if gate.terminal {
            return false;
        }
        gate.terminal = true;
        before_send();
        self.post(TaskEvent::Errored);
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.gate.lock().expect("task gate poisoned").terminal
    }

    pub fn finished(&self) {
        let mut gate = self.gate.lock().expect("task gate poisoned");
        if gate.finished {
            return;
        }
        gate.finished = true;
        self.post(TaskEvent::Finished);
    }

    /// Hand a downloaded block to the controller. Dropped once the task
    /// has reached a terminal state.
    pub fn put_block(&self, block: Arc<PreProcessedBlock>) {
        let gate = self.gate.lock().expect("task gate poisoned");
        if !gate.terminal {
            let _ = self.tx.send(CtlMsg::PutBlock {
                task: self.id,
                block,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Begin,
    GetBlocks,
    DownloadingBlocks,
    FinishedDl,
    End,
    Failure,
    Ibd,
}

impl SyncState {
    fn as_str(self) -> &'static str {
        match self {
            SyncState::Begin => "Begin",
            SyncState::GetBlocks => "GetBlocks",
            SyncState::DownloadingBlocks => "DownloadingBlocks",
            SyncState::FinishedDl => "FinishedDL",
            SyncState::End => "End",
            SyncState::Failure => "Failure",
            SyncState::Ibd => "IBD",
        }
    }
}

/// Per-pass synchronization state. Dropped and recreated between passes.
struct StateMachine {
    state: SyncState,
    /// Suppress the up-to-date event when this pass was started by the
    /// idle poll timer.
    silent: bool,
    /// Upstream tip height, -1 until known.
    tip_height: i64,
    /// Reassembly buffer: height -> block, drained in strict order.
    pp_blocks: BTreeMap<u64, Arc<PreProcessedBlock>>,
    next_expected_height: u64,
    start_height: u64,
    end_height: u64,
    n_tx: u64,
    n_ins: u64,
    n_outs: u64,
}

impl StateMachine {
    fn new(silent: bool) -> Self {
        Self {
            state: SyncState::Begin,
            silent,
            tip_height: -1,
            pp_blocks: BTreeMap::new(),
            next_expected_height: 0,
            start_height: 0,
            end_height: 0,
            n_tx: 0,
            n_ins: 0,
            n_outs: 0,
        }
    }
}

enum TaskKind {
    ChainInfo(Arc<ChainInfoTask>),
    Download(Arc<DownloadRangeTask>),
}

struct TaskEntry {
    core: Arc<TaskCore>,
    kind: TaskKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TimerEntry {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// The synchronization controller. Built once, started once; exclusive
/// owner of its collaborators for the life of the process.
pub struct Controller {
    config: Config,
    store: Arc<dyn Store>,
    upstream: Arc<dyn UpstreamClient>,
    parser: Arc<dyn BlockParser>,
    srvmgr: Arc<dyn ServerManager>,
}

impl Controller {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        upstream: Arc<dyn UpstreamClient>,
        srvmgr: Arc<dyn ServerManager>,
    ) -> Self {
        Self {
            config,
            store,
            upstream,
            parser: Arc::new(WireBlockParser),
            srvmgr,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn BlockParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Start the store and the event loop. Processing begins once the
    /// upstream client reports its first good connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn startup(self) -> Result<ControllerHandle> {
        self.store.startup().context("store startup failed")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        // Forward upstream connection-health events into the loop.
        let mut sub = self.upstream.subscribe();
        let fwd = tx.clone();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(ev) => {
                        if fwd.send(CtlMsg::Upstream(ev)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut inner = Inner {
            config: self.config,
            store: self.store,
            upstream: self.upstream,
            parser: self.parser,
            srvmgr: self.srvmgr,
            tx: tx.clone(),
            events: events.clone(),
            tasks: HashMap::new(),
            next_task_id: 1,
            sm: None,
            timers: HashMap::new(),
            awaiting_upstream: true,
            server_started: false,
            last_warmup_log: None,
            fatal: false,
        };
        inner.arm_wait_timer();

        let join = tokio::spawn(async move { inner.run(rx).await });

        Ok(ControllerHandle {
            tx,
            events,
            join: StdMutex::new(Some(join)),
        })
    }
}

/// Handle to a running controller.
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<CtlMsg>,
    events: broadcast::Sender<Event>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl ControllerHandle {
    /// Subscribe to controller events. Late subscribers miss earlier
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Nested statistics map, computed on the controller's own context.
    pub async fn stats(&self) -> Value {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CtlMsg::Stats(reply_tx)).is_err() {
            return Value::Null;
        }
        reply_rx.await.unwrap_or(Value::Null)
    }

    /// Stop all tasks and tear down the server manager, upstream client
    /// and store, in that order.
    pub async fn cleanup(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(CtlMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        let join = self.join.lock().expect("join lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

struct Inner {
    config: Config,
    store: Arc<dyn Store>,
    upstream: Arc<dyn UpstreamClient>,
    parser: Arc<dyn BlockParser>,
    srvmgr: Arc<dyn ServerManager>,
    tx: mpsc::UnboundedSender<CtlMsg>,
    events: broadcast::Sender<Event>,
    tasks: HashMap<TaskId, TaskEntry>,
    next_task_id: TaskId,
    sm: Option<StateMachine>,
    timers: HashMap<&'static str, TimerEntry>,
    awaiting_upstream: bool,
    server_started: bool,
    last_warmup_log: Option<Instant>,
    fatal: bool,
}

impl Inner {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<CtlMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                CtlMsg::Shutdown(reply) => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
                CtlMsg::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                // After a fatal error no further transitions occur.
                _ if self.fatal => {}
                CtlMsg::Process { silent } => self.process(silent),
                CtlMsg::PutBlock { task, block } => self.on_put_block(task, block),
                CtlMsg::Task { task, event } => self.on_task_event(task, event),
                CtlMsg::PollTimer => {
                    self.timers.remove(POLL_TIMER);
                    if self.sm.is_none() {
                        self.process(true);
                    }
                }
                CtlMsg::WaitTimer => info!("Waiting for upstream..."),
                CtlMsg::Upstream(ev) => self.on_upstream(ev),
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn enter_fatal(&mut self, msg: String) {
        error!("{}", msg);
        self.fatal = true;
        for entry in self.tasks.values() {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        self.tasks.clear();
        // Drop the pass state so stats reflect the frozen controller
        // instead of a stale pre-fatal snapshot.
        self.sm = None;
        self.stop_timer(WAIT_TIMER);
        self.stop_timer(POLL_TIMER);
        self.emit(Event::Fatal(msg));
    }

    /// Post another `process` pass to our own queue; yields to queued
    /// block deliveries and task events in between.
    fn again(&self) {
        let _ = self.tx.send(CtlMsg::Process { silent: false });
    }

    fn is_task_deleted(&self, id: TaskId) -> bool {
        !self.tasks.contains_key(&id)
    }

    fn remove_task(&mut self, id: TaskId) {
        if self.tasks.remove(&id).is_none() {
            error!("Task {} not found in registry on finish", id);
        }
    }

    // --- timers

    fn arm_wait_timer(&mut self) {
        self.stop_timer(WAIT_TIMER);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(WAIT_LOG_INTERVAL).await;
                if tx.send(CtlMsg::WaitTimer).is_err() {
                    break;
                }
            }
        });
        self.timers.insert(
            WAIT_TIMER,
            TimerEntry {
                interval: WAIT_LOG_INTERVAL,
                handle,
            },
        );
    }

    fn arm_poll_timer(&mut self, interval: Duration) {
        self.stop_timer(POLL_TIMER);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(CtlMsg::PollTimer);
        });
        self.timers
            .insert(POLL_TIMER, TimerEntry { interval, handle });
    }

    fn stop_timer(&mut self, name: &'static str) {
        if let Some(timer) = self.timers.remove(name) {
            timer.handle.abort();
        }
    }

    // --- upstream connection health

    fn on_upstream(&mut self, ev: UpstreamEvent) {
        match ev {
            UpstreamEvent::FirstGoodConnection => {
                if self.awaiting_upstream {
                    self.awaiting_upstream = false;
                    self.stop_timer(WAIT_TIMER);
                    debug!("Upstream connection is good, proceeding with processing ...");
                    let _ = self.tx.send(CtlMsg::Process { silent: false });
                }
            }
            UpstreamEvent::AllConnectionsLost => {
                if !self.awaiting_upstream {
                    self.awaiting_upstream = true;
                    self.stop_timer(POLL_TIMER);
                    self.arm_wait_timer();
                }
            }
            UpstreamEvent::InWarmup(msg) => {
                // Throttled so a busy warmup loop doesn't spam the log.
                let due = self
                    .last_warmup_log
                    .map(|at| at.elapsed() >= WARMUP_LOG_INTERVAL)
                    .unwrap_or(true);
                if due {
                    self.last_warmup_log = Some(Instant::now());
                    info!("Upstream node is still warming up: {}", msg);
                }
            }
        }
    }

    // --- task spawning

    fn spawn_chain_info_task(&mut self) {
        let id = self.next_task_id;
        self.next_task_id += 1;
        let ctx = TaskCtx::new(id, self.tx.clone());
        let cancel = CancellationToken::new();
        let task = ChainInfoTask::new();
        let handle = tokio::spawn(ChainInfoTask::run(
            Arc::clone(&task),
            Arc::clone(&self.upstream),
            Arc::clone(&ctx),
            cancel.clone(),
        ));
        self.tasks.insert(
            id,
            TaskEntry {
                core: Arc::clone(task.core()),
                kind: TaskKind::ChainInfo(task),
                cancel,
                handle,
            },
        );
    }

    fn spawn_download_task(&mut self, from: u64, to: u64, stride: u64) {
        let id = self.next_task_id;
        self.next_task_id += 1;
        let ctx = TaskCtx::new(id, self.tx.clone());
        let cancel = CancellationToken::new();
        let task = DownloadRangeTask::new(from, to, stride);
        let max_q = self
            .config
            .max_inflight
            .unwrap_or_else(|| self.upstream.max_clients() + 1);
        let handle = tokio::spawn(DownloadRangeTask::run(
            Arc::clone(&task),
            Arc::clone(&self.upstream),
            Arc::clone(&self.parser),
            Arc::clone(&ctx),
            cancel.clone(),
            max_q,
        ));
        self.tasks.insert(
            id,
            TaskEntry {
                core: Arc::clone(task.core()),
                kind: TaskKind::Download(task),
                cancel,
                handle,
            },
        );
    }

    // --- task events

    fn on_task_event(&mut self, id: TaskId, event: TaskEvent) {
        match event {
            TaskEvent::Started => {}
            TaskEvent::Progress(progress) => self.on_task_progress(id, progress),
            TaskEvent::Success => self.on_task_success(id),
            TaskEvent::Errored => self.on_task_errored(id),
            TaskEvent::Finished => self.remove_task(id),
        }
    }

    fn on_task_progress(&self, id: TaskId, progress: f64) {
        if self.sm.is_none() || self.is_task_deleted(id) {
            return;
        }
        if let Some(TaskEntry {
            kind: TaskKind::Download(task),
            ..
        }) = self.tasks.get(&id)
        {
            let done = (task.expected_count() as f64 * progress) as u64;
            info!(
                "Downloaded height: {}, {:.1}%",
                task.index_to_height(done),
                progress * 100.0
            );
        }
    }

    fn on_task_success(&mut self, id: TaskId) {
        if self.sm.is_none() || self.is_task_deleted(id) {
            // Task was stopped from underneath us; this event is stale.
            return;
        }
        let (kind, name) = match self.tasks.get(&id) {
            Some(entry) => {
                let kind = match &entry.kind {
                    TaskKind::ChainInfo(task) => Ok(Arc::clone(task)),
                    TaskKind::Download(task) => Err(Arc::clone(task)),
                };
                (kind, entry.core.name().to_string())
            }
            None => return,
        };
        match kind {
            Ok(task) => {
                let Some(info) = task.take_info() else {
                    self.enter_fatal("INTERNAL ERROR: chain info task succeeded without info".into());
                    return;
                };
                self.on_chain_info(info);
            }
            Err(task) => {
                let (n_tx, n_ins, n_outs) = task.totals();
                let good = task.good_count();
                let sm = self.sm.as_mut().expect("checked above");
                sm.n_tx += n_tx;
                sm.n_ins += n_ins;
                sm.n_outs += n_outs;
                debug!(
                    "Got all headers from: {} headerCt: {} nTx,nIns,nOuts: {},{},{} totals: {},{},{}",
                    name, good, n_tx, n_ins, n_outs, sm.n_tx, sm.n_ins, sm.n_outs
                );
            }
        }
    }

    fn on_task_errored(&mut self, id: TaskId) {
        if self.sm.is_none() || self.is_task_deleted(id) {
            return;
        }
        let sm = self.sm.as_ref().expect("checked above");
        if sm.state == SyncState::Failure {
            // Already failing; first error wins.
            return;
        }
        if let Some(entry) = self.tasks.get(&id) {
            let err = entry.core.error();
            error!("Task errored: {}, error: {}", entry.core.name(), err.message);
        }
        self.enter_failure();
    }

    fn enter_failure(&mut self) {
        if let Some(sm) = self.sm.as_mut() {
            if sm.state != SyncState::Failure {
                sm.state = SyncState::Failure;
                self.again();
            }
        }
    }

    // --- state machine

    fn process(&mut self, silent: bool) {
        self.stop_timer(POLL_TIMER);
        if self.sm.is_none() {
            self.sm = Some(StateMachine::new(silent));
        }
        let state = self.sm.as_ref().expect("just created").state;
        match state {
            SyncState::Begin => {
                // One snapshot request per pass, even if several process
                // messages land while we are still in Begin.
                let pending = self
                    .tasks
                    .values()
                    .any(|entry| matches!(entry.kind, TaskKind::ChainInfo(_)));
                if !pending {
                    self.spawn_chain_info_task();
                }
            }
            SyncState::GetBlocks => self.process_get_blocks(),
            SyncState::DownloadingBlocks => self.process_downloading_blocks(),
            SyncState::FinishedDl => self.process_finished_dl(),
            SyncState::Failure => {
                error!("Failed to download headers");
                self.sm = None;
                self.arm_poll_timer(self.config.poll_interval());
                self.emit(Event::SynchFailure);
            }
            SyncState::End => {
                self.sm = None;
                self.arm_poll_timer(self.config.poll_interval());
            }
            SyncState::Ibd => {
                self.sm = None;
                warn!(
                    "Upstream node is in initial block download, will try again in {} seconds",
                    self.config.ibd_poll_interval_secs
                );
                self.arm_poll_timer(self.config.ibd_poll_interval());
                self.emit(Event::SynchFailure);
            }
        }
    }

    fn on_chain_info(&mut self, info: ChainInfo) {
        let silent = match self.sm.as_ref() {
            Some(sm) if sm.state == SyncState::Begin => sm.silent,
            _ => return,
        };

        if info.initial_block_download {
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::Ibd;
            }
            self.again();
            return;
        }

        let dbchain = self.store.get_chain();
        if dbchain.is_empty() && !info.chain.is_empty() {
            self.store.set_chain(&info.chain);
        } else if dbchain != info.chain {
            self.enter_fatal(format!(
                "Upstream reports chain: \"{}\", which differs from our database: \"{}\". \
                 You may have connected to the wrong node. To fix this issue either connect \
                 to a different upstream node or delete this program's datadir to resynch.",
                info.chain, dbchain
            ));
            return;
        }

        let old = self.store.headers().len() as i64 - 1;
        let tip = info.blocks as i64;
        match self.sm.as_mut() {
            Some(sm) => sm.tip_height = tip,
            None => return,
        }

        if old == tip {
            if !silent {
                info!("Block height {}, up-to-date", tip);
                self.emit_up_to_date();
                if self.fatal {
                    return;
                }
            }
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::End;
            }
        } else if old > tip {
            self.enter_fatal(format!(
                "We have height {}, but the upstream node reports height {}. Possible reasons: \
                 a massive reorg, your node is acting funny, or you are on the wrong chain \
                 (testnet vs mainnet). Cowardly giving up and exiting...",
                old, tip
            ));
            return;
        } else {
            info!("Block height {}, downloading new headers ...", tip);
            self.emit(Event::Synchronizing);
            if let Some(sm) = self.sm.as_mut() {
                sm.state = SyncState::GetBlocks;
            }
        }
        self.again();
    }

    /// First catch-up to the tip: start listening for external clients.
    /// Deferred until now so no client ever sees a desynchronized index.
    fn emit_up_to_date(&mut self) {
        self.emit(Event::UpToDate);
        if !self.server_started {
            match self.srvmgr.startup() {
                Ok(()) => self.server_started = true,
                Err(e) => self.enter_fatal(format!("Server manager failed to start: {e:#}")),
            }
        }
    }

    fn process_get_blocks(&mut self) {
        let tip = match self.sm.as_ref() {
            Some(sm) if sm.tip_height >= 0 => sm.tip_height as u64,
            Some(_) => {
                self.enter_fatal("INTERNAL ERROR: tip height unknown in GetBlocks".into());
                return;
            }
            None => return,
        };
        let base = self.store.headers().len() as u64;
        let num = (tip + 1).saturating_sub(base);
        if num == 0 {
            self.enter_fatal("INTERNAL ERROR: cannot download 0 blocks".into());
            return;
        }
        let n_tasks = num.min(self.config.dl_concurrency.max(1) as u64);

        // The tasks partition [base, tip] by residue class modulo n_tasks.
        for i in 0..n_tasks {
            self.spawn_download_task(base + i, tip, n_tasks);
        }

        let sm = self.sm.as_mut().expect("checked above");
        sm.start_height = base;
        sm.next_expected_height = base;
        sm.end_height = base + num - 1;
        // Download tasks call back via put_block from here on.
        sm.state = SyncState::DownloadingBlocks;
    }

    fn on_put_block(&mut self, task: TaskId, block: Arc<PreProcessedBlock>) {
        let Some(sm) = self.sm.as_ref() else {
            debug!("Ignoring block {} for now-defunct task", block.height);
            return;
        };
        if self.is_task_deleted(task) || sm.state == SyncState::Failure {
            debug!("Ignoring block {} for now-defunct task", block.height);
            return;
        }
        if sm.state != SyncState::DownloadingBlocks {
            warn!(
                "Ignoring block {} -- state is not \"DownloadingBlocks\" but rather: \"{}\"",
                block.height,
                sm.state.as_str()
            );
            return;
        }
        let sm = self.sm.as_mut().expect("checked above");
        sm.pp_blocks.insert(block.height, block);
        self.process_downloading_blocks();
    }

    fn process_downloading_blocks(&mut self) {
        loop {
            let next = {
                let Some(sm) = self.sm.as_ref() else { return };
                match sm.pp_blocks.first_key_value() {
                    Some((&height, _)) if height == sm.next_expected_height => height,
                    _ => break,
                }
            };
            let block = {
                let sm = self.sm.as_mut().expect("checked above");
                sm.next_expected_height += 1;
                sm.pp_blocks.remove(&next).expect("first key just observed")
            };
            if !self.verify_and_append(&block) {
                return;
            }
        }

        let Some(sm) = self.sm.as_mut() else { return };
        if sm.next_expected_height > sm.end_height {
            sm.state = SyncState::FinishedDl;
            self.again();
        }
    }

    fn verify_and_append(&mut self, block: &PreProcessedBlock) -> bool {
        let raw_header;
        {
            let mut verifier = self.store.header_verifier();
            let undo = verifier.clone();
            if let Err(err) = verifier.verify(&block.header) {
                // Possible reorg point: undo the verifier and fall back
                // to the retry poll.
                error!("{}", err);
                *verifier = undo;
                drop(verifier);
                self.enter_failure();
                return false;
            }
            raw_header = match verifier.last_header_processed() {
                Some((_, header)) => header,
                None => {
                    drop(verifier);
                    self.enter_fatal(
                        "INTERNAL ERROR: verifier has no header after a successful verify".into(),
                    );
                    return false;
                }
            };
        }

        let (next_expected, end_height) = {
            let sm = self.sm.as_ref().expect("only called while running");
            (sm.next_expected_height, sm.end_height)
        };
        let n_left = end_height.saturating_sub(next_expected.saturating_sub(1));
        {
            let mut headers = self.store.mutable_headers();
            // Reserve the rest of the run in one go to amortize growth.
            headers.reserve(n_left as usize + 1);
            headers.push(raw_header);
        }

        let interval = self.config.header_save_interval;
        if interval > 0 && n_left != 0 && n_left % interval == 0 {
            self.store.save(SaveRequest::Headers);
        }
        true
    }

    fn process_finished_dl(&mut self) {
        let Some(sm) = self.sm.take() else { return };
        let n = sm.end_height - sm.start_height + 1;
        info!(
            "Processed {} new {} with {} {} ({} {} & {} {}), verified ok.",
            n,
            pluralize("block", n),
            sm.n_tx,
            pluralize("tx", sm.n_tx),
            sm.n_ins,
            pluralize("input", sm.n_ins),
            sm.n_outs,
            pluralize("output", sm.n_outs),
        );
        // Back to Begin to catch any growth that arrived while we were
        // processing, and enqueue a header flush.
        self.again();
        self.store.save(SaveRequest::Headers);
    }

    // --- teardown

    async fn teardown(&mut self) {
        for (_, entry) in self.tasks.drain() {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.sm = None;
        if self.server_started {
            info!("Stopping server manager ...");
            self.srvmgr.cleanup();
        }
        info!("Stopping upstream client ...");
        self.upstream.cleanup().await;
        info!("Closing storage ...");
        if let Err(e) = self.store.cleanup() {
            error!("Store cleanup failed: {e:#}");
        }
    }
}

fn pluralize(word: &str, n: u64) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::HEADER_SIZE;

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("block", 1), "block");
        assert_eq!(pluralize("block", 0), "blocks");
        assert_eq!(pluralize("tx", 12), "txs");
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(SyncState::Begin.as_str(), "Begin");
        assert_eq!(SyncState::DownloadingBlocks.as_str(), "DownloadingBlocks");
        assert_eq!(SyncState::FinishedDl.as_str(), "FinishedDL");
        assert_eq!(SyncState::Ibd.as_str(), "IBD");
    }

    fn test_block(height: u64) -> Arc<PreProcessedBlock> {
        Arc::new(PreProcessedBlock {
            height,
            size_bytes: 100,
            header: [0u8; HEADER_SIZE],
            tx_count: 1,
            input_count: 1,
            output_count: 1,
            in_memory_bytes: 64,
        })
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<CtlMsg>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let CtlMsg::Task { event, .. } = msg {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_task_ctx_single_terminal_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskCtx::new(1, tx);

        ctx.started();
        ctx.progress(0.5);
        assert!(ctx.success());
        assert!(!ctx.success());
        assert!(!ctx.errored_with(|| panic!("must not run after terminal")));
        ctx.finished();
        ctx.finished();

        let events = drain_events(&mut rx);
        assert_eq!(
            events,
            vec![
                TaskEvent::Started,
                TaskEvent::Progress(0.5),
                TaskEvent::Success,
                TaskEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_task_ctx_drops_events_after_errored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskCtx::new(1, tx);

        assert!(ctx.errored_with(|| {}));
        ctx.progress(0.9);
        ctx.put_block(test_block(3));
        assert!(!ctx.success());
        ctx.finished();

        let mut saw_put_block = false;
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                CtlMsg::Task { event, .. } => events.push(event),
                CtlMsg::PutBlock { .. } => saw_put_block = true,
                _ => {}
            }
        }
        assert!(!saw_put_block);
        assert_eq!(events, vec![TaskEvent::Errored, TaskEvent::Finished]);
    }

    #[tokio::test]
    async fn test_task_ctx_put_block_before_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TaskCtx::new(7, tx);

        ctx.put_block(test_block(11));
        assert!(ctx.success());

        match rx.try_recv() {
            Ok(CtlMsg::PutBlock { task, block }) => {
                assert_eq!(task, 7);
                assert_eq!(block.height, 11);
            }
            _ => panic!("expected PutBlock first"),
        }
    }
}
