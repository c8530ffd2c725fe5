//! Controller statistics.
//!
//! Built entirely on the controller's own context from registry state,
//! task atomics and the reassembly buffer, so no locks beyond the
//! header-count read are touched.

use super::{Inner, TaskKind};
use crate::task::ProgressReporter;
use serde_json::{json, Map, Value};

impl Inner {
    pub(super) fn stats(&self) -> Value {
        let mut controller = Map::new();
        controller.insert("Headers".into(), json!(self.store.headers().len()));

        let sm_stats = match &self.sm {
            Some(sm) => {
                let mut m = Map::new();
                m.insert("State".into(), json!(sm.state.as_str()));
                m.insert("Height".into(), json!(sm.tip_height));

                let n_dl = self.n_headers_downloaded_so_far();
                if n_dl > 0 {
                    m.insert("Headers_Downloaded_This_Run".into(), json!(n_dl));
                }
                let (n_tx, n_ins, n_out) = self.n_tx_in_out_so_far();
                if n_tx > 0 {
                    m.insert(
                        "Txs_Seen_This_Run".into(),
                        json!({ "nTx": n_tx, "nIns": n_ins, "nOut": n_out }),
                    );
                }

                let backlog = sm.pp_blocks.len();
                m.insert("BackLog_Blocks".into(), json!(backlog));
                if backlog > 0 {
                    let (raw_bytes, mem_bytes, txs) = sm.pp_blocks.values().fold(
                        (0usize, 0usize, 0usize),
                        |(raw, mem, txs), b| {
                            (raw + b.size_bytes, mem + b.in_memory_bytes, txs + b.tx_count)
                        },
                    );
                    m.insert(
                        "BackLog_RawBlocksDataSize".into(),
                        json!(format!("{:.3} MiB", raw_bytes as f64 / 1e6)),
                    );
                    m.insert(
                        "BackLog_InMemoryDataSize".into(),
                        json!(format!("{:.3} MiB", mem_bytes as f64 / 1e6)),
                    );
                    m.insert("BackLog_Txs".into(), json!(txs));
                }
                Value::Object(m)
            }
            None => Value::Null,
        };
        controller.insert("StateMachine".into(), sm_stats);

        let timers: Map<String, Value> = self
            .timers
            .iter()
            .map(|(name, timer)| (name.to_string(), json!(timer.interval.as_millis() as u64)))
            .collect();
        controller.insert("activeTimers".into(), Value::Object(timers));

        let tasks: Vec<Value> = self
            .tasks
            .values()
            .map(|entry| {
                let mut wrapper = Map::new();
                wrapper.insert(
                    entry.core.name().to_string(),
                    json!({
                        "age": format!("{:.3} sec", entry.core.age_secs()),
                        "progress": format!("{:.1}%", entry.core.last_progress() * 100.0),
                    }),
                );
                Value::Object(wrapper)
            })
            .collect();
        controller.insert("tasks".into(), json!(tasks));

        let servers = if self.server_started {
            self.srvmgr.stats_safe()
        } else {
            Value::Null
        };
        json!({
            "Servers": servers,
            "Bitcoin Daemon": self.upstream.stats_safe(),
            "Controller": Value::Object(controller),
        })
    }

    fn n_headers_downloaded_so_far(&self) -> u64 {
        self.tasks
            .values()
            .filter_map(|entry| match &entry.kind {
                TaskKind::Download(task) => Some(task.n_so_far()),
                _ => None,
            })
            .sum()
    }

    fn n_tx_in_out_so_far(&self) -> (u64, u64, u64) {
        self.tasks
            .values()
            .filter_map(|entry| match &entry.kind {
                TaskKind::Download(task) => Some(task.n_tx_in_out()),
                _ => None,
            })
            .fold((0, 0, 0), |(tx, ins, outs), (t, i, o)| {
                (tx + t, ins + i, outs + o)
            })
    }
}
