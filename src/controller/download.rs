//! Strided block download task.
//!
//! Each task covers one residue class of the missing range: heights
//! `from, from+stride, ...` up to `to`. Blocks are pushed to the
//! controller as soon as they are ready; ordering is the controller's
//! reassembly buffer's problem, not ours.

use super::TaskCtx;
use crate::block::{BlockParser, HEADER_SIZE};
use crate::store::hashing;
use crate::task::{ProgressReporter, TaskCore};
use crate::upstream::{RpcError, UpstreamClient};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Emit a progress event whenever a height divisible by this lands.
const PROGRESS_EVERY: u64 = 1000;

pub struct DownloadRangeTask {
    core: Arc<TaskCore>,
    from: u64,
    to: u64,
    stride: u64,
    expected_count: u64,
    good_count: AtomicU64,
    maybe_done: AtomicBool,
    n_tx: AtomicU64,
    n_ins: AtomicU64,
    n_outs: AtomicU64,
}

impl DownloadRangeTask {
    pub(crate) fn new(from: u64, to: u64, stride: u64) -> Arc<Self> {
        debug_assert!(to >= from && stride > 0);
        let stride = stride.max(1);
        Arc::new(Self {
            core: Arc::new(TaskCore::new(format!("Task.DL {from} -> {to}"))),
            from,
            to,
            stride,
            expected_count: ((to - from + 1) + stride - 1) / stride,
            good_count: AtomicU64::new(0),
            maybe_done: AtomicBool::new(false),
            n_tx: AtomicU64::new(0),
            n_ins: AtomicU64::new(0),
            n_outs: AtomicU64::new(0),
        })
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    pub(crate) fn expected_count(&self) -> u64 {
        self.expected_count
    }

    pub(crate) fn good_count(&self) -> u64 {
        self.good_count.load(Ordering::SeqCst)
    }

    pub(crate) fn totals(&self) -> (u64, u64, u64) {
        (
            self.n_tx.load(Ordering::Relaxed),
            self.n_ins.load(Ordering::Relaxed),
            self.n_outs.load(Ordering::Relaxed),
        )
    }

    /// Height covered by position `index` of this task's subsequence.
    pub(crate) fn index_to_height(&self, index: u64) -> u64 {
        self.from + index * self.stride
    }

    /// Position of `height` in this task's subsequence.
    fn height_to_index(&self, height: u64) -> u64 {
        (height - self.from) / self.stride
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        upstream: Arc<dyn UpstreamClient>,
        parser: Arc<dyn BlockParser>,
        ctx: Arc<TaskCtx>,
        cancel: CancellationToken,
        max_q: usize,
    ) {
        ctx.started();

        // The permit pool is the request window: at most max_q height
        // pipelines in flight at once.
        let sem = Arc::new(Semaphore::new(max_q.max(1)));
        let mut handles = Vec::with_capacity(self.expected_count as usize);
        let mut next = self.from;
        while next <= self.to {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&sem).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            handles.push(tokio::spawn(Arc::clone(&self).fetch_one(
                next,
                permit,
                Arc::clone(&upstream),
                Arc::clone(&parser),
                Arc::clone(&ctx),
                cancel.clone(),
            )));
            next = next.saturating_add(self.stride);
        }
        for handle in handles {
            let _ = handle.await;
        }

        if !cancel.is_cancelled() && !ctx.is_terminal() {
            let good = self.good_count();
            if self.maybe_done.load(Ordering::SeqCst) && good >= self.expected_count {
                ctx.success();
            } else {
                let missing = self.expected_count.saturating_sub(good);
                ctx.errored_with(|| {
                    self.core
                        .set_error(missing as i64, format!("missing {missing} headers"))
                });
            }
        }
        ctx.finished();
    }

    /// Pipeline for one height: hash lookup, block fetch, integrity
    /// checks, parse, deliver.
    async fn fetch_one(
        self: Arc<Self>,
        height: u64,
        permit: OwnedSemaphorePermit,
        upstream: Arc<dyn UpstreamClient>,
        parser: Arc<dyn BlockParser>,
        ctx: Arc<TaskCtx>,
        cancel: CancellationToken,
    ) {
        let _permit = permit;
        if cancel.is_cancelled() {
            return;
        }

        let resp = match upstream.submit("getblockhash", vec![json!(height)]).await {
            Ok(resp) => resp,
            Err(e) => return self.rpc_failed(&ctx, &cancel, "getblockhash", e),
        };
        if cancel.is_cancelled() {
            return;
        }
        let hash_hex = resp.result.as_str().unwrap_or_default().to_string();
        let hash = hex::decode(&hash_hex).unwrap_or_default();
        if hash.len() != 32 {
            warn!(
                "getblockhash: at height {} hash not valid (decoded size: {})",
                height,
                hash.len()
            );
            return self.fail(&ctx, &cancel, height, format!("invalid hash for height {height}"));
        }

        let resp = match upstream
            .submit("getblock", vec![json!(hash_hex), json!(false)])
            .await
        {
            Ok(resp) => resp,
            Err(e) => return self.rpc_failed(&ctx, &cancel, "getblock", e),
        };
        if cancel.is_cancelled() {
            return;
        }
        let raw = resp
            .result
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .unwrap_or_default();
        if raw.len() < HEADER_SIZE {
            warn!(
                "getblock: at height {} header not valid (decoded size: {})",
                height,
                raw.len()
            );
            return self.fail(&ctx, &cancel, height, format!("bad size for height {height}"));
        }
        let header = &raw[..HEADER_SIZE];
        let check = hashing::hash_rev(header);
        if check[..] != hash[..] {
            warn!(
                "getblock: at height {} header not valid (expected hash: {}, got hash: {})",
                height,
                hex::encode(&hash),
                hex::encode(check)
            );
            return self.fail(
                &ctx,
                &cancel,
                height,
                format!("hash mismatch for height {height}"),
            );
        }

        let block = match parser.parse(height, &raw) {
            Ok(block) => Arc::new(block),
            Err(e) => {
                warn!("getblock: at height {} block failed to parse: {}", height, e);
                return self.fail(
                    &ctx,
                    &cancel,
                    height,
                    format!("failed to parse block for height {height}"),
                );
            }
        };

        self.n_tx.fetch_add(block.tx_count as u64, Ordering::Relaxed);
        self.n_ins
            .fetch_add(block.input_count as u64, Ordering::Relaxed);
        self.n_outs
            .fetch_add(block.output_count as u64, Ordering::Relaxed);

        let index = self.height_to_index(height);
        let progress = index as f64 / self.expected_count as f64;
        self.core.set_progress(progress);
        if height > 0 && height % PROGRESS_EVERY == 0 {
            ctx.progress(progress);
        }

        ctx.put_block(block);
        let good = self.good_count.fetch_add(1, Ordering::SeqCst) + 1;
        if good >= self.expected_count {
            self.maybe_done.store(true, Ordering::SeqCst);
        }
    }

    fn fail(&self, ctx: &TaskCtx, cancel: &CancellationToken, height: u64, message: String) {
        cancel.cancel();
        ctx.errored_with(|| self.core.set_error(height as i64, message));
    }

    fn rpc_failed(&self, ctx: &TaskCtx, cancel: &CancellationToken, method: &str, err: RpcError) {
        warn!("{}: error response: {}", method, err);
        cancel.cancel();
        let code = err.task_error_code();
        let message = err.message().to_string();
        ctx.errored_with(|| self.core.set_error(code, message));
    }
}

impl ProgressReporter for DownloadRangeTask {
    fn n_so_far(&self) -> u64 {
        (self.expected_count as f64 * self.core.last_progress()).round() as u64
    }

    fn n_tx_in_out(&self) -> (u64, u64, u64) {
        self.totals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    impl DownloadRangeTask {
        fn heights(&self) -> Vec<u64> {
            (self.from..=self.to).step_by(self.stride as usize).collect()
        }
    }

    #[test]
    fn test_expected_count() {
        assert_eq!(DownloadRangeTask::new(0, 9, 1).expected_count(), 10);
        assert_eq!(DownloadRangeTask::new(10, 14, 2).expected_count(), 3); // 10, 12, 14
        assert_eq!(DownloadRangeTask::new(11, 14, 2).expected_count(), 2); // 11, 13
        assert_eq!(DownloadRangeTask::new(5, 5, 3).expected_count(), 1);
    }

    #[test]
    fn test_index_height_maps() {
        let task = DownloadRangeTask::new(10, 24, 3);
        assert_eq!(task.index_to_height(0), 10);
        assert_eq!(task.index_to_height(2), 16);
        assert_eq!(task.height_to_index(10), 0);
        assert_eq!(task.height_to_index(22), 4);
    }

    #[test]
    fn test_stride_partition_covers_range_exactly_once() {
        for (base, tip, k) in [(0u64, 2u64, 1u64), (10, 14, 2), (0, 99, 7), (5, 5, 4), (3, 23, 4)] {
            let n_tasks = (tip - base + 1).min(k);
            let mut seen = BTreeSet::new();
            let mut total = 0usize;
            for i in 0..n_tasks {
                let task = DownloadRangeTask::new(base + i, tip, n_tasks);
                let heights = task.heights();
                assert_eq!(heights.len() as u64, task.expected_count());
                total += heights.len();
                seen.extend(heights);
            }
            let expected: BTreeSet<u64> = (base..=tip).collect();
            assert_eq!(seen, expected, "coverage for base={base} tip={tip} k={k}");
            assert_eq!(total as u64, tip - base + 1, "no height produced twice");
        }
    }

    #[test]
    fn test_n_so_far_tracks_progress() {
        let task = DownloadRangeTask::new(0, 99, 2); // 50 heights
        assert_eq!(task.n_so_far(), 0);
        task.core().set_progress(0.5);
        assert_eq!(task.n_so_far(), 25);
        task.core().set_progress(1.0);
        assert_eq!(task.n_so_far(), 50);
    }
}
