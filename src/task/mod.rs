//! Supervised task primitives.
//!
//! A task is a spawned unit of work that reports its lifecycle back to
//! the controller as posted messages: `started`, zero or more
//! `progress`, exactly one of `success`/`errored`, then `finished`. The
//! controller owns the registry and removes a task when it observes
//! `finished`; events for removed tasks are dropped on arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Registry key for a task.
pub type TaskId = u64;

/// Lifecycle notifications a task posts to its supervisor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskEvent {
    Started,
    Progress(f64),
    Success,
    Errored,
    Finished,
}

/// Terminal error details, readable after an `Errored` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskError {
    pub code: i64,
    pub message: String,
}

/// State shared between a running task and its supervisor.
///
/// Progress and error details are written by the task's own context and
/// read from the controller context, so both sit behind atomics or a
/// lock rather than plain fields.
#[derive(Debug)]
pub struct TaskCore {
    name: String,
    created_at: Instant,
    progress_bits: AtomicU64,
    error: Mutex<TaskError>,
}

impl TaskCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Instant::now(),
            progress_bits: AtomicU64::new(0f64.to_bits()),
            error: Mutex::new(TaskError::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn age_secs(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    /// Last reported completion fraction in `[0, 1]`.
    pub fn last_progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    pub fn set_progress(&self, progress: f64) {
        self.progress_bits
            .store(progress.to_bits(), Ordering::Relaxed);
    }

    pub fn set_error(&self, code: i64, message: impl Into<String>) {
        let mut err = self.error.lock().expect("task error lock poisoned");
        err.code = code;
        err.message = message.into();
    }

    pub fn error(&self) -> TaskError {
        self.error.lock().expect("task error lock poisoned").clone()
    }
}

/// Aggregate download statistics, implemented by tasks that fetch
/// blocks. The controller sums these across its registry for the stats
/// endpoint without caring which concrete task it is looking at.
pub trait ProgressReporter {
    /// Rough count of items completed so far, estimated from progress.
    fn n_so_far(&self) -> u64;
    /// Totals of transactions, inputs and outputs seen so far.
    fn n_tx_in_out(&self) -> (u64, u64, u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_round_trips_through_bits() {
        let core = TaskCore::new("Task.Test");
        assert_eq!(core.last_progress(), 0.0);
        core.set_progress(0.375);
        assert_eq!(core.last_progress(), 0.375);
    }

    #[test]
    fn test_error_is_shared() {
        let core = TaskCore::new("Task.Test");
        core.set_error(7, "missing 7 headers");
        assert_eq!(
            core.error(),
            TaskError {
                code: 7,
                message: "missing 7 headers".into()
            }
        );
    }
}
