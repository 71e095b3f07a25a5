use anyhow::Result;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use tracing::{info, warn};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative stop flag shared by the dispatcher, the workers and the
/// interrupt handler. Checked between whole runs and between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<R> {
    Completed(R),
    /// The task returned an error or panicked. Siblings keep running.
    Failed(String),
    /// Never started because the pool was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<R> {
    pub id: usize,
    pub outcome: TaskOutcome<R>,
}

/// Bounded set of OS threads draining a shared task queue.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One worker per core, leaving one for the dispatcher.
    pub fn default_size() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpus - 1).max(1)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `job` on every task and returns one result per task, ordered by
    /// task index. Once `cancel` fires no further task is started.
    pub fn run<T, R, F>(
        &self,
        tasks: Vec<T>,
        cancel: &CancellationToken,
        job: F,
    ) -> Result<Vec<TaskResult<R>>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T, &CancellationToken) -> Result<R> + Sync,
    {
        let total = tasks.len();
        let queue: Mutex<VecDeque<(usize, T)>> =
            Mutex::new(tasks.into_iter().enumerate().collect());
        let (tx, rx) = mpsc::channel::<TaskResult<R>>();
        let n_workers = self.workers.min(total);

        std::thread::scope(|scope| -> Result<()> {
            for w in 0..n_workers {
                let tx = tx.clone();
                let queue = &queue;
                let job = &job;
                std::thread::Builder::new()
                    .name(format!("worker-{w}"))
                    .spawn_scoped(scope, move || {
                        worker_loop(w, queue, cancel, job, tx);
                    })?;
            }
            Ok(())
        })?;
        drop(tx);

        let mut results: Vec<TaskResult<R>> = rx.into_iter().collect();
        if let Ok(mut q) = queue.lock() {
            results.extend(q.drain(..).map(|(id, _)| TaskResult {
                id,
                outcome: TaskOutcome::Cancelled,
            }));
        }
        results.sort_by_key(|r| r.id);
        info!(
            "pool finished: {} tasks, {} completed",
            total,
            results
                .iter()
                .filter(|r| matches!(r.outcome, TaskOutcome::Completed(_)))
                .count()
        );
        Ok(results)
    }
}

fn worker_loop<T, R, F>(
    worker: usize,
    queue: &Mutex<VecDeque<(usize, T)>>,
    cancel: &CancellationToken,
    job: &F,
    tx: mpsc::Sender<TaskResult<R>>,
) where
    F: Fn(usize, T, &CancellationToken) -> Result<R>,
{
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = match queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(_) => break,
        };
        let Some((id, task)) = next else { break };

        let outcome = match catch_unwind(AssertUnwindSafe(|| job(id, task, cancel))) {
            Ok(Ok(r)) => TaskOutcome::Completed(r),
            Ok(Err(e)) => {
                warn!("[worker {worker}] task {id} failed: {e:#}");
                TaskOutcome::Failed(format!("{e:#}"))
            }
            Err(_) => {
                warn!("[worker {worker}] task {id} panicked");
                TaskOutcome::Failed("panicked".to_string())
            }
        };
        if tx.send(TaskResult { id, outcome }).is_err() {
            break;
        }
    }
}
