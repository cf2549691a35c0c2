//! Priority job queue.
//!
//! Every side effect (cache updates, ban creation, firewall commands,
//! persistence) runs as a job on this queue. A single runner executes one job
//! at a time: higher priority first, FIFO within a priority. A failing or
//! panicking handler is logged and the runner moves on.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::BanwatchError;

/// Scheduling priority, highest last so the derived order is usable directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Background => "background",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type BoxedJob = Box<dyn FnOnce() -> JobFuture + Send>;

struct QueuedJob {
    priority: Priority,
    seq: u64,
    label: &'static str,
    job: BoxedJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap pops the greatest: highest priority, then lowest sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    wake: Notify,
    idle: Notify,
    seq: AtomicU64,
    /// Queued plus running
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Cloneable handle to the queue.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobQueue {
    /// Create an idle queue. Jobs accumulate until [`JobQueue::spawn_runner`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                idle: Notify::new(),
                seq: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Submit `handler(payload)` at `priority`. Returns immediately.
    ///
    /// Fails only once the queue has been closed.
    pub fn enqueue<P, F, Fut>(
        &self,
        label: &'static str,
        payload: P,
        handler: F,
        priority: Priority,
    ) -> Result<(), BanwatchError>
    where
        P: Send + 'static,
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(BanwatchError::QueueHandler {
                label: label.to_string(),
                reason: "queue is closed".to_string(),
            });
        }

        let job: BoxedJob = Box::new(move || Box::pin(handler(payload)) as JobFuture);
        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.shared.pending.fetch_add(1, AtomicOrdering::SeqCst);
        self.shared
            .heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(QueuedJob {
                priority,
                seq,
                label,
                job,
            });
        debug!(job = label, priority = %priority, "Enqueued job");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(AtomicOrdering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(AtomicOrdering::SeqCst)
    }

    /// Refuse new jobs. The runner exits once the backlog is drained.
    pub fn close(&self) {
        self.shared.closed.store(true, AtomicOrdering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Start the single consumer.
    pub fn spawn_runner(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { run(shared).await })
    }
}

fn pop(shared: &Shared) -> Option<QueuedJob> {
    shared
        .heap
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop()
}

async fn run(shared: Arc<Shared>) {
    debug!("Job queue runner started");
    loop {
        let Some(next) = pop(&shared) else {
            if shared.closed.load(AtomicOrdering::SeqCst) {
                break;
            }
            shared.wake.notified().await;
            continue;
        };

        let QueuedJob {
            priority,
            label,
            job,
            ..
        } = next;

        // Own task so a panic is contained to this job
        match tokio::spawn(async move { job().await }).await {
            Ok(Ok(())) => debug!(job = label, priority = %priority, "Job finished"),
            Ok(Err(e)) => {
                let err = BanwatchError::QueueHandler {
                    label: label.to_string(),
                    reason: format!("{:#}", e),
                };
                error!(priority = %priority, "{}", err);
            }
            Err(join) => {
                let err = BanwatchError::QueueHandler {
                    label: label.to_string(),
                    reason: if join.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        join.to_string()
                    },
                };
                error!(priority = %priority, "{}", err);
            }
        }

        if shared.pending.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            shared.idle.notify_waiters();
        }
    }
    debug!("Job queue runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn record(queue: &JobQueue, log: &Log, name: &'static str, priority: Priority) {
        let log = Arc::clone(log);
        queue
            .enqueue(
                "record",
                name,
                move |name| async move {
                    push(&log, name);
                    Ok(())
                },
                priority,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_when_idle() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        record(&queue, &log, "low", Priority::Low);
        record(&queue, &log, "critical", Priority::Critical);
        record(&queue, &log, "medium", Priority::Medium);
        assert_eq!(queue.pending(), 3);

        queue.spawn_runner();
        queue.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["critical", "medium", "low"]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        for name in ["a", "b", "c", "d"] {
            record(&queue, &log, name, Priority::High);
        }
        record(&queue, &log, "bg", Priority::Background);
        record(&queue, &log, "e", Priority::High);

        queue.spawn_runner();
        queue.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d", "e", "bg"]);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_stop_runner() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        queue
            .enqueue(
                "fails",
                (),
                |_| async { Err(anyhow::anyhow!("boom")) },
                Priority::High,
            )
            .unwrap();
        queue
            .enqueue(
                "panics",
                (),
                |_| async {
                    if true {
                        panic!("handler panic");
                    }
                    Ok(())
                },
                Priority::High,
            )
            .unwrap();
        record(&queue, &log, "after", Priority::Low);

        queue.spawn_runner();
        queue.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_one_job_at_a_time() {
        let queue = JobQueue::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            queue
                .enqueue(
                    "overlap",
                    (),
                    move |_| async move {
                        let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(())
                    },
                    Priority::Medium,
                )
                .unwrap();
        }

        queue.spawn_runner();
        queue.wait_idle().await;
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_jobs_can_enqueue_follow_ups() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        queue.spawn_runner();

        let inner_queue = queue.clone();
        let inner_log = Arc::clone(&log);
        queue
            .enqueue(
                "parent",
                (),
                move |_| async move {
                    push(&inner_log, "parent");
                    record(&inner_queue, &inner_log, "child", Priority::Critical);
                    Ok(())
                },
                Priority::Low,
            )
            .unwrap();

        queue.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["parent", "child"]);
    }

    #[tokio::test]
    async fn test_close_rejects_and_runner_exits() {
        let queue = JobQueue::new();
        let runner = queue.spawn_runner();
        queue.close();
        let err = queue
            .enqueue("late", (), |_| async { Ok(()) }, Priority::High)
            .unwrap_err();
        assert!(matches!(err, BanwatchError::QueueHandler { .. }));
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("runner should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let queue = JobQueue::new();
        tokio::time::timeout(Duration::from_millis(100), queue.wait_idle())
            .await
            .expect("idle queue");
    }

    #[test]
    fn test_priority_total_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Background);
        assert_eq!(Priority::Critical.to_string(), "critical");
    }
}
