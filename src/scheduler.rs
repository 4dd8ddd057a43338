//! Shadow task scheduler: a bounded FIFO queue drained by an elastic pool
//! of workers.
//!
//! Workers are never pre-allocated. A monitor loop samples the queue backlog
//! every 100 ms and spawns up to `ceil(backlog × avg_latency_secs)` workers,
//! capped at the configured maximum: roughly one worker per second of queued
//! service time, estimated from the latency ring. Idle workers exit after
//! the idle timeout, shrinking the pool back down.

use crate::config::{DEFAULT_SCHEDULER_QUEUE, DEFAULT_SCHEDULER_WORKERS, DEFAULT_WORKER_IDLE_TIMEOUT_MS};
use crate::error::Error;
use crate::latency::LatencyRing;
use crate::types::Context;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Slots in the latency ring feeding the sizing loop.
pub(crate) const LATENCY_RING_CAPACITY: usize = 1_000;

const MONITOR_TICK: Duration = Duration::from_millis(100);

/// A deferred shadow invocation. Receives the scheduler's context, not the
/// originating caller's.
pub(crate) type ShadowTask =
    Box<dyn FnOnce(Context) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Scheduler sizing parameters, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SchedulerOptions {
    pub max_queue: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
}

impl SchedulerOptions {
    pub fn normalize(mut self) -> Self {
        if self.max_queue == 0 {
            self.max_queue = DEFAULT_SCHEDULER_QUEUE;
        }
        if self.max_workers == 0 {
            self.max_workers = DEFAULT_SCHEDULER_WORKERS;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = Duration::from_millis(DEFAULT_WORKER_IDLE_TIMEOUT_MS);
        }
        self
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_SCHEDULER_QUEUE,
            max_workers: DEFAULT_SCHEDULER_WORKERS,
            idle_timeout: Duration::from_millis(DEFAULT_WORKER_IDLE_TIMEOUT_MS),
        }
    }
}

pub(crate) struct Scheduler {
    queue_tx: mpsc::Sender<ShadowTask>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ShadowTask>>>,
    options: SchedulerOptions,
    latencies: LatencyRing,
    num_workers: AtomicUsize,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Arc<Self> {
        let options = options.normalize();
        let (queue_tx, queue_rx) = mpsc::channel(options.max_queue);
        Arc::new(Self {
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            options,
            latencies: LatencyRing::new(LATENCY_RING_CAPACITY),
            num_workers: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        })
    }

    /// Current queue backlog (approximate).
    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Current worker count.
    pub fn worker_count(&self) -> usize {
        self.num_workers.load(Ordering::Acquire)
    }

    /// Non-blocking push. A full queue rejects the task.
    pub fn try_enqueue(&self, task: ShadowTask) -> Result<(), Error> {
        match self.queue_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull {
                depth: self.queue_depth(),
            }),
            Err(TrySendError::Closed(_)) => Err(Error::ClientClosed),
        }
    }

    /// Blocking push: waits for queue space, back-pressuring the caller.
    pub async fn enqueue_blocking(&self, task: ShadowTask) -> Result<(), Error> {
        self.queue_tx
            .send(task)
            .await
            .map_err(|_| Error::ClientClosed)
    }

    /// Run the sizing monitor until shutdown. Spawn this once.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(MONITOR_TICK);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tick.tick() => {
                    let backlog = self.queue_depth();
                    if backlog == 0 {
                        continue;
                    }

                    let mut need: u64 = 1;
                    let avg_latency = self.latencies.average_secs();
                    if avg_latency > 0.0 {
                        need = (backlog as f64 * avg_latency).ceil().max(1.0) as u64;
                    }

                    for _ in 0..need {
                        if self.worker_count() >= self.options.max_workers {
                            break;
                        }
                        self.spawn_worker();
                    }
                }
            }
        }
        debug!("scheduler monitor stopped");
    }

    fn spawn_worker(self: &Arc<Self>) {
        self.num_workers.fetch_add(1, Ordering::AcqRel);
        let scheduler = self.clone();
        self.tracker.spawn(async move {
            scheduler.worker_loop().await;
        });
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                task = Self::next_task(&self.queue_rx) => {
                    let Some(task) = task else { break };
                    let start = Instant::now();
                    task(Context::with_cancel(self.token.clone())).await;
                    self.latencies.add(start.elapsed().as_nanos() as i64);
                }
                _ = tokio::time::sleep(self.options.idle_timeout) => break,
            }
        }
        self.num_workers.fetch_sub(1, Ordering::AcqRel);
    }

    // Workers share one receiver behind an async mutex; whichever worker
    // holds the lock takes the next task.
    async fn next_task(
        queue: &tokio::sync::Mutex<mpsc::Receiver<ShadowTask>>,
    ) -> Option<ShadowTask> {
        queue.lock().await.recv().await
    }

    /// Stop accepting monitor ticks, let workers exit at their next
    /// non-task wake, and wait for every in-flight worker.
    pub async fn shut_down(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn seed_latency(&self, nanos: i64) {
        self.latencies.add(nanos);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue_depth", &self.queue_depth())
            .field("workers", &self.worker_count())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: Arc<AtomicUsize>) -> ShadowTask {
        Box::new(move |_ctx| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_options_normalize_fills_defaults() {
        let options = SchedulerOptions {
            max_queue: 0,
            max_workers: 0,
            idle_timeout: Duration::ZERO,
        }
        .normalize();
        assert_eq!(options.max_queue, DEFAULT_SCHEDULER_QUEUE);
        assert_eq!(options.max_workers, DEFAULT_SCHEDULER_WORKERS);
        assert_eq!(
            options.idle_timeout,
            Duration::from_millis(DEFAULT_WORKER_IDLE_TIMEOUT_MS)
        );
    }

    #[tokio::test]
    async fn test_tasks_drain_and_workers_spawn() {
        let scheduler = Scheduler::new(SchedulerOptions {
            max_queue: 64,
            max_workers: 4,
            idle_timeout: Duration::from_millis(200),
        });
        tokio::spawn(scheduler.clone().run());

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            scheduler.try_enqueue(counting_task(counter.clone())).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 16 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tasks should drain");

        scheduler.shut_down().await;
        assert_eq!(scheduler.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let scheduler = Scheduler::new(SchedulerOptions {
            max_queue: 1,
            max_workers: 1,
            idle_timeout: Duration::from_millis(100),
        });
        // No monitor running: nothing drains the queue.

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.try_enqueue(counting_task(counter.clone())).unwrap();

        let err = scheduler
            .try_enqueue(counting_task(counter.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { depth: 1 }));
    }

    #[tokio::test]
    async fn test_worker_pool_grows_with_slow_tasks() {
        let scheduler = Scheduler::new(SchedulerOptions {
            max_queue: 128,
            max_workers: 8,
            idle_timeout: Duration::from_millis(500),
        });
        tokio::spawn(scheduler.clone().run());

        // Seed the ring so the sizing loop sees ~1s of service time per task.
        for _ in 0..10 {
            scheduler.seed_latency(1_000_000_000);
        }

        let slow: fn(Context) -> Pin<Box<dyn Future<Output = ()> + Send>> = |_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
        };
        for _ in 0..32 {
            scheduler.try_enqueue(Box::new(slow)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.worker_count() < 8 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pool should reach max workers under backlog");

        scheduler.shut_down().await;
    }

    #[tokio::test]
    async fn test_idle_workers_exit() {
        let scheduler = Scheduler::new(SchedulerOptions {
            max_queue: 16,
            max_workers: 4,
            idle_timeout: Duration::from_millis(50),
        });
        tokio::spawn(scheduler.clone().run());

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            scheduler.try_enqueue(counting_task(counter.clone())).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // Workers drain, then idle out.
            while scheduler.worker_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle workers should exit");
    }

    #[tokio::test]
    async fn test_shutdown_skips_queued_tasks() {
        let scheduler = Scheduler::new(SchedulerOptions {
            max_queue: 16,
            max_workers: 2,
            idle_timeout: Duration::from_millis(500),
        });
        // Monitor never started: tasks stay queued.
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.try_enqueue(counting_task(counter.clone())).unwrap();

        scheduler.shut_down().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.worker_count(), 0);
    }
}
