//! Per-node circuit state machine with a rolling outcome window.

use crate::error::{Error, Result};
use crate::limiter::BreakerPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

/// Width of the rolling outcome window.
const WINDOW: Duration = Duration::from_secs(10);
/// Bucket granularity inside the window.
const BUCKET: Duration = Duration::from_secs(1);

/// Resolved breaker settings for one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    /// How long a protected call may run before it is reported as a timeout.
    pub timeout: Duration,
    /// How many protected calls may run concurrently.
    pub max_concurrent: u32,
    /// Minimum requests in the window before the circuit can trip.
    pub volume_threshold: u32,
    /// Error percentage at which the circuit opens.
    pub error_percent: u32,
    /// How long to wait after opening before admitting a probe.
    pub sleep_window: Duration,
    /// How many calls may wait for a concurrency permit before rejection.
    pub queue_size: u32,
}

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy; requests flow through.
    Closed,
    /// Tripped; requests are rejected.
    Open,
    /// Tripped, but the sleep window elapsed: the next request probes.
    HalfOpen,
}

#[derive(Debug, Default, Clone, Copy)]
struct BucketCounts {
    epoch: u64,
    requests: u64,
    errors: u64,
}

/// Rolling window of request outcomes, bucketed per second.
#[derive(Debug)]
struct RollingWindow {
    start: Instant,
    buckets: Mutex<VecDeque<BucketCounts>>,
}

impl RollingWindow {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    fn epoch(&self) -> u64 {
        self.start.elapsed().as_secs() / BUCKET.as_secs()
    }

    fn record(&self, error: bool) {
        let epoch = self.epoch();
        let horizon = epoch.saturating_sub(WINDOW.as_secs() / BUCKET.as_secs());
        let mut buckets = self.buckets.lock();

        while buckets.front().is_some_and(|b| b.epoch < horizon) {
            buckets.pop_front();
        }

        match buckets.back_mut() {
            Some(bucket) if bucket.epoch == epoch => {
                bucket.requests += 1;
                if error {
                    bucket.errors += 1;
                }
            }
            _ => buckets.push_back(BucketCounts {
                epoch,
                requests: 1,
                errors: u64::from(error),
            }),
        }
    }

    /// Current (requests, errors) totals inside the window.
    fn totals(&self) -> (u64, u64) {
        let horizon = self
            .epoch()
            .saturating_sub(WINDOW.as_secs() / BUCKET.as_secs());
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .filter(|b| b.epoch >= horizon)
            .fold((0, 0), |(req, err), b| (req + b.requests, err + b.errors))
    }

    fn reset(&self) {
        self.buckets.lock().clear();
    }
}

/// One node's circuit breaker.
///
/// Transitions CLOSED → OPEN when the rolling window holds at least
/// `volume_threshold` requests and the error ratio reaches `error_percent`.
/// After `sleep_window` the next request is admitted as a probe (HALF-OPEN);
/// a successful probe closes the circuit, a failed one re-arms the window.
pub struct CircuitBreaker {
    name: String,
    settings: CircuitSettings,
    window: RollingWindow,
    open: AtomicBool,
    /// Milliseconds since `window.start` when the circuit opened or last
    /// admitted a probe.
    opened_or_probed_ms: AtomicU64,
    permits: Arc<Semaphore>,
    waiting: AtomicU32,
}

impl CircuitBreaker {
    pub(crate) fn new(name: impl Into<String>, settings: CircuitSettings) -> Self {
        Self {
            name: name.into(),
            window: RollingWindow::new(),
            open: AtomicBool::new(false),
            opened_or_probed_ms: AtomicU64::new(0),
            permits: Arc::new(Semaphore::new(settings.max_concurrent as usize)),
            waiting: AtomicU32::new(0),
            settings,
        }
    }

    /// Whether the circuit is open (probe admissions do not close it).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether a request may proceed: closed, or open with an elapsed sleep
    /// window (at most one probe per window).
    pub fn allow_request(&self) -> bool {
        !self.is_open() || self.allow_single_probe()
    }

    /// Current observable state.
    pub fn state(&self) -> CircuitState {
        if !self.is_open() {
            return CircuitState::Closed;
        }
        let since = self.window.start.elapsed().as_millis() as u64;
        let armed_at = self.opened_or_probed_ms.load(Ordering::Acquire);
        if since >= armed_at + self.settings.sleep_window.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn allow_single_probe(&self) -> bool {
        let now_ms = self.window.start.elapsed().as_millis() as u64;
        let armed_at = self.opened_or_probed_ms.load(Ordering::Acquire);
        if now_ms < armed_at + self.settings.sleep_window.as_millis() as u64 {
            return false;
        }
        // Only one caller wins the probe per sleep window.
        self.opened_or_probed_ms
            .compare_exchange(armed_at, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn report_success(&self) {
        self.window.record(false);
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(circuit = %self.name, "circuit closed after successful probe");
            self.window.reset();
        }
    }

    fn report_error(&self) {
        self.window.record(true);
        if self.is_open() {
            return;
        }
        let (requests, errors) = self.window.totals();
        if requests < u64::from(self.settings.volume_threshold) {
            return;
        }
        let percent = errors * 100 / requests;
        if percent >= u64::from(self.settings.error_percent)
            && !self.open.swap(true, Ordering::AcqRel)
        {
            let now_ms = self.window.start.elapsed().as_millis() as u64;
            self.opened_or_probed_ms.store(now_ms, Ordering::Release);
            debug!(circuit = %self.name, requests, errors, "circuit opened");
        }
    }

    /// Count of tracked errors currently inside the rolling window.
    pub fn tracked_errors(&self) -> u64 {
        self.window.totals().1
    }

    /// Execute a protected call.
    ///
    /// Rejections are typed: [`Error::CircuitOpen`] when tripped,
    /// [`Error::MaxConcurrency`] when the cap and its waiting line are
    /// exhausted, [`Error::BreakerTimeout`] when the per-call timeout
    /// expires. The call runs on its own task so a panic is observed and
    /// converted to [`Error::Panicked`]. The policy's non-threat predicate
    /// decides which returned errors feed the window.
    pub async fn execute<T, F>(&self, fut: F, policy: &BreakerPolicy) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.allow_request() {
            return Err(Error::CircuitOpen {
                key: self.name.clone(),
            });
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if self.waiting.load(Ordering::Acquire) >= self.settings.queue_size {
                    return Err(Error::MaxConcurrency {
                        key: self.name.clone(),
                    });
                }
                self.waiting.fetch_add(1, Ordering::AcqRel);
                let acquired = self.permits.clone().acquire_owned().await;
                self.waiting.fetch_sub(1, Ordering::AcqRel);
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(Error::MaxConcurrency {
                            key: self.name.clone(),
                        })
                    }
                }
            }
        };

        // The permit travels with the task: a timed-out call keeps its slot
        // until it actually returns, like any other in-flight call.
        let handle = tokio::spawn(async move {
            let _permit = permit;
            fut.await
        });

        match tokio::time::timeout(self.settings.timeout, handle).await {
            Err(_elapsed) => {
                self.report_error();
                Err(Error::BreakerTimeout {
                    key: self.name.clone(),
                    timeout_ms: self.settings.timeout.as_millis() as u64,
                })
            }
            Ok(Err(join_err)) => {
                let err = Error::Panicked(join_err.to_string());
                self.report_error();
                policy.logger().service_down(&self.name, &err);
                Err(err)
            }
            Ok(Ok(Ok(value))) => {
                self.report_success();
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                if policy.is_non_threat(&err) {
                    self.report_success();
                } else {
                    self.report_error();
                    policy.logger().service_down(&self.name, &err);
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_settings() -> CircuitSettings {
        CircuitSettings {
            timeout: Duration::from_millis(50),
            max_concurrent: 2,
            volume_threshold: 1,
            error_percent: 1,
            sleep_window: Duration::from_millis(20),
            queue_size: 0,
        }
    }

    #[tokio::test]
    async fn test_success_keeps_circuit_closed() {
        let circuit = CircuitBreaker::new("redis_a:1", tight_settings());
        let policy = BreakerPolicy::default();

        let value = circuit
            .execute(async { Ok::<_, Error>(7) }, &policy)
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!circuit.is_open());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.tracked_errors(), 0);
    }

    #[tokio::test]
    async fn test_threat_error_opens_circuit() {
        let circuit = CircuitBreaker::new("redis_a:2", tight_settings());
        let policy = BreakerPolicy::default();

        let err = circuit
            .execute(
                async { Err::<(), _>(Error::Transport("connection reset".into())) },
                &policy,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(circuit.is_open());

        // Within the sleep window the next call is rejected outright.
        let err = circuit
            .execute(async { Ok::<_, Error>(()) }, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_non_threat_error_bypasses_window() {
        let circuit = CircuitBreaker::new("redis_a:3", tight_settings());
        let policy = BreakerPolicy::default();

        for _ in 0..5 {
            let err = circuit
                .execute(
                    async { Err::<(), _>(Error::Server("ERR unknown command".into())) },
                    &policy,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Server(_)));
        }
        assert!(!circuit.is_open());
        assert_eq!(circuit.tracked_errors(), 0);
    }

    #[tokio::test]
    async fn test_probe_after_sleep_window_closes_on_success() {
        let circuit = CircuitBreaker::new("redis_a:4", tight_settings());
        let policy = BreakerPolicy::default();

        let _ = circuit
            .execute(
                async { Err::<(), _>(Error::Transport("down".into())) },
                &policy,
            )
            .await;
        assert!(circuit.is_open());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // Probe succeeds: circuit closes.
        circuit
            .execute(async { Ok::<_, Error>(()) }, &policy)
            .await
            .unwrap();
        assert!(!circuit.is_open());
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let circuit = CircuitBreaker::new("redis_a:5", tight_settings());
        let policy = BreakerPolicy::default();

        let _ = circuit
            .execute(
                async { Err::<(), _>(Error::Transport("down".into())) },
                &policy,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        let err = circuit
            .execute(
                async { Err::<(), _>(Error::Transport("still down".into())) },
                &policy,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(circuit.is_open());

        // Immediately after the failed probe the window is re-armed.
        let err = circuit
            .execute(async { Ok::<_, Error>(()) }, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_and_typed() {
        let circuit = CircuitBreaker::new("redis_a:6", tight_settings());
        let policy = BreakerPolicy::default();

        let err = circuit
            .execute(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, Error>(())
                },
                &policy,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BreakerTimeout { timeout_ms: 50, .. }));
        assert!(circuit.is_open());
    }

    #[tokio::test]
    async fn test_max_concurrency_rejection() {
        let settings = CircuitSettings {
            max_concurrent: 1,
            queue_size: 0,
            timeout: Duration::from_secs(1),
            volume_threshold: 100,
            error_percent: 50,
            sleep_window: Duration::from_secs(1),
        };
        let circuit = Arc::new(CircuitBreaker::new("redis_a:7", settings));
        let policy = BreakerPolicy::default();

        let slow = {
            let circuit = circuit.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                circuit
                    .execute(
                        async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, Error>(())
                        },
                        &policy,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = circuit
            .execute(async { Ok::<_, Error>(()) }, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaxConcurrency { .. }));

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panic_converted_to_threat_error() {
        let circuit = CircuitBreaker::new("redis_a:8", tight_settings());
        let policy = BreakerPolicy::default();

        let err = circuit
            .execute::<(), _>(async { panic!("boom") }, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Panicked(_)));
        assert!(circuit.is_open());
    }
}
