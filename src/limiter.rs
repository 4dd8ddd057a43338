//! Per-node admission limiter handed to the driver pool.
//!
//! Every shard of a backend gets its own limiter, which references its
//! circuit by key only. The driver calls [`Limiter::allow`] before dispatch
//! and [`Limiter::execute`] around the network operation.

use crate::breaker;
use crate::error::{Error, Result};
use crate::telemetry::{Logger, TracingLogger};
use std::future::Future;
use std::sync::Arc;

/// Stable breaker key for a backend node address.
pub fn breaker_key(addr: &str) -> String {
    format!("redis_{addr}")
}

/// Predicate deciding whether an error bypasses the breaker's error counter.
pub type NonThreatPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// How protected calls classify and report their outcomes.
#[derive(Clone)]
pub struct BreakerPolicy {
    non_threat: NonThreatPredicate,
    logger: Arc<dyn Logger>,
}

impl BreakerPolicy {
    /// A policy with a custom non-threat predicate.
    pub fn new(non_threat: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self {
            non_threat: Arc::new(non_threat),
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replace the logger used for service-down reporting.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Whether the breaker must not count this error.
    pub fn is_non_threat(&self, err: &Error) -> bool {
        (self.non_threat)(err)
    }

    pub(crate) fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::new(default_non_threat)
    }
}

impl std::fmt::Debug for BreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPolicy").finish_non_exhaustive()
    }
}

/// The default outcome classification.
///
/// Cancellation never trips a breaker; a well-formed server error is the
/// server working as intended; a read-only reply from a writable target
/// indicates topology drift and must count so the breaker forces a refresh.
/// Everything else (timeouts, transport failures, panics) counts.
pub fn default_non_threat(err: &Error) -> bool {
    match err {
        Error::Cancelled => true,
        Error::ReadOnlyNode(_) => false,
        Error::Server(_) => true,
        _ => false,
    }
}

/// Admission control for one backend node.
///
/// Holds the node's breaker key, never the breaker itself; the process-wide
/// registry owns circuit state.
#[derive(Clone)]
pub struct Limiter {
    key: String,
    policy: BreakerPolicy,
}

impl Limiter {
    /// Create a limiter for the given breaker key.
    pub fn new(key: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            key: key.into(),
            policy,
        }
    }

    /// The breaker key this limiter consults.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Admission check before dispatch.
    pub fn allow(&self) -> Result<()> {
        if !breaker::allow_request(&self.key) {
            return Err(Error::CircuitOpen {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Run one operation under breaker protection.
    pub async fn execute<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        breaker::execute(&self.key, fut, &self.policy).await
    }

    /// No-op: [`Limiter::execute`] already observes the outcome.
    pub fn report_result(&self, _result: &Result<()>) {}
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBuilder;

    #[test]
    fn test_breaker_key_format() {
        assert_eq!(breaker_key("127.0.0.1:6379"), "redis_127.0.0.1:6379");
    }

    #[test]
    fn test_default_predicate_classification() {
        assert!(default_non_threat(&Error::Cancelled));
        assert!(default_non_threat(&Error::Server("ERR unknown command".into())));

        assert!(!default_non_threat(&Error::ReadOnlyNode(
            "READONLY You can't write against a read only replica.".into()
        )));
        assert!(!default_non_threat(&Error::DeadlineExceeded));
        assert!(!default_non_threat(&Error::Transport("i/o timeout".into())));
        assert!(!default_non_threat(&Error::Panicked("boom".into())));
    }

    #[tokio::test]
    async fn test_limiter_allow_reflects_circuit() {
        let key = breaker_key("limiter.test:6379");
        breaker::configure_circuit(
            &key,
            CircuitBuilder::new(&key)
                .with_request_volume_threshold(1)
                .with_error_percentage_threshold(1)
                .with_sleep_window(60_000)
                .build(),
        );

        let limiter = Limiter::new(&key, BreakerPolicy::default());
        limiter.allow().unwrap();

        let _ = limiter
            .execute::<(), _>(async { Err(Error::Transport("down".into())) })
            .await;

        let err = limiter.allow().unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_limiter_execute_passes_value_through() {
        let limiter = Limiter::new(
            breaker_key("limiter.pass:6379"),
            BreakerPolicy::default(),
        );
        let value = limiter.execute(async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
    }
}
