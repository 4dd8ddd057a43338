//! Test support: the in-memory driver, a pushable configuration source, a
//! capturing stats sink and polling helpers.
//!
//! Everything here is public so applications can reuse the same doubles in
//! their own tests; the integration suites at the bottom are compiled only
//! under `cfg(test)`.

mod memory;

#[cfg(test)]
mod breaker_tests;

pub use memory::{AppliedTuning, MemoryDriver, MemoryDriverFactory, MemoryPubSub, MemoryServer};

use crate::config::ConnectorConfig;
use crate::configurer::{ChangeCallback, Configurer};
use crate::error::Result;
use crate::telemetry::StatsSink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

/// A configuration source tests can mutate and fire at will.
#[derive(Default)]
pub struct StubConfigurer {
    config: Mutex<ConnectorConfig>,
    callback: Mutex<Option<ChangeCallback>>,
}

impl StubConfigurer {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config: Mutex::new(config),
            callback: Mutex::new(None),
        }
    }

    /// Replace the snapshot without firing the change callback.
    pub fn set_config(&self, config: ConnectorConfig) {
        *self.config.lock() = config;
    }

    /// Replace the snapshot and fire the change callback, returning what the
    /// callback returned (`Ok` when none is registered).
    pub async fn push(&self, config: ConnectorConfig) -> Result<()> {
        self.set_config(config);
        let fired = {
            let callback = self.callback.lock();
            callback.as_ref().map(|cb| cb())
        };
        match fired {
            Some(outcome) => outcome.await,
            None => Ok(()),
        }
    }
}

impl Configurer for StubConfigurer {
    fn on_change(&self, callback: ChangeCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn unmarshal(&self) -> Result<ConnectorConfig> {
        Ok(self.config.lock().clone())
    }
}

/// A stats sink recording counter increments for assertions.
#[derive(Default)]
pub struct CapturingStats {
    counts: Mutex<HashMap<String, u64>>,
}

impl CapturingStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_key(metric: &str, tags: &[String]) -> String {
        let mut tags = tags.to_vec();
        tags.sort();
        format!("{metric}|{}", tags.join(","))
    }

    /// Total increments of `metric` across entries whose tag set contains
    /// `tag_fragment` (empty fragment matches everything).
    pub fn count_of(&self, metric: &str, tag_fragment: &str) -> u64 {
        self.counts
            .lock()
            .iter()
            .filter(|(key, _)| {
                key.starts_with(&format!("{metric}|")) && key.contains(tag_fragment)
            })
            .map(|(_, count)| *count)
            .sum()
    }
}

impl StatsSink for CapturingStats {
    fn incr(&self, metric: &str, tags: &[String]) {
        *self
            .counts
            .lock()
            .entry(Self::entry_key(metric, tags))
            .or_insert(0) += 1;
    }

    fn gauge(&self, _metric: &str, _value: f64, _tags: &[String]) {}

    fn duration(&self, _metric: &str, _elapsed: Duration, _tags: &[String]) {}
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ClientMode};

    #[tokio::test]
    async fn test_stub_configurer_push_without_callback() {
        let configurer = StubConfigurer::new(ConnectorConfig::default());
        let config = ConnectorConfig::new(BackendConfig::new(
            ClientMode::SingleHost,
            vec!["stub:6379".to_string()],
        ));
        configurer.push(config.clone()).await.unwrap();
        assert_eq!(configurer.unmarshal().unwrap(), config);
    }

    #[tokio::test]
    async fn test_stub_configurer_fires_callback() {
        let configurer = StubConfigurer::new(ConnectorConfig::default());
        configurer.on_change(Box::new(|| {
            Box::pin(async { Err(crate::error::Error::Config("rejected".into())) })
        }));

        let err = configurer
            .push(ConnectorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn test_capturing_stats_counts_by_fragment() {
        let stats = CapturingStats::new();
        stats.incr("error", &["host:a".to_string(), "func:do".to_string()]);
        stats.incr("error", &["host:a".to_string(), "func:do".to_string()]);
        stats.incr("error", &["host:b".to_string(), "func:run".to_string()]);

        assert_eq!(stats.count_of("error", "func:do"), 2);
        assert_eq!(stats.count_of("error", "host:b"), 1);
        assert_eq!(stats.count_of("error", ""), 3);
        assert_eq!(stats.count_of("elapsed", ""), 0);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!wait_for(|| async { false }, Duration::from_millis(50)).await);
        assert!(wait_for(|| async { true }, Duration::from_millis(50)).await);
    }
}
