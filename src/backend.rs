//! Backend wrappers: one per topology, sharing the reload contract.
//!
//! A backend owns its driver (and through it, its pools) for its whole
//! lifetime. Scalar parameters are mutated in place on reload; topology
//! (mode, address set, database) is frozen at construction.

use crate::breaker;
use crate::breaker::{CircuitBuilder, CircuitSettings};
use crate::config::{millis, BackendConfig, BreakerConfig, ClientMode};
use crate::driver::{Driver, DriverFactory, LimiterFactory, PoolLimits, RetryPolicy, Timeouts};
use crate::error::{Error, Result};
use crate::limiter::{breaker_key, BreakerPolicy, Limiter};
use crate::types::{CommandInfo, Context, PoolStats, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolve one backend's breaker settings for a specific node key.
pub(crate) fn breaker_settings(key: &str, settings: &BreakerConfig) -> CircuitSettings {
    CircuitBuilder::new(key)
        .with_timeout(settings.timeout_in_ms)
        .with_max_concurrent_requests(settings.max_concurrent_requests)
        .with_request_volume_threshold(settings.request_volume_threshold)
        .with_error_percentage_threshold(settings.error_percent_threshold)
        .with_sleep_window(settings.sleep_window_in_ms)
        .with_queue_size(settings.queue_size_rejection_threshold)
        .build()
}

fn limiter_factory(settings: BreakerConfig, policy: BreakerPolicy) -> LimiterFactory {
    Arc::new(move |addr: &str| {
        let key = breaker_key(addr);
        breaker::configure_circuit(&key, breaker_settings(&key, &settings));
        Limiter::new(key, policy.clone())
    })
}

struct BackendCore {
    driver: Arc<dyn Driver>,
    config: RwLock<BackendConfig>,
    policy: BreakerPolicy,
}

/// A single-host backend.
pub(crate) struct NodeBackend {
    core: BackendCore,
}

/// A sharded (or master/replica) backend; reload additionally manages
/// redirects and read routing, and walks every shard for breaker changes.
pub(crate) struct ClusterBackend {
    core: BackendCore,
}

/// One logical destination, dispatching by topology.
pub(crate) enum Backend {
    Single(NodeBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    /// Open a backend, installing per-node breakers when enabled.
    ///
    /// `config` must already be normalized and validated.
    pub fn connect(
        config: &BackendConfig,
        factory: &dyn DriverFactory,
        policy: BreakerPolicy,
    ) -> Result<Backend> {
        let limiters = config
            .hystrix_enabled
            .then(|| limiter_factory(config.hystrix, policy.clone()));

        let driver = factory.open(config, limiters)?;
        let core = BackendCore {
            driver,
            config: RwLock::new(config.clone()),
            policy,
        };

        Ok(match config.client_mode {
            ClientMode::SingleHost => Backend::Single(NodeBackend { core }),
            ClientMode::Cluster | ClientMode::MasterSlaveGroup => {
                Backend::Cluster(ClusterBackend { core })
            }
        })
    }

    fn core(&self) -> &BackendCore {
        match self {
            Backend::Single(b) => &b.core,
            Backend::Cluster(b) => &b.core,
        }
    }

    fn is_cluster(&self) -> bool {
        matches!(self, Backend::Cluster(_))
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.core().driver.clone()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> BackendConfig {
        self.core().config.read().clone()
    }

    /// Canonical identity for reload matching.
    pub fn name(&self) -> String {
        self.core().config.read().name()
    }

    pub async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<Value> {
        self.core().driver.exec(ctx, args).await
    }

    pub async fn exec_pipeline(
        &self,
        ctx: &Context,
        commands: &[Vec<Value>],
    ) -> Vec<Result<Value>> {
        self.core().driver.exec_pipeline(ctx, commands).await
    }

    pub async fn publish(&self, ctx: &Context, channel: &str, message: Value) -> Result<Value> {
        self.core().driver.publish(ctx, channel, message).await
    }

    pub async fn subscribe(
        &self,
        ctx: &Context,
        channels: &[String],
    ) -> Result<Box<dyn crate::driver::PubSubStream>> {
        self.core().driver.subscribe(ctx, channels).await
    }

    pub async fn command_catalog(&self, ctx: &Context) -> Result<HashMap<String, CommandInfo>> {
        self.core().driver.command_catalog(ctx).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core().driver.pool_stats()
    }

    /// Check that `new` is a legal replacement for the running configuration.
    pub fn validate_reload(&self, new: &BackendConfig) -> Result<()> {
        self.core()
            .config
            .read()
            .validate_reload(new)
            .map_err(Error::Config)
    }

    /// Validate and apply a replacement configuration in place.
    pub fn reload(&self, new: &BackendConfig) -> Result<()> {
        let mut new = new.clone();
        new.normalize();
        self.validate_reload(&new)?;
        self.apply_reload(&new);
        Ok(())
    }

    /// Apply an already-validated replacement configuration. Every scalar
    /// change goes through the driver's in-place setters; breaker
    /// transitions install, reconfigure or remove per-shard limiters.
    pub fn apply_reload(&self, new: &BackendConfig) {
        let core = self.core();
        let current = core.config.read().clone();

        if current.username != new.username || current.password != new.password {
            core.driver.set_credentials(&new.username, &new.password);
        }

        if current.max_retries != new.max_retries
            || current.min_retry_backoff_in_ms != new.min_retry_backoff_in_ms
            || current.max_retry_backoff_in_ms != new.max_retry_backoff_in_ms
        {
            core.driver.set_retry_policy(RetryPolicy {
                max_retries: new.max_retries,
                min_backoff: millis(new.min_retry_backoff_in_ms),
                max_backoff: millis(new.max_retry_backoff_in_ms),
            });
        }

        if current.dial_timeout_in_ms != new.dial_timeout_in_ms
            || current.read_timeout_in_ms != new.read_timeout_in_ms
            || current.write_timeout_in_ms != new.write_timeout_in_ms
        {
            core.driver.set_timeouts(Timeouts {
                dial: millis(new.dial_timeout_in_ms),
                read: millis(new.read_timeout_in_ms),
                write: millis(new.write_timeout_in_ms),
            });
        }

        if current.pool_size != new.pool_size
            || current.min_idle_conns != new.min_idle_conns
            || current.max_idle_conns != new.max_idle_conns
            || current.max_conn_age_in_ms != new.max_conn_age_in_ms
            || current.pool_timeout_in_ms != new.pool_timeout_in_ms
            || current.idle_timeout_in_ms != new.idle_timeout_in_ms
            || current.idle_check_frequency_in_ms != new.idle_check_frequency_in_ms
        {
            core.driver.set_pool_limits(PoolLimits {
                pool_size: new.pool_size,
                min_idle_conns: new.min_idle_conns,
                max_idle_conns: new.max_idle_conns,
                max_conn_age: millis(new.max_conn_age_in_ms),
                pool_timeout: millis(new.pool_timeout_in_ms),
                idle_timeout: millis(new.idle_timeout_in_ms),
                idle_check_frequency: millis(new.idle_check_frequency_in_ms),
            });
        }

        if new.hystrix_enabled {
            // Reinstall when the settings changed or breakers were off.
            if !current.hystrix_enabled || current.hystrix != new.hystrix {
                for shard in core.driver.shards() {
                    let key = breaker_key(&shard.addr());
                    breaker::reconfigure_circuit(&key, breaker_settings(&key, &new.hystrix));
                    shard.set_limiter(Some(Limiter::new(key, core.policy.clone())));
                }
                debug!(backend = %current.name(), "reinstalled node breakers");
            }
        } else {
            for shard in core.driver.shards() {
                shard.set_limiter(None);
            }
        }

        if self.is_cluster() {
            if current.max_redirects != new.max_redirects {
                core.driver.set_max_redirects(new.max_redirects);
            }
            if current.read_mode != new.read_mode {
                let (read_only, by_latency, randomly) = new.read_mode.routing_flags();
                core.driver.set_read_routing(read_only, by_latency, randomly);
            }
        }

        *core.config.write() = new.clone();
    }

    pub async fn close(&self) -> Result<()> {
        self.core().driver.close().await
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("cluster", &self.is_cluster())
            .finish()
    }
}
