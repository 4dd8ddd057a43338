//! The connector: public command surface, shadow fan-out and the reload
//! coordinator.
//!
//! Every mutating call executes against the primary backend on the caller's
//! task and enqueues one mirrored task per shadow backend on the scheduler.
//! Shadow failures never reach the caller; primary breaker rejections are
//! classified structurally and emitted as counters and warnings.

use crate::client::Client;
use crate::config::{addrs_equal, millis, BackendConfig, ConnectorConfig};
use crate::configurer::{Configurer, StaticConfigurer};
use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::limiter::BreakerPolicy;
use crate::scheduler::{Scheduler, SchedulerOptions, ShadowTask};
use crate::script::Script;
use crate::telemetry::{
    Logger, NoopStats, StatsSink, TracingLogger, METRIC_ERROR, TAG_BREAKER_CIRCUIT_OPEN,
    TAG_BREAKER_ERROR, TAG_BREAKER_MAX_CONCURRENCY, TAG_BREAKER_TIMEOUT, TAG_FUNC_QUEUE_SHADOW,
};
use crate::types::{Context, ReplyPair, Subscription, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Builder assembling a [`Connector`].
pub struct ConnectorBuilder {
    factory: Arc<dyn DriverFactory>,
    stats: Arc<dyn StatsSink>,
    logger: Arc<dyn Logger>,
    policy: Option<BreakerPolicy>,
}

impl ConnectorBuilder {
    /// Start a builder over the given driver factory.
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            stats: Arc::new(NoopStats),
            logger: Arc::new(TracingLogger),
            policy: None,
        }
    }

    /// Install a stats sink.
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// Install a logger.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Override the breaker outcome policy.
    pub fn with_breaker_policy(mut self, policy: BreakerPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Connect against a dynamic configuration source.
    pub async fn connect(self, ctx: &Context, configurer: Arc<dyn Configurer>) -> Result<Arc<Connector>> {
        Connector::connect(ctx, self, configurer).await
    }

    /// Connect with a fixed configuration; change notifications never fire.
    pub async fn connect_static(self, ctx: &Context, config: ConnectorConfig) -> Result<Arc<Connector>> {
        let configurer = Arc::new(StaticConfigurer::new(config));
        Connector::connect(ctx, self, configurer).await
    }
}

/// A resilient client multiplexing commands across a primary backend and a
/// reloadable set of shadow backends.
pub struct Connector {
    primary: Arc<Client>,
    shadows: RwLock<Vec<Arc<Client>>>,
    strict_shadows: AtomicBool,
    scheduler: Arc<Scheduler>,
    scheduler_options: SchedulerOptions,
    factory: Arc<dyn DriverFactory>,
    stats: Arc<dyn StatsSink>,
    logger: Arc<dyn Logger>,
    policy: BreakerPolicy,
    closed: AtomicBool,
}

impl Connector {
    /// Build a connector with a fixed configuration.
    pub async fn connect_static(
        ctx: &Context,
        factory: Arc<dyn DriverFactory>,
        config: ConnectorConfig,
    ) -> Result<Arc<Connector>> {
        ConnectorBuilder::new(factory).connect_static(ctx, config).await
    }

    /// Start a builder over the given driver factory.
    pub fn builder(factory: Arc<dyn DriverFactory>) -> ConnectorBuilder {
        ConnectorBuilder::new(factory)
    }

    async fn connect(
        ctx: &Context,
        builder: ConnectorBuilder,
        configurer: Arc<dyn Configurer>,
    ) -> Result<Arc<Connector>> {
        let ConnectorBuilder {
            factory,
            stats,
            logger,
            policy,
        } = builder;
        let policy =
            policy.unwrap_or_else(|| BreakerPolicy::default().with_logger(logger.clone()));

        let mut config = configurer.unmarshal()?;
        config.normalize_and_validate().map_err(Error::Config)?;

        let primary = Client::connect(
            ctx,
            &config.main,
            factory.as_ref(),
            stats.clone(),
            logger.clone(),
            policy.clone(),
        )
        .await?;

        let mut shadows = Vec::with_capacity(config.load_tests.len());
        for shadow_config in &config.load_tests {
            shadows.push(
                Client::connect(
                    ctx,
                    shadow_config,
                    factory.as_ref(),
                    stats.clone(),
                    logger.clone(),
                    policy.clone(),
                )
                .await?,
            );
        }

        let scheduler_options = SchedulerOptions {
            max_queue: config.scheduler_channel_size,
            max_workers: config.scheduler_worker_number,
            idle_timeout: millis(config.scheduler_worker_idle_timeout_in_ms),
        }
        .normalize();
        let scheduler = Scheduler::new(scheduler_options);
        tokio::spawn(scheduler.clone().run());

        let connector = Arc::new(Connector {
            primary,
            shadows: RwLock::new(shadows),
            strict_shadows: AtomicBool::new(config.process_all_load_test_packets),
            scheduler,
            scheduler_options,
            factory,
            stats,
            logger,
            policy,
            closed: AtomicBool::new(false),
        });

        // Reload callback: re-read, validate, apply. A dropped connector
        // silently unregisters by upgrading to nothing.
        let weak = Arc::downgrade(&connector);
        let change_source = configurer.clone();
        configurer.on_change(Box::new(move || {
            let weak = weak.clone();
            let change_source = change_source.clone();
            Box::pin(async move {
                let Some(connector) = weak.upgrade() else {
                    return Ok(());
                };
                let mut config = change_source.unmarshal()?;
                config.normalize_and_validate().map_err(Error::Config)?;
                connector.reload(&config).await
            })
        }));

        Ok(connector)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    /// Snapshot of the current shadow set.
    fn shadow_snapshot(&self) -> Vec<Arc<Client>> {
        self.shadows.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn shadow_count(&self) -> usize {
        self.shadows.read().len()
    }

    #[cfg(test)]
    pub(crate) fn shadow_names(&self) -> Vec<String> {
        self.shadows
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Mirror one call onto every configured shadow via the scheduler.
    ///
    /// In strict mode the push blocks on queue space; otherwise a full queue
    /// drops the task and emits the drop counter.
    async fn queue_shadow<F, Fut>(&self, make: F)
    where
        F: Fn(Context, Arc<Client>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let strict = self.strict_shadows.load(Ordering::Acquire);
        for client in self.shadow_snapshot() {
            let drop_tags = client.tags(&[TAG_FUNC_QUEUE_SHADOW]);
            let make = make.clone();
            let logger = self.logger.clone();
            let task: ShadowTask = Box::new(move |task_ctx: Context| {
                Box::pin(async move {
                    if task_ctx.is_cancelled() {
                        logger.error("context cancelled before load test could be carried out");
                        return;
                    }
                    make(task_ctx, client).await;
                })
            });

            if strict {
                if self.scheduler.enqueue_blocking(task).await.is_err() {
                    self.logger.error("shadow scheduler is closed, dropping load test request");
                }
                continue;
            }

            if let Err(err) = self.scheduler.try_enqueue(task) {
                self.stats.incr(METRIC_ERROR, &drop_tags);
                self.logger.error(&format!(
                    "load test queue is full, dropping load test request: {err}"
                ));
            }
        }
    }

    /// Classify a primary-path breaker rejection and emit its counter and
    /// warning. Non-breaker errors pass through silently.
    fn observe_breaker_error<T>(&self, result: &Result<T>) {
        let Err(err) = result else { return };
        if !err.is_breaker() {
            return;
        }

        self.stats
            .incr(METRIC_ERROR, &self.primary.tags(&[TAG_BREAKER_ERROR]));
        match err {
            Error::BreakerTimeout { .. } => {
                self.stats
                    .incr(METRIC_ERROR, &self.primary.tags(&[TAG_BREAKER_TIMEOUT]));
                self.logger.warn(&format!("breaker timeout: {err}"));
            }
            Error::CircuitOpen { .. } => {
                self.stats
                    .incr(METRIC_ERROR, &self.primary.tags(&[TAG_BREAKER_CIRCUIT_OPEN]));
                self.logger.warn(&format!("breaker circuit open: {err}"));
            }
            Error::MaxConcurrency { .. } => {
                self.stats.incr(
                    METRIC_ERROR,
                    &self.primary.tags(&[TAG_BREAKER_MAX_CONCURRENCY]),
                );
                self.logger.warn(&format!("breaker max concurrency: {err}"));
            }
            _ => {
                self.logger.warn(&format!("breaker error: {err}"));
            }
        }
    }

    /// Send a command to a read/write node of the primary, mirroring it to
    /// every shadow.
    pub async fn do_cmd(&self, ctx: &Context, cmd: &str, args: &[Value]) -> Result<Value> {
        self.ensure_open()?;

        if self.primary.ignore_read_only() {
            if let Ok(true) = self.primary.is_command_readonly(cmd) {
                return self.primary.do_cmd(ctx, cmd, args).await;
            }
        }

        let shadow_cmd = cmd.to_string();
        let shadow_args: Arc<[Value]> = args.to_vec().into();
        self.queue_shadow(move |task_ctx, client| {
            let cmd = shadow_cmd.clone();
            let args = shadow_args.clone();
            async move {
                let _ = client.do_cmd(&task_ctx, &cmd, &args).await;
            }
        })
        .await;

        let result = self.primary.do_cmd(ctx, cmd, args).await;
        self.observe_breaker_error(&result);
        result
    }

    /// Alias of [`Connector::do_cmd`], kept for backward compatibility; it
    /// routes identically.
    pub async fn do_read_only(&self, ctx: &Context, cmd: &str, args: &[Value]) -> Result<Value> {
        self.do_cmd(ctx, cmd, args).await
    }

    /// Send pipelined commands to the primary, mirroring the whole pipeline
    /// to every shadow. Replies are in input order; the aggregate error is
    /// derivable via [`crate::types::first_error`].
    pub async fn pipeline(&self, ctx: &Context, commands: &[Vec<Value>]) -> Result<Vec<ReplyPair>> {
        self.ensure_open()?;

        let shadow_commands: Arc<[Vec<Value>]> = commands.to_vec().into();
        self.queue_shadow(move |task_ctx, client| {
            let commands = shadow_commands.clone();
            async move {
                let _ = client.pipeline(&task_ctx, &commands).await;
            }
        })
        .await;

        let result = self.primary.pipeline(ctx, commands).await;
        match &result {
            Ok(replies) => {
                if let Some(err) = crate::types::first_error(replies) {
                    self.observe_breaker_error::<()>(&Err(err));
                }
            }
            Err(_) => self.observe_breaker_error(&result),
        }
        result
    }

    /// Alias of [`Connector::pipeline`], kept for backward compatibility.
    pub async fn pipeline_read_only(
        &self,
        ctx: &Context,
        commands: &[Vec<Value>],
    ) -> Result<Vec<ReplyPair>> {
        self.pipeline(ctx, commands).await
    }

    /// Execute a script on the primary with hash-then-source fallback.
    /// Shadows receive a single attempt in the hash form.
    pub async fn run(&self, ctx: &Context, script: &Script, keys_and_args: &[Value]) -> Result<Value> {
        self.ensure_open()?;

        let shadow_args: Arc<[Value]> = script.hash_and_args(keys_and_args).into();
        self.queue_shadow(move |task_ctx, client| {
            let args = shadow_args.clone();
            async move {
                let _ = client.do_cmd(&task_ctx, "EVALSHA", &args).await;
            }
        })
        .await;

        let result = self.primary.run(ctx, script, keys_and_args).await;
        self.observe_breaker_error(&result);
        result
    }

    /// Alias of [`Connector::run`], kept for backward compatibility.
    pub async fn run_read_only(
        &self,
        ctx: &Context,
        script: &Script,
        keys_and_args: &[Value],
    ) -> Result<Value> {
        self.run(ctx, script, keys_and_args).await
    }

    /// Publish to a channel on the primary, mirroring to every shadow.
    pub async fn publish(&self, ctx: &Context, channel: &str, message: Value) -> Result<Value> {
        self.ensure_open()?;

        let shadow_channel = channel.to_string();
        let shadow_message = message.clone();
        self.queue_shadow(move |task_ctx, client| {
            let channel = shadow_channel.clone();
            let message = shadow_message.clone();
            async move {
                let _ = client.publish(&task_ctx, &channel, message).await;
            }
        })
        .await;

        let result = self.primary.publish(ctx, channel, message).await;
        self.observe_breaker_error(&result);
        result
    }

    /// Subscribe to channels on the primary. Each shadow opens a mirrored
    /// subscription with the same buffer size and keeps it open until
    /// shutdown, like the primary one.
    pub async fn subscribe(
        &self,
        ctx: &Context,
        buffer: usize,
        channels: &[String],
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let shadow_channels: Arc<[String]> = channels.to_vec().into();
        self.queue_shadow(move |task_ctx, client| {
            let channels = shadow_channels.clone();
            async move {
                let Ok(mut subscription) = client.subscribe(&task_ctx, buffer, &channels).await
                else {
                    return;
                };
                // The mirrored subscription stays open and drained until
                // the scheduler context is cancelled at shutdown.
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = task_ctx.cancelled() => break,
                            message = subscription.recv() => {
                                if message.is_none() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        })
        .await;

        let result = self.primary.subscribe(ctx, buffer, channels).await;
        self.observe_breaker_error(&result);
        result
    }

    /// Shut down: close the primary, stop the scheduler and wait for its
    /// in-flight workers, then close every shadow concurrently. Subsequent
    /// calls fail with [`Error::ClientClosed`].
    pub async fn shut_down(&self, ctx: &Context) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.primary.shut_down(ctx).await;
        self.scheduler.shut_down().await;

        let shadows = std::mem::take(&mut *self.shadows.write());
        for shadow in shadows {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                shadow.shut_down(&ctx).await;
            });
        }
    }

    /// Apply a validated configuration to the live connector.
    pub(crate) async fn reload(&self, config: &ConnectorConfig) -> Result<()> {
        if !config.hot_reload {
            self.logger
                .warn("hot reload is disabled; ignoring configuration change");
            return Ok(());
        }

        let new_options = SchedulerOptions {
            max_queue: config.scheduler_channel_size,
            max_workers: config.scheduler_worker_number,
            idle_timeout: millis(config.scheduler_worker_idle_timeout_in_ms),
        }
        .normalize();
        if new_options != self.scheduler_options {
            return Err(Error::Config(
                "dual write worker number/channel size change is not allowed when reloading".into(),
            ));
        }

        // Primary first: a rejected primary change (including any address
        // change) leaves the connector fully operational on the old config,
        // and keeps the primary address set stable for the shadow checks.
        if let Err(err) = self.primary.reload(&config.main) {
            self.logger
                .warn(&format!("unable to reload primary, keeping old client: {err}"));
            return Err(err);
        }

        match self.rebuild_shadows(config).await {
            Ok(()) => {
                self.strict_shadows
                    .store(config.process_all_load_test_packets, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.logger
                    .warn(&format!("unable to reload shadow set, keeping old set: {err}"));
                Err(err)
            }
        }
    }

    /// Reconcile the shadow set by canonical-name identity.
    ///
    /// Two phases: validate every new entry (and construct the genuinely new
    /// ones) without touching live state, then apply in-place reloads and
    /// swap the list. A failure in phase one closes whatever was freshly
    /// constructed and leaves the previous set intact.
    async fn rebuild_shadows(&self, config: &ConnectorConfig) -> Result<()> {
        enum Plan {
            Reuse(Arc<Client>, BackendConfig),
            Fresh(Arc<Client>),
        }

        let primary_addrs = self.primary.config().addrs;

        let mut pool: HashMap<String, Vec<Arc<Client>>> = HashMap::new();
        for client in self.shadow_snapshot() {
            pool.entry(client.name().to_string()).or_default().push(client);
        }

        let mut plans = Vec::with_capacity(config.load_tests.len());
        let mut created: Vec<Arc<Client>> = Vec::new();

        let abort = |created: Vec<Arc<Client>>| {
            for client in created {
                tokio::spawn(async move {
                    client.shut_down(&Context::background()).await;
                });
            }
        };

        for shadow_config in &config.load_tests {
            let mut shadow_config = shadow_config.clone();
            shadow_config.normalize();

            if addrs_equal(&shadow_config.addrs, &primary_addrs) {
                abort(created);
                return Err(Error::Config(
                    "can't share the same address with the main client".into(),
                ));
            }

            let matched = pool
                .get_mut(&shadow_config.name())
                .and_then(|clients| clients.pop());
            match matched {
                Some(existing) => {
                    if let Err(err) = existing.backend().validate_reload(&shadow_config) {
                        abort(created);
                        return Err(err);
                    }
                    plans.push(Plan::Reuse(existing, shadow_config));
                }
                None => {
                    match Client::connect(
                        &Context::background(),
                        &shadow_config,
                        self.factory.as_ref(),
                        self.stats.clone(),
                        self.logger.clone(),
                        self.policy.clone(),
                    )
                    .await
                    {
                        Ok(client) => {
                            created.push(client.clone());
                            plans.push(Plan::Fresh(client));
                        }
                        Err(err) => {
                            abort(created);
                            return Err(err);
                        }
                    }
                }
            }
        }

        // Phase two: validated in-place reloads cannot fail.
        let mut new_shadows = Vec::with_capacity(plans.len());
        for plan in plans {
            match plan {
                Plan::Reuse(client, shadow_config) => {
                    client.backend().apply_reload(&shadow_config);
                    new_shadows.push(client);
                }
                Plan::Fresh(client) => new_shadows.push(client),
            }
        }

        let unmatched: Vec<Arc<Client>> = pool.into_values().flatten().collect();
        *self.shadows.write() = new_shadows;

        for leftover in unmatched {
            warn!(backend = %leftover.name(), "shutting down removed shadow backend");
            tokio::spawn(async move {
                leftover.shut_down(&Context::background()).await;
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("primary", &self.primary.name())
            .field("shadows", &self.shadows.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
