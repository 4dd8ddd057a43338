//! One configured backend plus its telemetry: catalog cache, duration
//! metrics, pool statistics reporting and bounded shutdown.

use crate::backend::Backend;
use crate::config::{BackendConfig, DEFAULT_SHUTDOWN_TIMEOUT, POOL_REPORT_INTERVAL};
use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::limiter::BreakerPolicy;
use crate::script::Script;
use crate::telemetry::{
    cmd_tag, host_tag, Logger, StatsSink, METRIC_ELAPSED, METRIC_ERROR, METRIC_SHUTDOWN,
    METRIC_POOL_ACTIVE, METRIC_POOL_TOTAL, TAG_FUNC_DO, TAG_FUNC_PIPELINE, TAG_FUNC_RUN,
    TAG_TIMEOUT_FALSE, TAG_TIMEOUT_TRUE,
};
use crate::types::{CommandInfo, Context, PoolStats, ReplyPair, SubscribeMessage, Subscription, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const REDIS_EVAL: &str = "EVAL";
const REDIS_EVALSHA: &str = "EVALSHA";
const REDIS_ERR_NOSCRIPT: &str = "NOSCRIPT ";

/// A single backend with instrumentation. The connector holds one for the
/// primary and one per shadow.
pub(crate) struct Client {
    backend: Backend,
    name: String,
    cmd_cache: HashMap<String, CommandInfo>,
    stats: Arc<dyn StatsSink>,
    logger: Arc<dyn Logger>,
    close_token: CancellationToken,
}

impl Client {
    /// Open a backend and fetch its command catalog.
    ///
    /// The catalog fetch is best-effort: a backend that cannot report its
    /// catalog still works, but read-only classification is unavailable.
    pub async fn connect(
        ctx: &Context,
        config: &BackendConfig,
        factory: &dyn DriverFactory,
        stats: Arc<dyn StatsSink>,
        logger: Arc<dyn Logger>,
        policy: BreakerPolicy,
    ) -> Result<Arc<Client>> {
        let mut config = config.clone();
        config.normalize();
        config.validate().map_err(Error::Config)?;

        let backend = Backend::connect(&config, factory, policy)?;
        let cmd_cache = backend.command_catalog(ctx).await.unwrap_or_default();

        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let client = Arc::new(Client {
            name: backend.name(),
            backend,
            cmd_cache,
            stats,
            logger,
            close_token: CancellationToken::new(),
        });
        client.spawn_pool_monitor();

        Ok(client)
    }

    /// Canonical identity for reload matching and telemetry tags.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> BackendConfig {
        self.backend.config()
    }

    /// Whether read-only commands bypass shadow fan-out for this backend.
    pub fn ignore_read_only(&self) -> bool {
        self.backend.config().ignore_read_only
    }

    /// Apply a replacement configuration to the running backend.
    pub fn reload(&self, config: &BackendConfig) -> Result<()> {
        self.backend.reload(config)
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn tags(&self, extra: &[&str]) -> Vec<String> {
        let mut tags = Vec::with_capacity(1 + extra.len());
        tags.push(host_tag(&self.name));
        tags.extend(extra.iter().map(|t| t.to_string()));
        tags
    }

    /// Whether the named command is classified read-only by the cached
    /// catalog. Misses surface as [`Error::NoCommandCache`].
    pub fn is_command_readonly(&self, cmd: &str) -> Result<bool> {
        if self.cmd_cache.is_empty() {
            return Err(Error::NoCommandCache);
        }
        match self.cmd_cache.get(cmd.to_uppercase().as_str()) {
            Some(info) => Ok(info.read_only),
            None => Err(Error::NoCommandCache),
        }
    }

    /// Send one command to a read/write node.
    pub async fn do_cmd(&self, ctx: &Context, cmd: &str, args: &[Value]) -> Result<Value> {
        let start = Instant::now();

        let mut argv = Vec::with_capacity(1 + args.len());
        argv.push(Value::from(cmd));
        argv.extend_from_slice(args);
        let result = self.call(ctx, &argv).await;

        let cmd_tag = cmd_tag(cmd);
        self.stats.duration(
            METRIC_ELAPSED,
            start.elapsed(),
            &self.tags(&[TAG_FUNC_DO, cmd_tag.as_str()]),
        );
        result
    }

    /// Send pipelined commands; one reply slot per command, in input order.
    pub async fn pipeline(&self, ctx: &Context, commands: &[Vec<Value>]) -> Result<Vec<ReplyPair>> {
        let start = Instant::now();

        if let Err(err) = self.check_caller_ctx(ctx) {
            return Err(err);
        }
        let results = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.logger.context_error(&self.name, &Error::Cancelled);
                return Err(Error::Cancelled);
            }
            results = self.backend.exec_pipeline(ctx, commands) => results,
        };

        let replies = results
            .into_iter()
            .map(|result| match result {
                Ok(value) => ReplyPair { value, error: None },
                Err(err) => ReplyPair {
                    value: Value::Nil,
                    error: Some(err),
                },
            })
            .collect();

        self.stats.duration(
            METRIC_ELAPSED,
            start.elapsed(),
            &self.tags(&[TAG_FUNC_PIPELINE]),
        );
        Ok(replies)
    }

    /// Execute a script: the hash form first, falling back to the source
    /// form when the server does not know the script.
    pub async fn run(&self, ctx: &Context, script: &Script, keys_and_args: &[Value]) -> Result<Value> {
        let start = Instant::now();

        let mut argv = vec![Value::from(REDIS_EVALSHA)];
        argv.extend(script.hash_and_args(keys_and_args));
        let mut result = self.call(ctx, &argv).await;

        if let Err(ref err) = result {
            if err.has_server_prefix(REDIS_ERR_NOSCRIPT) {
                let mut argv = vec![Value::from(REDIS_EVAL)];
                argv.extend(script.script_and_args(keys_and_args));
                result = self.call(ctx, &argv).await;
                if let Err(ref err) = result {
                    self.stats.incr(METRIC_ERROR, &self.tags(&[TAG_FUNC_RUN]));
                    self.logger
                        .warn(&format!("unable to run script {}: {err}", script.hash()));
                }
            }
        }

        self.stats.duration(
            METRIC_ELAPSED,
            start.elapsed(),
            &self.tags(&[TAG_FUNC_RUN]),
        );
        result
    }

    /// Publish a message to a channel.
    pub async fn publish(&self, ctx: &Context, channel: &str, message: Value) -> Result<Value> {
        self.check_caller_ctx(ctx)?;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.logger.context_error(&self.name, &Error::Cancelled);
                Err(Error::Cancelled)
            }
            result = self.backend.publish(ctx, channel, message) => result,
        }
    }

    /// Subscribe to channels. A reader task forwards messages onto the
    /// returned buffered channel until the upstream stream closes or the
    /// subscription is dropped.
    pub async fn subscribe(
        &self,
        ctx: &Context,
        buffer: usize,
        channels: &[String],
    ) -> Result<Subscription> {
        let mut stream = self.backend.subscribe(ctx, channels).await?;

        let (tx, rx) = mpsc::channel::<SubscribeMessage>(buffer.max(1));
        let stop = CancellationToken::new();
        let reader_stop = stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_stop.cancelled() => {
                        stream.unsubscribe().await;
                        break;
                    }
                    message = stream.next_message() => match message {
                        Some(message) => {
                            if tx.send(message).await.is_err() {
                                stream.unsubscribe().await;
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Dropping the sender closes the caller's channel.
        });

        Ok(Subscription { messages: rx, stop })
    }

    /// Current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.backend.pool_stats()
    }

    /// Close the backend, waiting no longer than the context allows
    /// (5 s by default).
    pub async fn shut_down(&self, ctx: &Context) {
        self.close_token.cancel();

        let deadline = ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + DEFAULT_SHUTDOWN_TIMEOUT);

        let driver = self.backend.driver();
        let logger = self.logger.clone();
        let close = tokio::spawn(async move {
            if let Err(err) = driver.close().await {
                logger.error(&format!("failed to close driver: {err}"));
            }
        });

        tokio::select! {
            _ = close => {
                self.stats.incr(METRIC_SHUTDOWN, &self.tags(&[TAG_TIMEOUT_FALSE]));
                self.logger.info(&format!("backend {} shut down gracefully", self.name));
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                self.stats.incr(METRIC_SHUTDOWN, &self.tags(&[TAG_TIMEOUT_TRUE]));
                self.logger.warn(&format!("backend {} shutdown timed out", self.name));
            }
            _ = ctx.cancelled() => {
                self.stats.incr(METRIC_SHUTDOWN, &self.tags(&[TAG_TIMEOUT_TRUE]));
                self.logger.warn(&format!("backend {} shutdown cancelled", self.name));
            }
        }
    }

    fn check_caller_ctx(&self, ctx: &Context) -> Result<()> {
        if ctx.is_cancelled() {
            self.logger.context_error(&self.name, &Error::Cancelled);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Dispatch one command, racing the caller's cancellation outside the
    /// breaker so a cancelled call never feeds a circuit.
    async fn call(&self, ctx: &Context, argv: &[Value]) -> Result<Value> {
        self.check_caller_ctx(ctx)?;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.logger.context_error(&self.name, &Error::Cancelled);
                Err(Error::Cancelled)
            }
            result = self.backend.exec(ctx, argv) => result,
        }
    }

    fn spawn_pool_monitor(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let token = self.close_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POOL_REPORT_INTERVAL);
            interval.tick().await; // immediate first tick carries no data
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(client) = client.upgrade() else { break };
                let stats = client.pool_stats();
                let active = stats.total_conns.saturating_sub(stats.idle_conns);
                client
                    .stats
                    .gauge(METRIC_POOL_ACTIVE, f64::from(active), &client.tags(&[]));
                client
                    .stats
                    .gauge(METRIC_POOL_TOTAL, f64::from(stats.total_conns), &client.tags(&[]));
            }
            debug!("pool monitor stopped");
        });
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("commands_cached", &self.cmd_cache.len())
            .finish()
    }
}
