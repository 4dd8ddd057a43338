//! Telemetry contracts: logging and stats emission.
//!
//! Both are narrow interfaces the host service implements; the crate ships a
//! no-op implementation of each plus a logger that forwards to `tracing`.

use crate::error::Error;
use std::time::Duration;

pub(crate) const METRIC_ERROR: &str = "error";
pub(crate) const METRIC_ELAPSED: &str = "elapsed";
pub(crate) const METRIC_SHUTDOWN: &str = "shutdown";
pub(crate) const METRIC_POOL_ACTIVE: &str = "pool_active";
pub(crate) const METRIC_POOL_TOTAL: &str = "pool_total";

pub(crate) const TAG_HOST_PREFIX: &str = "host:";
pub(crate) const TAG_CMD_PREFIX: &str = "cmd:";
pub(crate) const TAG_FUNC_DO: &str = "func:do";
pub(crate) const TAG_FUNC_PIPELINE: &str = "func:pipeline";
pub(crate) const TAG_FUNC_RUN: &str = "func:run";
pub(crate) const TAG_FUNC_QUEUE_SHADOW: &str = "func:queue_load_test";
pub(crate) const TAG_BREAKER_ERROR: &str = "func:breaker_error";
pub(crate) const TAG_BREAKER_TIMEOUT: &str = "func:breaker_timeout";
pub(crate) const TAG_BREAKER_CIRCUIT_OPEN: &str = "func:breaker_circuit_open";
pub(crate) const TAG_BREAKER_MAX_CONCURRENCY: &str = "func:breaker_max_concurrency";
pub(crate) const TAG_TIMEOUT_TRUE: &str = "timeout:true";
pub(crate) const TAG_TIMEOUT_FALSE: &str = "timeout:false";

/// Logging contract implemented by the host service.
pub trait Logger: Send + Sync {
    /// Log an error message.
    fn error(&self, msg: &str);

    /// Log a warning message.
    fn warn(&self, msg: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// A protected dependency was judged unhealthy by its breaker.
    fn service_down(&self, name: &str, err: &Error);

    /// A call's context was cancelled or expired.
    fn context_error(&self, name: &str, err: &Error);
}

/// Stats contract implemented by the host service.
pub trait StatsSink: Send + Sync {
    /// Increment a counter by one.
    fn incr(&self, metric: &str, tags: &[String]);

    /// Record a point-in-time value.
    fn gauge(&self, metric: &str, value: f64, tags: &[String]);

    /// Record the duration of an event.
    fn duration(&self, metric: &str, elapsed: Duration, tags: &[String]);
}

/// A [`Logger`] that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn error(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn service_down(&self, _name: &str, _err: &Error) {}
    fn context_error(&self, _name: &str, _err: &Error) {}
}

/// A [`StatsSink`] that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr(&self, _metric: &str, _tags: &[String]) {}
    fn gauge(&self, _metric: &str, _value: f64, _tags: &[String]) {}
    fn duration(&self, _metric: &str, _elapsed: Duration, _tags: &[String]) {}
}

/// The default [`Logger`]: forwards to the `tracing` ecosystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn service_down(&self, name: &str, err: &Error) {
        tracing::warn!(service = name, error = %err, "service down");
    }

    fn context_error(&self, name: &str, err: &Error) {
        tracing::warn!(service = name, error = %err, "context ended before completion");
    }
}

pub(crate) fn host_tag(name: &str) -> String {
    format!("{TAG_HOST_PREFIX}{name}")
}

pub(crate) fn cmd_tag(name: &str) -> String {
    format!("{TAG_CMD_PREFIX}{name}")
}
