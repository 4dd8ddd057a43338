//! The lower-layer contract: wire protocol, connection pooling and topology
//! are supplied by an external driver implementing these traits.
//!
//! The connector never speaks the wire protocol itself. It installs per-node
//! [`Limiter`]s into the driver's pools, applies configuration changes
//! through the grouped in-place setters, and otherwise treats the driver as
//! opaque. Drivers must honor the [`Context`] deadline inside command
//! execution so that an expired deadline surfaces from within the
//! breaker-protected call.
//!
//! An in-memory implementation for tests lives in
//! [`crate::testing::MemoryDriver`].

use crate::config::BackendConfig;
use crate::error::Result;
use crate::limiter::Limiter;
use crate::types::{CommandInfo, Context, PoolStats, SubscribeMessage, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Hook a driver calls whenever it creates the pool for a node, so that
/// dynamically discovered shards get breakers too.
pub type LimiterFactory = Arc<dyn Fn(&str) -> Limiter + Send + Sync>;

/// Retry behavior applied in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

/// Socket timeouts applied in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// Pool sizing and idle policy applied in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLimits {
    pub pool_size: u32,
    pub min_idle_conns: u32,
    pub max_idle_conns: u32,
    pub max_conn_age: Duration,
    pub pool_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_check_frequency: Duration,
}

/// Handle to one node of a driver's current roster.
pub trait ShardHandle: Send + Sync {
    /// The node's `host:port` address.
    fn addr(&self) -> String;

    /// Install or remove the admission limiter for this node's pool.
    fn set_limiter(&self, limiter: Option<Limiter>);
}

/// Stream of messages from an open subscription.
#[async_trait]
pub trait PubSubStream: Send {
    /// Next message, or `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<SubscribeMessage>;

    /// Tear the subscription down.
    async fn unsubscribe(&mut self);
}

/// One logical destination as seen by the connector: a single host or a
/// sharded cluster behind one pool-owning client.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Execute one command; `args[0]` is the command name.
    async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<Value>;

    /// Execute commands back to back, returning one result per command in
    /// input order.
    async fn exec_pipeline(&self, ctx: &Context, commands: &[Vec<Value>]) -> Vec<Result<Value>>;

    /// Publish a message to a channel.
    async fn publish(&self, ctx: &Context, channel: &str, message: Value) -> Result<Value>;

    /// Open a subscription to the given channels.
    async fn subscribe(&self, ctx: &Context, channels: &[String]) -> Result<Box<dyn PubSubStream>>;

    /// Fetch the server's command catalog, keyed by uppercase name.
    async fn command_catalog(&self, ctx: &Context) -> Result<HashMap<String, CommandInfo>>;

    /// Aggregate statistics of the underlying pool(s).
    fn pool_stats(&self) -> PoolStats;

    /// The current node roster. A single-host driver reports one shard.
    fn shards(&self) -> Vec<Arc<dyn ShardHandle>>;

    /// Close all pools. Further calls fail.
    async fn close(&self) -> Result<()>;

    // In-place reconfiguration. Changes apply to the running pool without
    // dropping usable connections.

    fn set_credentials(&self, username: &str, password: &str);
    fn set_retry_policy(&self, policy: RetryPolicy);
    fn set_timeouts(&self, timeouts: Timeouts);
    fn set_pool_limits(&self, limits: PoolLimits);

    /// Cluster topologies only; single-host drivers ignore this.
    fn set_max_redirects(&self, _max_redirects: u32) {}

    /// Cluster topologies only; single-host drivers ignore this.
    fn set_read_routing(&self, _read_only: bool, _route_by_latency: bool, _route_randomly: bool) {}
}

/// Opens drivers from backend configurations.
///
/// `limiter_factory` is present when the backend has breakers enabled; the
/// driver must invoke it for every node pool it creates (including shards
/// discovered later) and install the returned limiter.
pub trait DriverFactory: Send + Sync {
    fn open(
        &self,
        config: &BackendConfig,
        limiter_factory: Option<LimiterFactory>,
    ) -> Result<Arc<dyn Driver>>;
}
