//! In-memory driver: the test double for the lower-layer contract.
//!
//! Each simulated server is keyed by address and persists across driver
//! opens, so a "fresh client" against the same address observes earlier
//! writes. Servers support fault and latency injection and record every
//! command they perform.

use crate::config::{BackendConfig, ClientMode};
use crate::driver::{
    Driver, DriverFactory, LimiterFactory, PoolLimits, PubSubStream, RetryPolicy, ShardHandle,
    Timeouts,
};
use crate::error::{Error, Result};
use crate::limiter::Limiter;
use crate::script::Script;
use crate::types::{CommandInfo, Context, PoolStats, SubscribeMessage, Value};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn default_catalog() -> HashMap<String, CommandInfo> {
    let entries = [
        ("GET", 2, true),
        ("EXISTS", -2, true),
        ("TTL", 2, true),
        ("PING", -1, true),
        ("SET", -3, false),
        ("DEL", -2, false),
        ("INCR", 2, false),
        ("EVAL", -3, false),
        ("EVALSHA", -3, false),
        ("PUBLISH", 3, false),
    ];
    entries
        .into_iter()
        .map(|(name, arity, read_only)| {
            (
                name.to_string(),
                CommandInfo {
                    name: name.to_string(),
                    arity,
                    read_only,
                },
            )
        })
        .collect()
}

struct Subscriber {
    id: u64,
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<SubscribeMessage>,
}

/// One simulated server, shared by every driver opened against its address.
pub struct MemoryServer {
    addr: String,
    data: RwLock<HashMap<String, Bytes>>,
    scripts: RwLock<HashMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    commands: Mutex<Vec<Vec<Value>>>,
    fail_with: RwLock<Option<Error>>,
    latency: RwLock<Option<Duration>>,
}

impl MemoryServer {
    fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            data: RwLock::new(HashMap::new()),
            scripts: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            commands: Mutex::new(Vec::new()),
            fail_with: RwLock::new(None),
            latency: RwLock::new(None),
        })
    }

    /// Make every subsequent operation fail with a clone of `err`.
    pub fn fail_with(&self, err: Option<Error>) {
        *self.fail_with.write() = err;
    }

    /// Delay every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Every command this server performed, oldest first.
    pub fn commands(&self) -> Vec<Vec<Value>> {
        self.commands.lock().clone()
    }

    /// Names of every command this server performed, oldest first.
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|argv| argv.first().and_then(|v| v.as_str().map(str::to_uppercase)))
            .collect()
    }

    /// Direct read access for assertions.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    async fn perform(&self, ctx: &Context, argv: &[Value]) -> Result<Value> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            match ctx.remaining() {
                Some(remaining) if remaining < latency => {
                    tokio::time::sleep(remaining).await;
                    return Err(Error::DeadlineExceeded);
                }
                _ => tokio::time::sleep(latency).await,
            }
        }
        if ctx.deadline_exceeded() {
            return Err(Error::DeadlineExceeded);
        }

        if let Some(err) = self.fail_with.read().clone() {
            return Err(err);
        }

        self.commands.lock().push(argv.to_vec());

        let cmd = argv
            .first()
            .and_then(Value::as_str)
            .map(str::to_uppercase)
            .ok_or_else(|| Error::Server("ERR empty command".into()))?;
        let key = |idx: usize| -> Result<String> {
            argv.get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Server(format!("ERR wrong number of arguments for '{cmd}'")))
        };

        match cmd.as_str() {
            "PING" => Ok(Value::Status("PONG".into())),
            "SET" => {
                let k = key(1)?;
                let v = argv
                    .get(2)
                    .and_then(Value::as_bytes)
                    .map(Bytes::copy_from_slice)
                    .ok_or_else(|| Error::Server("ERR wrong number of arguments for 'SET'".into()))?;
                self.data.write().insert(k, v);
                Ok(Value::Status("OK".into()))
            }
            "GET" => Ok(self
                .data
                .read()
                .get(&key(1)?)
                .map(|v| Value::Bytes(v.clone()))
                .unwrap_or(Value::Nil)),
            "DEL" => {
                let mut removed = 0;
                let mut data = self.data.write();
                for arg in &argv[1..] {
                    if let Some(k) = arg.as_str() {
                        if data.remove(k).is_some() {
                            removed += 1;
                        }
                    }
                }
                Ok(Value::Int(removed))
            }
            "EXISTS" => {
                let exists = self.data.read().contains_key(&key(1)?);
                Ok(Value::Int(i64::from(exists)))
            }
            "INCR" => {
                let k = key(1)?;
                let mut data = self.data.write();
                let current = data
                    .get(&k)
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                let next = current + 1;
                data.insert(k, Bytes::from(next.to_string()));
                Ok(Value::Int(next))
            }
            "EVALSHA" => {
                let sha = key(1)?;
                let source = self.scripts.read().get(&sha).cloned();
                match source {
                    Some(source) => self.eval(&source, &argv[2..]),
                    None => Err(Error::Server(
                        "NOSCRIPT No matching script. Please use EVAL.".into(),
                    )),
                }
            }
            "EVAL" => {
                let source = key(1)?;
                let sha = Script::new(0, source.as_str()).hash().to_string();
                self.scripts.write().insert(sha, source.clone());
                self.eval(&source, &argv[2..])
            }
            other => Err(Error::Server(format!("ERR unknown command '{other}'"))),
        }
    }

    // A deliberately tiny script evaluator: enough for `return <int>`,
    // `return ARGV[i]` and `return KEYS[i]`.
    fn eval(&self, source: &str, count_keys_args: &[Value]) -> Result<Value> {
        let count = count_keys_args
            .first()
            .and_then(|v| {
                v.as_int()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(0)
            .max(0) as usize;
        let tail = count_keys_args.get(1..).unwrap_or(&[]);
        let key_count = count.min(tail.len());
        let keys = &tail[..key_count];
        let args = &tail[key_count..];

        let expr = source.trim().strip_prefix("return ").map(str::trim);
        match expr {
            Some(expr) => {
                if let Ok(n) = expr.parse::<i64>() {
                    return Ok(Value::Int(n));
                }
                if let Some(idx) = expr.strip_prefix("ARGV[").and_then(|s| s.strip_suffix(']')) {
                    let idx: usize = idx
                        .parse()
                        .map_err(|_| Error::Server("ERR bad ARGV index".into()))?;
                    let value = idx.checked_sub(1).and_then(|i| args.get(i)).cloned();
                    return Ok(value.unwrap_or(Value::Nil));
                }
                if let Some(idx) = expr.strip_prefix("KEYS[").and_then(|s| s.strip_suffix(']')) {
                    let idx: usize = idx
                        .parse()
                        .map_err(|_| Error::Server("ERR bad KEYS index".into()))?;
                    let value = idx.checked_sub(1).and_then(|i| keys.get(i)).cloned();
                    return Ok(value.unwrap_or(Value::Nil));
                }
                Ok(Value::Nil)
            }
            None => Ok(Value::Nil),
        }
    }

    fn publish(&self, channel: &str, message: &Value) -> Value {
        let payload = message
            .as_bytes()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let mut delivered = 0;
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            if subscriber.channels.contains(channel) {
                let sent = subscriber.tx.send(SubscribeMessage {
                    channel: channel.to_string(),
                    data: payload.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        Value::Int(delivered)
    }

    fn subscribe(self: &Arc<Self>, channels: &[String]) -> MemoryPubSub {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            channels: channels.iter().cloned().collect(),
            tx,
        });
        MemoryPubSub {
            server: self.clone(),
            id,
            rx,
        }
    }

    fn drop_subscriber(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("addr", &self.addr)
            .field("keys", &self.data.read().len())
            .finish()
    }
}

/// Stream of messages from a simulated subscription.
pub struct MemoryPubSub {
    server: Arc<MemoryServer>,
    id: u64,
    rx: mpsc::UnboundedReceiver<SubscribeMessage>,
}

#[async_trait]
impl PubSubStream for MemoryPubSub {
    async fn next_message(&mut self) -> Option<SubscribeMessage> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) {
        self.server.drop_subscriber(self.id);
        self.rx.close();
    }
}

/// One node of a memory driver: the server plus its installed limiter.
pub struct MemoryNode {
    addr: String,
    server: Arc<MemoryServer>,
    limiter: RwLock<Option<Limiter>>,
}

impl MemoryNode {
    async fn execute(&self, ctx: &Context, argv: Vec<Value>) -> Result<Value> {
        let limiter = self.limiter.read().clone();
        let server = self.server.clone();
        let op_ctx = ctx.clone();
        let op = async move { server.perform(&op_ctx, &argv).await };

        match limiter {
            Some(limiter) => {
                limiter.allow()?;
                limiter.execute(op).await
            }
            None => op.await,
        }
    }
}

impl ShardHandle for MemoryNode {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn set_limiter(&self, limiter: Option<Limiter>) {
        *self.limiter.write() = limiter;
    }
}

/// Everything applied through the in-place setters, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedTuning {
    pub credentials: Option<(String, String)>,
    pub retry: Option<RetryPolicy>,
    pub timeouts: Option<Timeouts>,
    pub pool_limits: Option<PoolLimits>,
    pub max_redirects: Option<u32>,
    pub read_routing: Option<(bool, bool, bool)>,
}

/// In-memory implementation of the driver contract.
pub struct MemoryDriver {
    nodes: Vec<Arc<MemoryNode>>,
    closed: AtomicBool,
    tuning: RwLock<AppliedTuning>,
}

impl MemoryDriver {
    fn route(&self, argv: &[Value]) -> &Arc<MemoryNode> {
        if self.nodes.len() == 1 {
            return &self.nodes[0];
        }
        match argv.get(1).and_then(Value::as_bytes) {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                &self.nodes[(hasher.finish() as usize) % self.nodes.len()]
            }
            None => &self.nodes[0],
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    /// Everything applied through the in-place setters so far.
    pub fn applied_tuning(&self) -> AppliedTuning {
        self.tuning.read().clone()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<Value> {
        self.check_open()?;
        self.route(args).execute(ctx, args.to_vec()).await
    }

    async fn exec_pipeline(&self, ctx: &Context, commands: &[Vec<Value>]) -> Vec<Result<Value>> {
        let mut results = Vec::with_capacity(commands.len());
        for argv in commands {
            results.push(self.exec(ctx, argv).await);
        }
        results
    }

    async fn publish(&self, ctx: &Context, channel: &str, message: Value) -> Result<Value> {
        self.check_open()?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.nodes[0].server.publish(channel, &message))
    }

    async fn subscribe(&self, ctx: &Context, channels: &[String]) -> Result<Box<dyn PubSubStream>> {
        self.check_open()?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Box::new(self.nodes[0].server.subscribe(channels)))
    }

    async fn command_catalog(&self, _ctx: &Context) -> Result<HashMap<String, CommandInfo>> {
        self.check_open()?;
        Ok(default_catalog())
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            total_conns: self.nodes.len() as u32,
            idle_conns: self.nodes.len() as u32,
            ..Default::default()
        }
    }

    fn shards(&self) -> Vec<Arc<dyn ShardHandle>> {
        self.nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn ShardHandle>)
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn set_credentials(&self, username: &str, password: &str) {
        self.tuning.write().credentials = Some((username.to_string(), password.to_string()));
    }

    fn set_retry_policy(&self, policy: RetryPolicy) {
        self.tuning.write().retry = Some(policy);
    }

    fn set_timeouts(&self, timeouts: Timeouts) {
        self.tuning.write().timeouts = Some(timeouts);
    }

    fn set_pool_limits(&self, limits: PoolLimits) {
        self.tuning.write().pool_limits = Some(limits);
    }

    fn set_max_redirects(&self, max_redirects: u32) {
        self.tuning.write().max_redirects = Some(max_redirects);
    }

    fn set_read_routing(&self, read_only: bool, route_by_latency: bool, route_randomly: bool) {
        self.tuning.write().read_routing = Some((read_only, route_by_latency, route_randomly));
    }
}

/// Factory keeping one [`MemoryServer`] per address across opens.
#[derive(Default)]
pub struct MemoryDriverFactory {
    servers: DashMap<String, Arc<MemoryServer>>,
    opened: Mutex<Vec<(String, Arc<MemoryDriver>)>>,
    failing_opens: DashMap<String, ()>,
}

impl MemoryDriverFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The simulated server behind `addr`, created on demand.
    pub fn server(&self, addr: &str) -> Arc<MemoryServer> {
        self.servers
            .entry(addr.to_string())
            .or_insert_with(|| MemoryServer::new(addr))
            .clone()
    }

    /// Make opens of the backend with this canonical name fail.
    pub fn fail_opens_of(&self, name: &str) {
        self.failing_opens.insert(name.to_string(), ());
    }

    /// How many times a backend with this canonical name was opened.
    pub fn open_count(&self, name: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    /// The most recently opened driver for this canonical name.
    pub fn driver_of(&self, name: &str) -> Option<Arc<MemoryDriver>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, driver)| driver.clone())
    }
}

impl DriverFactory for MemoryDriverFactory {
    fn open(
        &self,
        config: &BackendConfig,
        limiter_factory: Option<LimiterFactory>,
    ) -> Result<Arc<dyn Driver>> {
        if self.failing_opens.contains_key(&config.name()) {
            return Err(Error::Transport(format!(
                "connection refused: {}",
                config.name()
            )));
        }

        let addrs: Vec<String> = match config.client_mode {
            ClientMode::SingleHost => vec![config.addrs[0].clone()],
            ClientMode::Cluster | ClientMode::MasterSlaveGroup => config.addrs.clone(),
        };

        let nodes = addrs
            .iter()
            .map(|addr| {
                let node = Arc::new(MemoryNode {
                    addr: addr.clone(),
                    server: self.server(addr),
                    limiter: RwLock::new(None),
                });
                if let Some(factory) = &limiter_factory {
                    node.set_limiter(Some(factory(addr)));
                }
                node
            })
            .collect();

        let driver = Arc::new(MemoryDriver {
            nodes,
            closed: AtomicBool::new(false),
            tuning: RwLock::new(AppliedTuning::default()),
        });
        self.opened.lock().push((config.name(), driver.clone()));

        Ok(driver)
    }
}
