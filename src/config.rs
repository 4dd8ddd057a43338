//! Configuration types for the connector.
//!
//! The JSON form is the wire contract with configuration providers: keys are
//! lowerCamel and must stay stable. Numeric zero and missing keys mean "use
//! the default"; [`BackendConfig::normalize`] fills them in.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Address used when a backend config carries no addresses.
pub const DEFAULT_HOST_AND_PORT: &str = "localhost:6379";

pub(crate) const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

pub(crate) const DEFAULT_BREAKER_TIMEOUT_MS: u64 = 31_000;
pub(crate) const DEFAULT_BREAKER_MAX_CONCURRENT: u32 = 5_000;
pub(crate) const DEFAULT_BREAKER_ERROR_PERCENT: u32 = 50;

pub(crate) const DEFAULT_SCHEDULER_WORKERS: usize = 10;
pub(crate) const DEFAULT_SCHEDULER_QUEUE: usize = 10_000;
pub(crate) const DEFAULT_WORKER_IDLE_TIMEOUT_MS: u64 = 1_000;

pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const POOL_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Some providers deliver unset string fields as this literal.
const UCM_EMPTY_STRING: &str = "<nil>";

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Topology mode of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMode {
    /// Sharded cluster addressed through a seed list.
    #[serde(rename = "cluster")]
    Cluster,
    /// One master followed by its replicas, presented as a single slot range.
    #[serde(rename = "masterSlaveGroup")]
    MasterSlaveGroup,
    /// A single host.
    #[serde(rename = "singleHost")]
    SingleHost,
}

impl Default for ClientMode {
    fn default() -> Self {
        ClientMode::SingleHost
    }
}

/// Routing mode for read-only commands (cluster and master/replica modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadMode {
    /// All reads go to the master.
    #[serde(rename = "readFromMaster")]
    ReadFromMaster,
    /// Reads go to replica nodes.
    #[serde(rename = "readFromSlaves")]
    ReadFromSlaves,
    /// Reads go to a random node.
    #[serde(rename = "readRandomly")]
    ReadRandomly,
    /// Reads go to the lowest-latency node.
    #[serde(rename = "readByLatency")]
    ReadByLatency,
}

impl Default for ReadMode {
    fn default() -> Self {
        ReadMode::ReadFromSlaves
    }
}

impl ReadMode {
    /// Parse a configuration literal. Empty and `<nil>` normalize to the
    /// default read mode.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "" | UCM_EMPTY_STRING => Ok(ReadMode::default()),
            "readFromMaster" => Ok(ReadMode::ReadFromMaster),
            "readFromSlaves" => Ok(ReadMode::ReadFromSlaves),
            "readRandomly" => Ok(ReadMode::ReadRandomly),
            "readByLatency" => Ok(ReadMode::ReadByLatency),
            other => Err(format!("read mode {other} is not valid")),
        }
    }

    /// Translate into the three mutually dependent driver routing flags:
    /// (read_only, route_by_latency, route_randomly).
    pub fn routing_flags(&self) -> (bool, bool, bool) {
        match self {
            ReadMode::ReadFromMaster => (false, false, false),
            ReadMode::ReadFromSlaves => (true, false, false),
            ReadMode::ReadByLatency => (false, true, false),
            ReadMode::ReadRandomly => (false, false, true),
        }
    }
}

impl<'de> Deserialize<'de> for ReadMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ReadMode::parse(&s).map_err(D::Error::custom)
    }
}

/// Per-node circuit breaker settings, shared by all nodes of a backend.
///
/// Zero-valued fields mean "keep the library default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// How long to wait for a protected call to complete.
    pub timeout_in_ms: u64,
    /// How many protected calls may run concurrently per node.
    pub max_concurrent_requests: u32,
    /// Minimum requests in the rolling window before the circuit can trip.
    pub request_volume_threshold: u32,
    /// Circuit opens once the rolling error ratio exceeds this percentage.
    pub error_percent_threshold: u32,
    /// How long to wait after opening before admitting a recovery probe.
    pub sleep_window_in_ms: u64,
    /// Reject calls once this many are already waiting for a permit.
    pub queue_size_rejection_threshold: u32,
}

/// Configuration of one backend (primary or shadow).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    /// Topology mode.
    pub client_mode: ClientMode,

    /// Addresses in `host:port` form.
    ///
    /// Cluster mode takes a seed list of cluster nodes; master/replica mode
    /// takes the master address followed by all replicas; single-host mode
    /// takes exactly one address.
    pub addrs: Vec<String>,

    pub username: String,
    pub password: String,

    /// Database selected after connecting. Single-host mode only.
    pub db: u32,

    pub max_retries: u32,
    pub min_retry_backoff_in_ms: u64,
    pub max_retry_backoff_in_ms: u64,

    pub dial_timeout_in_ms: u64,
    pub read_timeout_in_ms: u64,
    pub write_timeout_in_ms: u64,

    pub pool_size: u32,
    pub min_idle_conns: u32,
    pub max_idle_conns: u32,
    pub max_conn_age_in_ms: u64,
    pub pool_timeout_in_ms: u64,
    pub idle_timeout_in_ms: u64,
    pub idle_check_frequency_in_ms: u64,

    /// Negotiate TLS (with certificate verification disabled) when dialing.
    pub tls_enabled: bool,

    /// Whether each node of this backend gets a circuit breaker.
    pub hystrix_enabled: bool,
    /// Breaker settings common to all nodes; each node has its own circuit.
    pub hystrix: BreakerConfig,

    /// Maximum number of cross-node redirects before giving up.
    /// Cluster and master/replica modes only.
    pub max_redirects: u32,

    /// Read-only command routing. Cluster and master/replica modes only.
    pub read_mode: ReadMode,

    /// When set on the primary, read-only commands bypass shadow fan-out.
    pub ignore_read_only: bool,
}

impl BackendConfig {
    /// Create a config for the given topology and addresses.
    pub fn new(client_mode: ClientMode, addrs: Vec<String>) -> Self {
        let mut config = Self {
            client_mode,
            addrs,
            ..Default::default()
        };
        config.normalize();
        config
    }

    /// Set username and password.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the connection pool size.
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set dial/read/write timeouts in milliseconds.
    pub fn with_timeouts(mut self, dial_ms: u64, read_ms: u64, write_ms: u64) -> Self {
        self.dial_timeout_in_ms = dial_ms;
        self.read_timeout_in_ms = read_ms;
        self.write_timeout_in_ms = write_ms;
        self
    }

    /// Enable per-node circuit breakers with the given settings.
    pub fn with_breaker(mut self, settings: BreakerConfig) -> Self {
        self.hystrix_enabled = true;
        self.hystrix = settings;
        self
    }

    /// Enable or disable per-node circuit breakers.
    pub fn with_breaker_enabled(mut self, enabled: bool) -> Self {
        self.hystrix_enabled = enabled;
        self
    }

    /// Set the read routing mode.
    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    /// Set whether read-only commands bypass shadow fan-out.
    pub fn with_ignore_read_only(mut self, ignore: bool) -> Self {
        self.ignore_read_only = ignore;
        self
    }

    /// Set the maximum number of cross-node redirects.
    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Canonical identity of this backend: the sole address in single-host
    /// mode, otherwise the sorted address set joined by commas. Reload uses
    /// this to pair old and new shadow definitions.
    pub fn name(&self) -> String {
        if self.addrs.is_empty() {
            return DEFAULT_HOST_AND_PORT.to_string();
        }
        if self.client_mode == ClientMode::SingleHost {
            return self.addrs[0].clone();
        }
        let mut sorted = self.addrs.clone();
        sorted.sort();
        sorted.join(",")
    }

    /// Fill unset fields with their defaults and normalize provider quirks.
    pub fn normalize(&mut self) {
        if self.addrs.is_empty() {
            self.addrs = vec![DEFAULT_HOST_AND_PORT.to_string()];
        }

        if self.username == UCM_EMPTY_STRING {
            self.username = String::new();
        }
        if self.password == UCM_EMPTY_STRING {
            self.password = String::new();
        }

        if self.dial_timeout_in_ms == 0 {
            self.dial_timeout_in_ms = DEFAULT_DIAL_TIMEOUT_MS;
        }

        if self.hystrix.timeout_in_ms == 0 {
            self.hystrix.timeout_in_ms = DEFAULT_BREAKER_TIMEOUT_MS;
        }
        if self.hystrix.max_concurrent_requests == 0 {
            self.hystrix.max_concurrent_requests = DEFAULT_BREAKER_MAX_CONCURRENT;
        }
        if self.hystrix.error_percent_threshold == 0 {
            self.hystrix.error_percent_threshold = DEFAULT_BREAKER_ERROR_PERCENT;
        }
    }

    /// Validate a standalone configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.addrs.is_empty() {
            return Err("no addrs found in config".to_string());
        }
        if self.addrs.iter().any(|a| a.trim().is_empty()) {
            return Err("empty addr found in config".to_string());
        }
        if self.client_mode == ClientMode::SingleHost && self.addrs.len() != 1 {
            return Err("singleHost mode takes exactly one addr".to_string());
        }
        Ok(())
    }

    /// Validate a replacement configuration against the running one.
    /// Topology-affecting fields are frozen for the lifetime of a backend.
    pub fn validate_reload(&self, new: &BackendConfig) -> Result<(), String> {
        new.validate()?;

        if self.client_mode != new.client_mode {
            return Err("client mode change is not allowed when reloading".to_string());
        }
        if self.db != new.db {
            return Err("db change is not allowed when reloading".to_string());
        }
        if !addrs_equal(&self.addrs, &new.addrs) {
            return Err("addrs change is not allowed when reloading".to_string());
        }

        Ok(())
    }
}

/// Compare two address sets ignoring order.
pub(crate) fn addrs_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Top-level connector configuration: the primary backend, the shadow
/// lineup, and the shadow scheduler parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// The production read/write backend.
    pub main: BackendConfig,
    /// Shadow backends receiving mirrored traffic, in publication order.
    pub load_tests: Vec<BackendConfig>,

    /// Whether configuration changes are applied to the live connector.
    pub hot_reload: bool,

    /// When set, shadow enqueues block instead of dropping on a full queue.
    /// Guarantees no lost shadow packets at the cost of caller latency.
    pub process_all_load_test_packets: bool,

    /// Maximum number of shadow scheduler workers. Fewer workers use less
    /// resources on the shadow backends.
    pub scheduler_worker_number: usize,

    /// Capacity of the shadow task queue buffering mirrored requests.
    pub scheduler_channel_size: usize,

    /// Idle time after which a shadow worker exits.
    #[serde(rename = "schedulerWorkerIdleTimeout")]
    pub scheduler_worker_idle_timeout_in_ms: u64,
}

impl ConnectorConfig {
    /// Create a configuration with the given primary backend.
    pub fn new(main: BackendConfig) -> Self {
        Self {
            main,
            ..Default::default()
        }
    }

    /// Append a shadow backend.
    pub fn with_shadow(mut self, shadow: BackendConfig) -> Self {
        self.load_tests.push(shadow);
        self
    }

    /// Enable or disable hot reload.
    pub fn with_hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = enabled;
        self
    }

    /// Enable or disable strict shadow mode (blocking enqueue).
    pub fn with_strict_shadows(mut self, strict: bool) -> Self {
        self.process_all_load_test_packets = strict;
        self
    }

    /// Set the scheduler parameters. These are fixed at construction and
    /// cannot change across reloads.
    pub fn with_scheduler(mut self, workers: usize, queue: usize, idle_timeout_ms: u64) -> Self {
        self.scheduler_worker_number = workers;
        self.scheduler_channel_size = queue;
        self.scheduler_worker_idle_timeout_in_ms = idle_timeout_ms;
        self
    }

    /// Normalize every backend and the scheduler parameters, then validate.
    pub fn normalize_and_validate(&mut self) -> Result<(), String> {
        self.main.normalize();
        self.main.validate()?;

        for shadow in &mut self.load_tests {
            shadow.normalize();
        }
        for shadow in &self.load_tests {
            shadow.validate()?;
        }

        if self.scheduler_worker_number == 0 {
            self.scheduler_worker_number = DEFAULT_SCHEDULER_WORKERS;
        }
        if self.scheduler_channel_size == 0 {
            self.scheduler_channel_size = DEFAULT_SCHEDULER_QUEUE;
        }
        if self.scheduler_worker_idle_timeout_in_ms == 0 {
            self.scheduler_worker_idle_timeout_in_ms = DEFAULT_WORKER_IDLE_TIMEOUT_MS;
        }

        Ok(())
    }

    /// Whether the fixed-at-construction scheduler parameters differ.
    pub(crate) fn scheduler_params_differ(&self, other: &ConnectorConfig) -> bool {
        self.scheduler_worker_number != other.scheduler_worker_number
            || self.scheduler_channel_size != other.scheduler_channel_size
            || self.scheduler_worker_idle_timeout_in_ms != other.scheduler_worker_idle_timeout_in_ms
    }
}
