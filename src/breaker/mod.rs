//! Process-wide circuit breaker registry.
//!
//! Circuits are keyed by backend node address and shared by every connector
//! in the process. The registry is lazily initialized; settings installed via
//! [`configure_circuit`] apply when a circuit is first used, and
//! [`reconfigure_circuit`] drops the live instance so new settings take
//! effect on the next request.

mod builder;
mod circuit;

pub use builder::CircuitBuilder;
pub use circuit::{CircuitBreaker, CircuitSettings, CircuitState};

use crate::error::Result;
use crate::limiter::BreakerPolicy;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

fn settings_registry() -> &'static DashMap<String, CircuitSettings> {
    static SETTINGS: OnceLock<DashMap<String, CircuitSettings>> = OnceLock::new();
    SETTINGS.get_or_init(DashMap::new)
}

fn circuit_registry() -> &'static DashMap<String, Arc<CircuitBreaker>> {
    static CIRCUITS: OnceLock<DashMap<String, Arc<CircuitBreaker>>> = OnceLock::new();
    CIRCUITS.get_or_init(DashMap::new)
}

fn circuit_for(key: &str) -> Arc<CircuitBreaker> {
    if let Some(circuit) = circuit_registry().get(key) {
        return circuit.clone();
    }
    let settings = settings_registry()
        .get(key)
        .map(|s| *s)
        .unwrap_or_else(|| CircuitBuilder::new(key).build());
    circuit_registry()
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(CircuitBreaker::new(key, settings)))
        .clone()
}

/// Install settings for a circuit. Idempotent: an already-running circuit is
/// untouched until [`reconfigure_circuit`] flushes it.
pub fn configure_circuit(key: &str, settings: CircuitSettings) {
    settings_registry().insert(key.to_string(), settings);
}

/// Install settings and flush the live circuit so they take effect on the
/// next request.
pub fn reconfigure_circuit(key: &str, settings: CircuitSettings) {
    configure_circuit(key, settings);
    circuit_registry().remove(key);
}

/// Whether a request may proceed: true when the circuit is closed or is
/// admitting a recovery probe. A key without a circuit always allows.
pub fn allow_request(key: &str) -> bool {
    circuit_registry()
        .get(key)
        .map(|c| c.allow_request())
        .unwrap_or(true)
}

/// Whether the circuit for this key is open. A key without a circuit is not.
pub fn is_circuit_open(key: &str) -> bool {
    circuit_registry()
        .get(key)
        .map(|c| c.is_open())
        .unwrap_or(false)
}

/// Observable state of the circuit for this key, if one exists.
pub fn circuit_state(key: &str) -> Option<CircuitState> {
    circuit_registry().get(key).map(|c| c.state())
}

/// Count of tracked errors in the circuit's rolling window, if one exists.
pub fn tracked_errors(key: &str) -> Option<u64> {
    circuit_registry().get(key).map(|c| c.tracked_errors())
}

/// Execute a call under the circuit registered for `key`, creating the
/// circuit on first use.
pub async fn execute<T, F>(key: &str, fut: F, policy: &BreakerPolicy) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    circuit_for(key).execute(fut, policy).await
}

/// Drop every circuit and every installed setting. Intended for tests.
pub fn flush_all() {
    circuit_registry().clear();
    settings_registry().clear();
}
