//! Configuration-source contract.
//!
//! Service teams plug in any provider that can deliver typed snapshots and
//! change notifications; [`StaticConfigurer`] covers fixed configurations.

use crate::config::ConnectorConfig;
use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// Callback invoked when the configuration source reports a change.
/// The provider awaits the returned future and receives the reload outcome.
pub type ChangeCallback =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// A dynamic configuration source.
pub trait Configurer: Send + Sync {
    /// Register a callback fired on every configuration change.
    fn on_change(&self, callback: ChangeCallback);

    /// Produce a typed snapshot of the current configuration.
    fn unmarshal(&self) -> Result<ConnectorConfig>;
}

/// A configuration source holding one fixed snapshot. Change notifications
/// never fire.
pub struct StaticConfigurer {
    config: ConnectorConfig,
}

impl StaticConfigurer {
    /// Wrap a fixed configuration.
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

impl Configurer for StaticConfigurer {
    fn on_change(&self, _callback: ChangeCallback) {}

    fn unmarshal(&self) -> Result<ConnectorConfig> {
        Ok(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ClientMode};

    #[test]
    fn test_static_configurer_round_trips_config() {
        let config = ConnectorConfig::new(BackendConfig::new(
            ClientMode::SingleHost,
            vec!["127.0.0.1:6379".to_string()],
        ));
        let configurer = StaticConfigurer::new(config.clone());

        let snapshot = configurer.unmarshal().unwrap();
        assert_eq!(snapshot, config);

        // Registering a callback is accepted and never invoked.
        configurer.on_change(Box::new(|| {
            Box::pin(async { panic!("static configurer fired a change") })
        }));
    }
}
