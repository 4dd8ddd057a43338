//! Resilient dual-write client for Redis-compatible stores.
//!
//! doppio sits between an application and one or more key-value clusters:
//! - **Dual writes** mirror selected commands onto shadow ("load test")
//!   clusters through a latency-adaptive worker pool, for zero-downtime
//!   migrations and load testing against production traffic.
//! - **Per-node circuit breakers** isolate faults to individual backend
//!   nodes while the rest of a cluster keeps serving.
//! - **Hot reload** applies pool, timeout and routing changes — including
//!   adding or removing shadow clusters — to the live client without
//!   dropping usable connections.
//!
//! The wire protocol and connection pooling are supplied by a lower-layer
//! driver implementing the [`driver`] contracts; configuration comes from
//! any source implementing [`configurer::Configurer`]; telemetry flows
//! through the [`telemetry`] contracts.
//!
//! # Example
//!
//! ```rust,no_run
//! use doppio::{BackendConfig, ClientMode, Connector, ConnectorConfig, Context, Value};
//! use std::sync::Arc;
//!
//! # async fn example(factory: Arc<dyn doppio::driver::DriverFactory>) -> doppio::Result<()> {
//! let config = ConnectorConfig::new(BackendConfig::new(
//!     ClientMode::SingleHost,
//!     vec!["127.0.0.1:6379".to_string()],
//! ))
//! .with_shadow(BackendConfig::new(
//!     ClientMode::SingleHost,
//!     vec!["127.0.0.1:6380".to_string()],
//! ));
//!
//! let ctx = Context::background();
//! let connector = Connector::connect_static(&ctx, factory, config).await?;
//!
//! // Executed on the primary, mirrored to the shadow.
//! connector
//!     .do_cmd(&ctx, "SET", &[Value::from("greeting"), Value::from("hello")])
//!     .await?;
//!
//! connector.shut_down(&ctx).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Application                  │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │            Connector (dispatcher)            │
//! │  do / pipeline / run / publish / subscribe   │
//! └──────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ Primary backend │     │  Shadow scheduler    │
//! │ per-node        │     │  bounded queue +     │
//! │ breakers        │     │  elastic workers     │
//! └─────────────────┘     └──────────────────────┘
//!                                  │
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │ Shadow backends │
//!                         └─────────────────┘
//! ```
//!
//! Shadow writes are best-effort by default: under overload the bounded
//! queue drops tasks (with a counter). Strict mode
//! (`processAllLoadTestPackets`) blocks the caller instead, trading latency
//! for completeness.

pub mod breaker;
pub mod config;
pub mod configurer;
pub mod driver;
pub mod error;
pub mod latency;
pub mod limiter;
pub mod script;
pub mod telemetry;
pub mod testing;
pub mod types;

mod backend;
mod client;
mod connector;
mod scheduler;

// Re-export main types for convenience.
pub use config::{BackendConfig, BreakerConfig, ClientMode, ConnectorConfig, ReadMode};
pub use connector::{Connector, ConnectorBuilder};
pub use configurer::{Configurer, StaticConfigurer};
pub use error::{Error, Result};
pub use script::Script;
pub use telemetry::{Logger, NoopLogger, NoopStats, StatsSink, TracingLogger};
pub use types::{
    first_error, CommandInfo, Context, PoolStats, ReplyPair, SubscribeMessage, Subscription, Value,
};
