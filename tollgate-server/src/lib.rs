//! # tollgate-server
//!
//! Server for tollgate.
//!
//! This crate provides:
//! - Endpoints with lifecycle, accept loop and graceful close
//! - Per-connection driving over pooled protocol processors
//! - Connectors with upgrade protocols and SNI-selected certificates
//! - The request container (mapper, contexts, sessions)
//! - YAML configuration with environment overrides
//! - Prometheus metrics

pub mod config;
pub mod connection;
pub mod connector;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{Config, ConfigError, ConnectorConfig, ProtocolKind, SecureHostConfig};
pub use connection::{Connection, ConnectionSettings, Service, UpgradeProtocols};
pub use connector::Connector;
pub use container::{Container, Context};
pub use endpoint::{Endpoint, EndpointConfig, ExhaustionPolicy};
pub use error::{LifecycleError, ServerError};
pub use lifecycle::{Lifecycle, LifecycleState, Transition};
pub use metrics::Metrics;
pub use pool::{Lease, PoolStats, ProcessorPool};
pub use server::Server;
