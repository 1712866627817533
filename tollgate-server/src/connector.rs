//! Connector: an endpoint paired with a protocol family.
//!
//! A connector is built from one [`ConnectorConfig`]. It owns the processor
//! factory and pool for its protocol, the upgrade protocols reachable from
//! it, the secure host configs it terminates TLS with, and the endpoint that
//! accepts its connections.

use crate::config::{ConnectorConfig, ProtocolKind, SecureHostConfig};
use crate::connection::{ConnectionSettings, Service, UpgradeProtocols};
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::{LifecycleError, ServerError};
use crate::lifecycle::LifecycleState;
use crate::metrics::Metrics;
use crate::pool::{PoolStats, ProcessorPool};
use crate::tls::create_tls_acceptor;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tollgate_protocol::{
    Http1Limits, Http1ProcessorFactory, ProcessorFactory, RelayLimits, RelayProcessorFactory,
};

/// Builds the processor factory for `kind` with the limits of `config`.
pub fn processor_factory(kind: ProtocolKind, config: &ConnectorConfig) -> Arc<dyn ProcessorFactory> {
    match kind {
        ProtocolKind::Http1 => Arc::new(Http1ProcessorFactory::new(Http1Limits {
            max_header_size: config.max_header_size,
            max_body_size: config.max_payload_size,
        })),
        ProtocolKind::Relay => Arc::new(RelayProcessorFactory::new(RelayLimits {
            max_packet_size: config.max_packet_size,
            max_body_size: config.max_payload_size,
        })),
    }
}

pub struct Connector {
    config: ConnectorConfig,
    endpoint: Arc<Endpoint>,
    upgrades: Arc<UpgradeProtocols>,
    secure_hosts: Mutex<Vec<SecureHostConfig>>,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        service: Arc<dyn Service>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ServerError> {
        let factory = processor_factory(config.protocol, &config);
        let mut pool = ProcessorPool::new(factory, config.pool_size, config.pool_limit)?;
        if let Some(ref metrics) = metrics {
            pool = pool.with_metrics(Arc::clone(metrics));
        }

        let upgrades = Arc::new(UpgradeProtocols::new());
        for kind in &config.upgrades {
            upgrades.register(kind.name(), processor_factory(*kind, &config));
        }

        let settings = ConnectionSettings {
            idle_timeout: config.idle_timeout(),
            keep_alive_limit: config.keep_alive_limit(),
            secure: config.secure,
            trust_forwarded_secure: config.trusts_forwarded_secure(),
            redirect_port: config.redirect_port,
            upgrades: Arc::clone(&upgrades),
        };
        let endpoint = Endpoint::new(
            EndpointConfig::from_connector(&config),
            Arc::new(pool),
            service,
            settings,
        )
        .with_metrics(metrics);

        Ok(Self {
            config,
            endpoint: Arc::new(endpoint),
            upgrades,
            secure_hosts: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn state(&self) -> LifecycleState {
        self.endpoint.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.endpoint.pool().stats()
    }

    /// Makes `name` reachable through `Upgrade: name` on this connector.
    pub fn add_upgrade_protocol(&self, name: &str, factory: Arc<dyn ProcessorFactory>) {
        tracing::info!("{}: upgrade protocol {} ({})", self.config.name, name, factory.protocol());
        self.upgrades.register(name, factory);
    }

    /// Adds a certificate selected by SNI. Only allowed before `init`.
    pub fn add_secure_host_config(&self, host: SecureHostConfig) -> Result<(), ServerError> {
        let state = self.state();
        if state != LifecycleState::New {
            return Err(LifecycleError {
                component: format!("connector {}", self.config.name),
                operation: "add secure host config",
                state,
            }
            .into());
        }
        self.secure_hosts.lock().push(host);
        Ok(())
    }

    /// Builds the TLS acceptor for secure connectors and binds the socket.
    pub async fn init(&self) -> Result<(), ServerError> {
        if self.config.secure {
            let hosts = self.secure_hosts.lock().clone();
            if hosts.is_empty() {
                return Err(ServerError::TlsConfig(format!(
                    "connector '{}' is secure but has no secure host config",
                    self.config.name
                )));
            }
            self.endpoint.set_tls_acceptor(create_tls_acceptor(&hosts)?);
        }
        self.endpoint.init().await
    }

    pub fn start(&self) -> Result<(), ServerError> {
        self.endpoint.start()
    }

    pub fn pause(&self) -> Result<(), ServerError> {
        self.endpoint.pause()
    }

    pub fn resume(&self) -> Result<(), ServerError> {
        self.endpoint.resume()
    }

    pub async fn stop(&self) -> Result<(), ServerError> {
        self.endpoint.stop().await
    }

    pub async fn close_graceful(&self, timeout: Duration) -> Result<usize, ServerError> {
        self.endpoint.close_graceful(timeout).await
    }

    pub fn destroy(&self) -> Result<(), ServerError> {
        self.endpoint.destroy()
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.config.name)
            .field("protocol", &self.config.protocol)
            .field("endpoint", &self.endpoint)
            .field("upgrades", &self.upgrades)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::handlers::StaticHandler;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tollgate_core::{Pipeline, SessionConfig, SessionManager};
    use tollgate_protocol::relay::{decode_message, encode_forward_request, RelayMessage};
    use tollgate_protocol::{Method, Request, Status};

    fn service() -> Arc<dyn Service> {
        let container = Container::new(Arc::new(SessionManager::new(SessionConfig::default())));
        container.add_host("localhost", &[]).unwrap();
        container.mapper().set_default_host(Some("localhost"));
        container
            .add_context("localhost", "/", Pipeline::builder().build().unwrap())
            .unwrap();
        container
            .add_wrapper("localhost", "/", "/", Arc::new(StaticHandler::new(Status::OK, "hello")))
            .unwrap();
        Arc::new(container)
    }

    fn config(protocol: ProtocolKind) -> ConnectorConfig {
        ConnectorConfig {
            name: protocol.name().into(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            protocol,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_relay_connector_end_to_end() {
        let connector = Connector::new(config(ProtocolKind::Relay), service(), None).unwrap();
        connector.init().await.unwrap();
        connector.start().unwrap();
        let addr = connector.local_addr().unwrap();

        let request = Request::new(Method::Get, "/anything").with_header("Host", "localhost");
        let packets = encode_forward_request(&request, Some("localhost"), 8192).unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&packets).await.unwrap();

        let mut buf = BytesMut::new();
        let mut messages = Vec::new();
        while !matches!(messages.last(), Some(RelayMessage::End { .. })) {
            match decode_message(&mut buf).unwrap() {
                Some(message) => messages.push(message),
                None => {
                    let n = client.read_buf(&mut buf).await.unwrap();
                    assert!(n > 0, "connection closed before end of response");
                }
            }
        }
        match &messages[0] {
            RelayMessage::Headers { status, .. } => assert_eq!(*status, Status::OK),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(messages[1], RelayMessage::BodyChunk(bytes::Bytes::from_static(b"hello")));
        assert_eq!(messages[2], RelayMessage::End { reuse: true });

        drop(client);
        assert_eq!(connector.close_graceful(Duration::from_secs(2)).await.unwrap(), 0);
        connector.destroy().unwrap();
    }

    #[tokio::test]
    async fn test_configured_upgrades_are_registered() {
        let mut config = config(ProtocolKind::Http1);
        config.upgrades = vec![ProtocolKind::Relay];
        let connector = Connector::new(config, service(), None).unwrap();
        assert_eq!(connector.upgrades.names(), vec!["relay".to_string()]);
        connector.add_upgrade_protocol("Relay-Alt", processor_factory(ProtocolKind::Relay, connector.config()));
        assert!(connector.endpoint().settings().upgrades.get("relay-alt").is_some());
    }

    #[tokio::test]
    async fn test_secure_host_config_only_before_init() {
        let connector = Connector::new(config(ProtocolKind::Http1), service(), None).unwrap();
        connector
            .add_secure_host_config(SecureHostConfig::new("a.example", "a.pem", "a.key"))
            .unwrap();
        connector.init().await.unwrap();
        let err = connector
            .add_secure_host_config(SecureHostConfig::new("b.example", "b.pem", "b.key"))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Lifecycle(LifecycleError {
                state: LifecycleState::Initialized,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_secure_connector_needs_a_host() {
        let mut config = config(ProtocolKind::Http1);
        config.secure = true;
        let connector = Connector::new(config, service(), None).unwrap();
        assert!(matches!(connector.init().await, Err(ServerError::TlsConfig(_))));
        assert_eq!(connector.state(), LifecycleState::New);
    }
}
