//! Server assembly.
//!
//! [`Server::from_config`] is the composition root: it builds the realm and
//! the authentication chain, deploys hosts and contexts into the
//! [`Container`], and creates one [`Connector`] per configured listener.
//! Every shared component is owned here and handed down by `Arc`.

use crate::config::{Config, ContextConfig, RealmConfig, SecurityConfig};
use crate::connection::Service;
use crate::connector::Connector;
use crate::container::Container;
use crate::error::ServerError;
use crate::handlers;
use crate::lifecycle::LifecycleState;
use crate::metrics::{run_metrics_server, Metrics};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tollgate_auth::{
    AuthModule, AuthModuleRegistry, Authenticator, BearerTokenModule, ConstraintSet,
    CredentialHandler, LockOutRealm, MemoryRealm, Realm, User,
};
use tollgate_core::{Pipeline, SessionManager};

/// Builds the configured realm, wrapped in a lock-out realm when enabled.
pub fn build_realm(config: &RealmConfig) -> Result<Arc<dyn Realm>, ServerError> {
    let handler = CredentialHandler::new(config.digest()?);
    let users = config
        .users
        .iter()
        .map(|u| User::new(u.name.as_str(), u.credential.as_str(), u.roles.iter().cloned()));
    let realm: Arc<dyn Realm> = Arc::new(MemoryRealm::new(config.name.as_str(), handler).with_users(users));
    if !config.lockout.enabled {
        return Ok(realm);
    }
    Ok(Arc::new(
        LockOutRealm::new(realm)
            .with_policy(config.lockout.failure_count, config.lockout.lockout())
            .with_cache_size(config.lockout.cache_size),
    ))
}

/// Builds the authentication module chain for the configured login methods.
pub fn build_modules(
    realm: &RealmConfig,
    security: &SecurityConfig,
) -> Result<Vec<Arc<dyn AuthModule>>, ServerError> {
    let mut registry = AuthModuleRegistry::with_defaults();
    let bearer = BearerTokenModule::new(
        realm
            .bearer_tokens
            .iter()
            .map(|t| (t.hash.clone(), t.principal.clone())),
    );
    registry.register(bearer.factory());
    Ok(registry.create_chain(&security.login_methods)?)
}

pub struct Server {
    container: Arc<Container>,
    connectors: Vec<Connector>,
    metrics: Option<Arc<Metrics>>,
    metrics_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let metrics = if config.metrics.enabled {
            Some(Arc::new(Metrics::new()?))
        } else {
            None
        };

        let sessions = Arc::new(SessionManager::new(config.session.to_session_config()));
        let container = Arc::new(Container::new(sessions).with_metrics(metrics.clone()));
        for host in &config.hosts {
            container.add_host(&host.name, &host.aliases)?;
            if host.default {
                container.mapper().set_default_host(Some(&host.name));
            }
        }

        let realm = build_realm(&config.realm)?;
        let modules = build_modules(&config.realm, &config.security)?;
        for context in &config.contexts {
            let pipeline = Self::pipeline(context, &realm, &modules, &config.security, &metrics)?;
            container.add_context(&context.host, &context.path, pipeline)?;
            for route in &context.routes {
                container.add_wrapper(&context.host, &context.path, &route.pattern, handlers::from_route(route)?)?;
            }
        }

        let service: Arc<dyn Service> = container.clone();
        let mut connectors = Vec::with_capacity(config.connectors.len());
        for connector_config in &config.connectors {
            let connector = Connector::new(connector_config.clone(), Arc::clone(&service), metrics.clone())?;
            if connector_config.secure {
                for host in &config.tls {
                    connector.add_secure_host_config(host.clone())?;
                }
            }
            connectors.push(connector);
        }

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            container,
            connectors,
            metrics,
            metrics_addr: config.metrics.bind_addr,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn pipeline(
        context: &ContextConfig,
        realm: &Arc<dyn Realm>,
        modules: &[Arc<dyn AuthModule>],
        security: &SecurityConfig,
        metrics: &Option<Arc<Metrics>>,
    ) -> Result<Pipeline, ServerError> {
        let mut builder = Pipeline::builder();
        if !context.constraints.is_empty() {
            let constraints = ConstraintSet::new(context.constraints.clone())?;
            let mut authenticator = Authenticator::new(Arc::clone(realm), modules.to_vec(), constraints)
                .with_cache(security.cache);
            if let Some(metrics) = metrics.clone() {
                authenticator = authenticator.with_observer(move |event| {
                    metrics
                        .auth_events_total
                        .with_label_values(&[event.as_str()])
                        .inc();
                });
            }
            builder = builder.valve(authenticator);
        }
        Ok(builder.build()?)
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn connector(&self, name: &str) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.name() == name)
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Binds and starts every connector, then the background tasks.
    pub async fn start(&self) -> Result<(), ServerError> {
        for connector in &self.connectors {
            connector.init().await?;
        }
        for connector in &self.connectors {
            connector.start()?;
        }

        let mut tasks = Vec::new();
        let sessions = Arc::clone(self.container.sessions());
        tasks.push(sessions.spawn_reaper(self.shutdown.subscribe()));
        if let Some(ref metrics) = self.metrics {
            let metrics = Arc::clone(metrics);
            let addr = self.metrics_addr;
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                    tracing::error!("Metrics server error: {}", e);
                }
            }));
        }
        *self.tasks.lock() = tasks;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), ServerError> {
        for connector in &self.connectors {
            connector.pause()?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ServerError> {
        for connector in &self.connectors {
            connector.resume()?;
        }
        Ok(())
    }

    /// Stops every connector, gives open connections until `timeout` to
    /// finish, then tears everything down. Returns how many connections had
    /// to be aborted.
    pub async fn close_graceful(&self, timeout: Duration) -> Result<usize, ServerError> {
        let deadline = Instant::now() + timeout;
        for connector in &self.connectors {
            if connector.state().is_available() {
                connector.stop().await?;
            }
        }

        let mut remaining = 0;
        for connector in &self.connectors {
            if connector.state() == LifecycleState::Stopped {
                let left = deadline.saturating_duration_since(Instant::now());
                remaining += connector.close_graceful(left).await?;
                connector.destroy()?;
            }
        }

        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("background task failed: {}", e);
            }
        }
        tracing::info!("server closed ({} connections aborted)", remaining);
        Ok(remaining)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connectors", &self.connectors)
            .field("sessions", &self.container.sessions().len())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
