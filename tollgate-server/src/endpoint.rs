//! Listening endpoint.
//!
//! An [`Endpoint`] owns one listening socket. Each accepted connection takes
//! a connection permit and a pooled processor, then runs in its own task.
//! When every permit is taken the [`ExhaustionPolicy`] decides what happens
//! to the new connection.

use crate::config::ConnectorConfig;
use crate::connection::{Connection, ConnectionSettings, Service};
use crate::error::ServerError;
use crate::lifecycle::{Lifecycle, LifecycleState, Transition};
use crate::metrics::Metrics;
use crate::pool::{Lease, ProcessorPool};
use crate::stream::MaybeTlsStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

/// What the endpoint does with a connection accepted while every
/// connection permit is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Serve it with a fresh processor that is not returned to the pool.
    #[default]
    Transient,
    /// Stop accepting until a permit is released.
    Defer,
    /// Close it immediately.
    Reject,
}

/// Endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Connections that may hold a pooled processor at once.
    pub max_connections: usize,
    pub exhaustion_policy: ExhaustionPolicy,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            max_connections: 1000,
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }

    pub fn from_connector(connector: &ConnectorConfig) -> Self {
        Self {
            name: connector.name.clone(),
            bind_addr: connector.bind_addr,
            max_connections: connector.max_connections,
            exhaustion_policy: connector.exhaustion_policy,
        }
    }
}

/// Live connection count, with a wakeup whenever it changes.
#[derive(Default)]
struct ActiveConnections {
    count: AtomicUsize,
    changed: Notify,
}

struct ActiveGuard {
    active: Arc<ActiveConnections>,
    metrics: Option<Arc<Metrics>>,
}

impl ActiveGuard {
    fn new(active: Arc<ActiveConnections>, metrics: Option<Arc<Metrics>>) -> Self {
        active.count.fetch_add(1, Ordering::SeqCst);
        if let Some(ref metrics) = metrics {
            metrics.connections_active.inc();
        }
        Self { active, metrics }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.count.fetch_sub(1, Ordering::SeqCst);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }
        self.active.changed.notify_waiters();
    }
}

/// Accepts connections and drives them with pooled processors.
pub struct Endpoint {
    config: EndpointConfig,
    lifecycle: Lifecycle,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tls: Mutex<Option<TlsAcceptor>>,
    permits: Arc<Semaphore>,
    paused: AtomicBool,
    pool: Arc<ProcessorPool>,
    service: Arc<dyn Service>,
    settings: Arc<ConnectionSettings>,
    metrics: Option<Arc<Metrics>>,
    active: Arc<ActiveConnections>,
    /// Stops the accept loop.
    shutdown: broadcast::Sender<()>,
    /// Tells connections to finish their current request and close.
    drain: watch::Sender<bool>,
    /// Aborts every remaining connection.
    kill: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn new(
        config: EndpointConfig,
        pool: Arc<ProcessorPool>,
        service: Arc<dyn Service>,
        settings: ConnectionSettings,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (drain, _) = watch::channel(false);
        let (kill, _) = broadcast::channel(1);
        let permits = config.max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            lifecycle: Lifecycle::new(format!("endpoint {}", config.name)),
            config,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            tls: Mutex::new(None),
            permits: Arc::new(Semaphore::new(permits)),
            paused: AtomicBool::new(false),
            pool,
            service,
            settings: Arc::new(settings),
            metrics: None,
            active: Arc::new(ActiveConnections::default()),
            shutdown,
            drain,
            kill,
            accept_task: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<ProcessorPool> {
        &self.pool
    }

    /// Address actually bound, available after [`init`](Self::init).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.active.count.load(Ordering::SeqCst)
    }

    /// Installs the TLS acceptor used for every accepted connection.
    pub fn set_tls_acceptor(&self, acceptor: TlsAcceptor) {
        *self.tls.lock() = Some(acceptor);
    }

    pub fn is_tls(&self) -> bool {
        self.tls.lock().is_some()
    }

    /// Binds the listening socket.
    pub async fn init(&self) -> Result<(), ServerError> {
        self.lifecycle.require("init", &[LifecycleState::New])?;
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(local_addr);
        self.lifecycle.transition(Transition::Init)?;
        Ok(())
    }

    /// Starts accepting connections.
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.lifecycle.require("start", &[LifecycleState::Initialized])?;
        let listener = self.listener.lock().take().ok_or(ServerError::NotBound)?;
        self.lifecycle.transition(Transition::Start)?;

        let mode = if self.is_tls() { "TLS" } else { "plain" };
        tracing::info!(
            "{} listening on {} ({}, {})",
            self.config.name,
            self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.pool.factory().protocol(),
            mode
        );

        let shutdown = self.shutdown.subscribe();
        let endpoint = Arc::clone(self);
        let handle = tokio::spawn(async move { endpoint.accept_loop(listener, shutdown).await });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    /// Keeps serving open connections but closes newly accepted ones.
    pub fn pause(&self) -> Result<(), ServerError> {
        self.lifecycle.transition(Transition::Pause)?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ServerError> {
        self.lifecycle.transition(Transition::Resume)?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting and asks open connections to drain.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.lifecycle.transition(Transition::Stop)?;
        let _ = self.shutdown.send(());
        self.drain.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("{}: accept task failed: {}", self.config.name, e);
            }
        }
        Ok(())
    }

    /// Stops the endpoint, waits up to `timeout` for open connections to
    /// finish, then aborts the rest. Returns how many had to be aborted.
    pub async fn close_graceful(&self, timeout: Duration) -> Result<usize, ServerError> {
        let state = self.lifecycle.require(
            "close",
            &[LifecycleState::Running, LifecycleState::Paused, LifecycleState::Stopped],
        )?;
        let deadline = Instant::now() + timeout;
        if state != LifecycleState::Stopped {
            self.stop().await?;
        }

        loop {
            let changed = self.active.changed.notified();
            if self.active_connections() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                break;
            }
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            tracing::warn!(
                "{}: aborting {} connections still open at the deadline",
                self.config.name,
                remaining
            );
            let _ = self.kill.send(());
        } else {
            tracing::info!("{}: all connections closed", self.config.name);
        }
        Ok(remaining)
    }

    /// Releases pooled processors and listening resources.
    pub fn destroy(&self) -> Result<(), ServerError> {
        self.lifecycle.transition(Transition::Destroy)?;
        self.pool.clear();
        self.listener.lock().take();
        self.tls.lock().take();
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let deferred = if self.config.exhaustion_policy == ExhaustionPolicy::Defer {
                tokio::select! {
                    permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            } else {
                None
            };

            tokio::select! {
                result = listener.accept() => match result {
                    Ok((tcp, addr)) => self.admit(tcp, addr, deferred),
                    Err(e) => tracing::error!("{}: accept error: {}", self.config.name, e),
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("{}: stopped accepting", self.config.name);
    }

    fn reject(&self, addr: SocketAddr, reason: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_rejected_total
                .with_label_values(&[reason])
                .inc();
        }
        tracing::warn!("[{}] Connection closed on accept ({})", addr, reason);
    }

    fn admit(self: &Arc<Self>, tcp: TcpStream, addr: SocketAddr, permit: Option<OwnedSemaphorePermit>) {
        if self.paused.load(Ordering::SeqCst) {
            self.reject(addr, "paused");
            return;
        }

        let permit = permit.or_else(|| Arc::clone(&self.permits).try_acquire_owned().ok());
        let lease = match permit {
            Some(_) => self.pool.lease(),
            None => match self.config.exhaustion_policy {
                ExhaustionPolicy::Transient => {
                    tracing::warn!(
                        "[{}] Connection limit reached, using a transient processor",
                        addr
                    );
                    self.pool.transient()
                }
                ExhaustionPolicy::Reject | ExhaustionPolicy::Defer => {
                    self.reject(addr, "limit");
                    return;
                }
            },
        };

        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_total
                .with_label_values(&[&self.config.name])
                .inc();
        }
        let guard = ActiveGuard::new(Arc::clone(&self.active), self.metrics.clone());
        let mut kill = self.kill.subscribe();
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            tokio::select! {
                _ = endpoint.serve(tcp, addr, lease) => {}
                _ = kill.recv() => tracing::debug!("[{}] Connection aborted by shutdown", addr),
            }
            tracing::info!("[{}] Client disconnected", addr);
        });
    }

    async fn serve(&self, tcp: TcpStream, addr: SocketAddr, lease: Lease) {
        let acceptor = self.tls.lock().clone();
        let stream = match acceptor {
            Some(acceptor) => {
                let handshake = acceptor.accept(tcp);
                match tokio::time::timeout(self.settings.idle_timeout, handshake).await {
                    Ok(Ok(stream)) => MaybeTlsStream::Tls { stream },
                    Ok(Err(e)) => {
                        let e = ServerError::TlsHandshake(e.to_string());
                        tracing::warn!("[{}] {}", addr, e);
                        return;
                    }
                    Err(_) => {
                        tracing::debug!("[{}] TLS handshake timed out", addr);
                        return;
                    }
                }
            }
            None => MaybeTlsStream::Plain { stream: tcp },
        };
        let mtls = if stream.has_client_certificate() { ", client cert" } else { "" };
        match stream.sni_hostname() {
            Some(sni) => tracing::info!("[{}] Client connected (TLS, SNI {}{})", addr, sni, mtls),
            None if stream.is_tls() => tracing::info!("[{}] Client connected (TLS{})", addr, mtls),
            None => tracing::info!("[{}] Client connected", addr),
        }

        let connection = Connection::new(
            stream,
            addr,
            lease,
            Arc::clone(&self.service),
            Arc::clone(&self.settings),
            self.drain.subscribe(),
        )
        .with_metrics(self.metrics.clone());
        if let Err(e) = connection.run().await {
            tracing::debug!("[{}] Connection error: {}", addr, e);
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("active", &self.active_connections())
            .finish()
    }
}
