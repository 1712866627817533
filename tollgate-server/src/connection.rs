//! Per-connection driver.
//!
//! A [`Connection`] owns one accepted stream and one leased processor. It
//! reads bytes, lets the processor frame them, hands each request to the
//! [`Service`] and writes the produced response, until the peer leaves, the
//! processor ends keep-alive, the idle timeout fires or the endpoint drains.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::pool::Lease;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tollgate_core::Exchange;
use tollgate_protocol::{Consumed, ProcessorFactory, ProtocolError, Request, Response, Status};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Turns a framed request into a response.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, exchange: Exchange) -> Response;
}

/// Processor factories reachable through `Connection: upgrade`.
#[derive(Default)]
pub struct UpgradeProtocols {
    factories: RwLock<HashMap<String, Arc<dyn ProcessorFactory>>>,
}

impl UpgradeProtocols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name` (case-insensitive).
    pub fn register(&self, name: &str, factory: Arc<dyn ProcessorFactory>) {
        self.factories
            .write()
            .insert(name.to_ascii_lowercase(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessorFactory>> {
        self.factories.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for UpgradeProtocols {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeProtocols")
            .field("names", &self.names())
            .finish()
    }
}

/// Settings shared by every connection of one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    /// Requests served before the connection is closed. `None` is unlimited.
    pub keep_alive_limit: Option<u32>,
    /// Whether the transport is confidential.
    pub secure: bool,
    /// Keep the secure flag a processor read off the wire. Otherwise only
    /// `secure` decides.
    pub trust_forwarded_secure: bool,
    pub redirect_port: Option<u16>,
    pub upgrades: Arc<UpgradeProtocols>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            keep_alive_limit: None,
            secure: false,
            trust_forwarded_secure: false,
            redirect_port: None,
            upgrades: Arc::new(UpgradeProtocols::new()),
        }
    }
}

pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    lease: Lease,
    service: Arc<dyn Service>,
    settings: Arc<ConnectionSettings>,
    metrics: Option<Arc<Metrics>>,
    drain: watch::Receiver<bool>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    served: u32,
    /// A request has started arriving but is not complete yet.
    in_flight: bool,
    /// The drain sender is gone; no signal can arrive any more.
    drain_detached: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        lease: Lease,
        service: Arc<dyn Service>,
        settings: Arc<ConnectionSettings>,
        drain: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            addr,
            lease,
            service,
            settings,
            metrics: None,
            drain,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            served: 0,
            in_flight: false,
            drain_detached: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of requests served so far.
    pub fn served(&self) -> u32 {
        self.served
    }

    fn draining(&self) -> bool {
        *self.drain.borrow()
    }

    /// Serves the connection until it closes.
    pub async fn run(mut self) -> Result<(), ServerError> {
        loop {
            while !self.read_buf.is_empty() {
                match self.lease.consume(&mut self.read_buf) {
                    Ok(Consumed::NeedMore) => {
                        self.in_flight = true;
                        break;
                    }
                    Ok(Consumed::Reply(bytes)) => {
                        self.in_flight = true;
                        self.stream.write_all(&bytes).await?;
                        self.stream.flush().await?;
                    }
                    Ok(Consumed::Request(request)) => {
                        self.in_flight = false;
                        if !self.dispatch(request).await? {
                            return self.close().await;
                        }
                    }
                    Err(e) => return self.fail(e).await,
                }
            }

            if !self.in_flight && self.draining() {
                tracing::debug!("[{}] Closing idle connection for shutdown", self.addr);
                return self.close().await;
            }

            self.read_buf.reserve(READ_BUFFER_SIZE);
            let idle_timeout = self.settings.idle_timeout;
            let watch_drain = !self.drain_detached && !self.draining();
            tokio::select! {
                changed = self.drain.changed(), if watch_drain => {
                    if changed.is_err() {
                        self.drain_detached = true;
                    }
                }
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result? {
                        0 => {
                            tracing::debug!("[{}] Connection closed by client", self.addr);
                            return Ok(());
                        }
                        n => tracing::trace!("[{}] Read {} bytes", self.addr, n),
                    }
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    tracing::debug!("[{}] Idle timeout", self.addr);
                    return self.close().await;
                }
            }
        }
    }

    /// Handles one framed request. Returns whether the connection stays open.
    async fn dispatch(&mut self, mut request: Request) -> Result<bool, ServerError> {
        if request.secure && !self.settings.trust_forwarded_secure {
            tracing::debug!("[{}] Ignoring forwarded secure flag", self.addr);
        }
        request.secure =
            self.settings.secure || (request.secure && self.settings.trust_forwarded_secure);
        if request.remote_addr.is_none() {
            request.remote_addr = Some(self.addr);
        }

        if let Some(name) = self.lease.upgrade_name(&request).map(str::to_string) {
            match self.settings.upgrades.get(&name) {
                Some(factory) => {
                    let mut response = Response::with_status(Status::SWITCHING_PROTOCOLS);
                    response.set_header("Connection", "Upgrade");
                    response.set_header("Upgrade", name.as_str());
                    self.write_response(&mut response).await?;
                    tracing::info!(
                        "[{}] Upgraded {} -> {}",
                        self.addr,
                        self.lease.protocol(),
                        factory.protocol()
                    );
                    self.lease.replace(factory.create());
                    return Ok(true);
                }
                None => tracing::debug!("[{}] Ignoring unknown upgrade {:?}", self.addr, name),
            }
        }

        self.served += 1;
        if self
            .settings
            .keep_alive_limit
            .is_some_and(|limit| self.served >= limit)
            || self.draining()
        {
            self.lease.force_close();
        }

        let protocol = self.lease.protocol();
        let started = Instant::now();
        tracing::debug!("[{}] {} {}", self.addr, request.method, request.path);

        let mut exchange = Exchange::new(request);
        exchange.redirect_port = self.settings.redirect_port;
        let mut response = self.service.call(exchange).await;
        self.write_response(&mut response).await?;

        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.with_label_values(&[protocol]).inc();
            metrics
                .responses_total
                .with_label_values(&[response.status().class()])
                .inc();
            metrics
                .request_duration
                .with_label_values(&[protocol])
                .observe(started.elapsed().as_secs_f64());
        }
        Ok(self.lease.keep_alive())
    }

    async fn write_response(&mut self, response: &mut Response) -> Result<(), ServerError> {
        self.write_buf.clear();
        self.lease.produce(response, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Answers a framing error with its client-error status and closes.
    async fn fail(&mut self, error: ProtocolError) -> Result<(), ServerError> {
        tracing::warn!("[{}] {} framing error: {}", self.addr, self.lease.protocol(), error);
        if let Some(ref metrics) = self.metrics {
            metrics
                .protocol_errors_total
                .with_label_values(&[self.lease.protocol()])
                .inc();
        }
        if let Some(status) = error.status() {
            self.lease.force_close();
            let mut response = Response::new();
            response.send_error(status);
            if let Err(e) = self.write_response(&mut response).await {
                tracing::debug!("[{}] Failed to send error response: {}", self.addr, e);
            }
        }
        let _ = self.stream.shutdown().await;
        Err(error.into())
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("[{}] Shutdown error: {}", self.addr, e);
        }
        Ok(())
    }
}
