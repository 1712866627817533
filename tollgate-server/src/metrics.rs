//! Prometheus metrics for the tollgate server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the tollgate server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted, by connector.
    pub connections_total: CounterVec,
    /// Currently active connections, all connectors.
    pub connections_active: Gauge,
    /// Connections closed on accept, by reason.
    pub connections_rejected_total: CounterVec,
    /// Total requests by protocol.
    pub requests_total: CounterVec,
    /// Responses by status class.
    pub responses_total: CounterVec,
    /// Framing errors by protocol.
    pub protocol_errors_total: CounterVec,
    /// Request duration histogram by protocol.
    pub request_duration: HistogramVec,
    /// Authenticator outcomes.
    pub auth_events_total: CounterVec,
    /// Processors taken from the pool.
    pub pool_hits_total: Counter,
    /// Processors created because the pool was empty.
    pub pool_misses_total: Counter,
    /// Live sessions.
    pub sessions_active: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = CounterVec::new(
            Opts::new(
                "tollgate_connections_total",
                "Total number of connections accepted",
            ),
            &["connector"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "tollgate_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = CounterVec::new(
            Opts::new(
                "tollgate_connections_rejected_total",
                "Connections closed right after accept",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("tollgate_requests_total", "Total requests by protocol"),
            &["protocol"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let responses_total = CounterVec::new(
            Opts::new("tollgate_responses_total", "Responses by status class"),
            &["class"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let protocol_errors_total = CounterVec::new(
            Opts::new(
                "tollgate_protocol_errors_total",
                "Framing errors by protocol",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        // Request duration
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "tollgate_request_duration_seconds",
                "Request duration in seconds by protocol",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["protocol"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Security
        let auth_events_total = CounterVec::new(
            Opts::new(
                "tollgate_auth_events_total",
                "Authenticator outcomes by kind",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(auth_events_total.clone()))?;

        // Processor pool
        let pool_hits_total = Counter::with_opts(Opts::new(
            "tollgate_pool_hits_total",
            "Processors reused from the pool",
        ))?;
        registry.register(Box::new(pool_hits_total.clone()))?;

        let pool_misses_total = Counter::with_opts(Opts::new(
            "tollgate_pool_misses_total",
            "Processors created because the pool was empty",
        ))?;
        registry.register(Box::new(pool_misses_total.clone()))?;

        // Sessions
        let sessions_active = Gauge::with_opts(Opts::new(
            "tollgate_sessions_active",
            "Number of live sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            requests_total,
            responses_total,
            protocol_errors_total,
            request_duration,
            auth_events_total,
            pool_hits_total,
            pool_misses_total,
            sessions_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serves metrics on an already bound listener until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

fn text(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::error!("failed to encode metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode error")
            }
        },
        "/health" | "/healthz" => text(StatusCode::OK, "text/plain", "OK"),
        _ => text(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}
