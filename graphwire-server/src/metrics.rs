//! Prometheus metrics and the HTTP endpoint exposing them.
//!
//! Served paths: `/metrics` (text exposition format) and `/health`.

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
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Server-wide metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Version handshakes that ended without a usable version.
    pub handshakes_refused: Counter,
    /// Requests by message name.
    pub requests_total: CounterVec,
    /// FAILURE responses by status code.
    pub failures_total: CounterVec,
    /// IGNORED responses by message name.
    pub ignored_total: CounterVec,
    /// Time from request decode to its terminal response, by message name.
    pub request_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "graphwire_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "graphwire_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let handshakes_refused = Counter::with_opts(Opts::new(
            "graphwire_handshakes_refused_total",
            "Handshakes rejected for a bad preamble or no common version",
        ))?;
        registry.register(Box::new(handshakes_refused.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("graphwire_requests_total", "Requests received by message"),
            &["message"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let failures_total = CounterVec::new(
            Opts::new("graphwire_failures_total", "FAILURE responses by status code"),
            &["code"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        let ignored_total = CounterVec::new(
            Opts::new("graphwire_ignored_total", "IGNORED responses by message"),
            &["message"],
        )?;
        registry.register(Box::new(ignored_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "graphwire_request_duration_seconds",
                "Time until the terminal response by message",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["message"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            handshakes_refused,
            requests_total,
            failures_total,
            ignored_total,
            request_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { Ok::<_, hyper::Error>(handle_request(&req, &metrics)) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Metrics server accept error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn handle_request<B>(req: &Request<B>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => text(StatusCode::OK, body, "text/plain; version=0.0.4; charset=utf-8"),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    e.to_string().into_bytes(),
                    "text/plain",
                )
            }
        },
        "/health" | "/healthz" => text(StatusCode::OK, b"OK".to_vec(), "text/plain"),
        _ => text(StatusCode::NOT_FOUND, b"Not Found".to_vec(), "text/plain"),
    }
}

fn text(status: StatusCode, body: Vec<u8>, content_type: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
