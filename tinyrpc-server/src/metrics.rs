//! Prometheus metrics for served connections and calls.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tinyrpc_protocol::CodecType;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Call latency buckets in seconds.
const CALL_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Failure classes recorded in `tinyrpc_errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad option line, magic number or codec.
    Handshake,
    /// Body frame that could not be used.
    Decode,
    /// Handler or lookup failure.
    Call,
    /// Response could not be written.
    Write,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Handshake => "handshake",
            ErrorKind::Decode => "decode",
            ErrorKind::Call => "call",
            ErrorKind::Write => "write",
        }
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Server-side RPC metrics, each instance with its own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    connections_open: IntGauge,
    connections_accepted: IntCounter,
    handshakes: IntCounterVec,
    calls: IntCounterVec,
    calls_inflight: IntGauge,
    call_duration: HistogramVec,
    errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            connections_open: register(
                &registry,
                IntGauge::new("tinyrpc_connections_open", "Connections currently open")?,
            )?,
            connections_accepted: register(
                &registry,
                IntCounter::new("tinyrpc_connections_accepted_total", "Connections accepted")?,
            )?,
            handshakes: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("tinyrpc_handshakes_total", "Completed handshakes by codec"),
                    &["codec"],
                )?,
            )?,
            calls: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("tinyrpc_calls_total", "Finished calls by method and status"),
                    &["method", "status"],
                )?,
            )?,
            calls_inflight: register(
                &registry,
                IntGauge::new("tinyrpc_calls_inflight", "Calls currently dispatched")?,
            )?,
            call_duration: register(
                &registry,
                HistogramVec::new(
                    HistogramOpts::new("tinyrpc_call_duration_seconds", "Call latency by method")
                        .buckets(CALL_BUCKETS.to_vec()),
                    &["method"],
                )?,
            )?,
            errors: register(
                &registry,
                IntCounterVec::new(
                    Opts::new("tinyrpc_errors_total", "Failures by kind"),
                    &["kind"],
                )?,
            )?,
            registry,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.inc();
        self.connections_open.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_open.dec();
    }

    pub fn handshake_completed(&self, codec_type: &CodecType) {
        self.handshakes.with_label_values(&[codec_type.as_str()]).inc();
    }

    pub fn error(&self, kind: ErrorKind) {
        self.errors.with_label_values(&[kind.as_str()]).inc();
    }

    /// Marks a call as in flight until the returned timer is dropped.
    pub fn start_call(&self) -> CallTimer<'_> {
        self.calls_inflight.inc();
        CallTimer {
            metrics: self,
            started: Instant::now(),
        }
    }

    /// Encodes every series in the Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Tracks one dispatched call.
pub struct CallTimer<'a> {
    metrics: &'a Metrics,
    started: Instant,
}

impl CallTimer<'_> {
    /// Records the outcome and latency of the call.
    pub fn finish(self, method: &str, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        self.metrics
            .calls
            .with_label_values(&[method, status])
            .inc();
        self.metrics
            .call_duration
            .with_label_values(&[method])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

impl Drop for CallTimer<'_> {
    fn drop(&mut self) {
        self.metrics.calls_inflight.dec();
    }
}

/// Binds `addr` and serves `/metrics` and `/health` until shutdown.
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
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::error!("Metrics accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = respond(&req, &metrics);
                async move { response }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("Metrics connection error: {}", e);
            }
        });
    }
    tracing::info!("Metrics server stopped");
}

fn respond<B>(
    req: &Request<B>,
    metrics: &Metrics,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => (
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                Bytes::from(body),
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "text/plain", Bytes::new())
            }
        },
        "/health" => (StatusCode::OK, "text/plain", Bytes::from_static(b"OK")),
        _ => (StatusCode::NOT_FOUND, "text/plain", Bytes::new()),
    };
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body))
}
