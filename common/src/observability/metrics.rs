//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Each binary owns its registry
//! and controls which metrics it reports.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / gauge sets.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Streaming counters
    pub datagrams_sent_total: IntCounter,
    pub datagrams_received_total: IntCounter,
    pub datagrams_dropped_total: IntCounter,
    pub datagrams_recovered_total: IntCounter,
    pub recovery_requests_total: IntCounter,
    pub songs_completed_total: IntCounter,

    // Disk cache counters
    pub cache_evictions_total: IntCounter,
    pub sink_writes_dropped_total: IntCounter,

    // Gauges
    pub peers_active: IntGauge,
    pub reassembly_missing: IntGauge,
    pub cache_bytes: IntGauge,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("wss".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let datagrams_sent_total = counter(
            &registry,
            "datagrams_sent_total",
            "Total audio datagrams sent to the multicast group",
        )?;
        let datagrams_received_total = counter(
            &registry,
            "datagrams_received_total",
            "Total audio datagrams decoded from the multicast group",
        )?;
        let datagrams_dropped_total = counter(
            &registry,
            "datagrams_dropped_total",
            "Total datagrams dropped as corrupt or unexpected",
        )?;
        let datagrams_recovered_total = counter(
            &registry,
            "datagrams_recovered_total",
            "Total datagrams delivered over the recovery channel",
        )?;
        let recovery_requests_total = counter(
            &registry,
            "recovery_requests_total",
            "Total missing-datagram requests sent or served",
        )?;
        let songs_completed_total = counter(
            &registry,
            "songs_completed_total",
            "Total songs fully reassembled",
        )?;
        let cache_evictions_total = counter(
            &registry,
            "cache_evictions_total",
            "Total files evicted from the disk cache",
        )?;
        let sink_writes_dropped_total = counter(
            &registry,
            "sink_writes_dropped_total",
            "Total disk writes dropped on lock contention or I/O failure",
        )?;

        let peers_active = gauge(&registry, "peers_active", "Peers currently registered")?;
        let reassembly_missing = gauge(
            &registry,
            "reassembly_missing",
            "Datagrams missing from the active reassembly buffer",
        )?;
        let cache_bytes = gauge(&registry, "cache_bytes", "Bytes held in the disk cache")?;

        Ok(Self {
            registry,
            datagrams_sent_total,
            datagrams_received_total,
            datagrams_dropped_total,
            datagrams_recovered_total,
            recovery_requests_total,
            songs_completed_total,
            cache_evictions_total,
            sink_writes_dropped_total,
            peers_active,
            reassembly_missing,
            cache_bytes,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    // ---
    let metric = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    // ---
    let metric = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.datagrams_sent_total.inc_by(3);
        ctx.peers_active.set(2);

        let families = ctx.gather();
        assert!(!families.is_empty());
        assert!(families
            .iter()
            .any(|f| f.get_name() == "wss_datagrams_sent_total"));
    }

    #[test]
    fn separate_contexts_do_not_collide() {
        // ---
        let a = MetricsContext::new("server").expect("server metrics");
        let b = MetricsContext::new("client").expect("client metrics");
        a.songs_completed_total.inc();

        assert_eq!(a.songs_completed_total.get(), 1);
        assert_eq!(b.songs_completed_total.get(), 0);
    }
}
