use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DownloadLabels {
    pub namespace: String,
    pub module: String,
    pub version: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub endpoint: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the registry.
pub struct Metrics {
    // -- gateway --
    pub requests_total: Family<EndpointLabels, Counter>,
    pub downloads_total: Family<DownloadLabels, Counter>,

    // -- caching --
    pub version_cache_hits: Counter,
    pub version_cache_misses: Counter,
    pub archive_cache_hits: Counter,
    pub archive_cache_misses: Counter,
    pub cache_swept_entries: Counter,

    // -- upstream API --
    pub upstream_requests: Family<UpstreamLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgemod_requests",
            "Registry requests by endpoint",
            requests_total.clone(),
        );

        let downloads_total = Family::<DownloadLabels, Counter>::default();
        registry.register(
            "forgemod_downloads",
            "Module archive downloads by namespace, module and version",
            downloads_total.clone(),
        );

        let version_cache_hits = Counter::default();
        registry.register(
            "forgemod_version_cache_hits",
            "Version list cache hits",
            version_cache_hits.clone(),
        );

        let version_cache_misses = Counter::default();
        registry.register(
            "forgemod_version_cache_misses",
            "Version list cache misses",
            version_cache_misses.clone(),
        );

        let archive_cache_hits = Counter::default();
        registry.register(
            "forgemod_archive_cache_hits",
            "Archive store hits",
            archive_cache_hits.clone(),
        );

        let archive_cache_misses = Counter::default();
        registry.register(
            "forgemod_archive_cache_misses",
            "Archive store misses",
            archive_cache_misses.clone(),
        );

        let cache_swept_entries = Counter::default();
        registry.register(
            "forgemod_cache_swept_entries",
            "Expired version list entries removed by the sweep loop",
            cache_swept_entries.clone(),
        );

        let upstream_requests = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "forgemod_upstream_requests",
            "Upstream API calls by endpoint and response status",
            upstream_requests.clone(),
        );

        Self {
            requests_total,
            downloads_total,
            version_cache_hits,
            version_cache_misses,
            archive_cache_hits,
            archive_cache_misses,
            cache_swept_entries,
            upstream_requests,
        }
    }

    pub fn record_request(&self, endpoint: &str) {
        self.requests_total
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }

    pub fn record_download(&self, namespace: &str, module: &str, version: &str) {
        self.downloads_total
            .get_or_create(&DownloadLabels {
                namespace: namespace.to_string(),
                module: module.to_string(),
                version: version.to_string(),
            })
            .inc();
    }

    /// Count an upstream call.  `status` is `None` when no response arrived.
    pub fn record_upstream(&self, endpoint: &str, status: Option<u16>) {
        let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
        self.upstream_requests
            .get_or_create(&UpstreamLabels {
                endpoint: endpoint.to_string(),
                status,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by handlers and the
/// repository layer.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HTTP exposition
// ---------------------------------------------------------------------------

/// Router for the dedicated metrics listener.
pub fn metrics_router(registry: MetricsRegistry) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(registry)
}

/// `GET /metrics`
async fn handle_metrics(State(registry): State<MetricsRegistry>) -> Response {
    match registry.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
