use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics in Prometheus text format. Scraping also runs upkeep so
/// histogram buckets do not grow unbounded between scrapes.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.run_upkeep();
    handle.render()
}
