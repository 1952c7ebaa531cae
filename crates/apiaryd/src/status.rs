use crate::App;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
struct StatusState {
    app: Arc<App>,
    prometheus: PrometheusHandle,
}

/// Operator endpoint: liveness, a JSON status snapshot, and Prometheus
/// metrics.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(StatusState { app, prometheus })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[tracing::instrument(skip_all)]
async fn status(State(state): State<StatusState>) -> impl IntoResponse {
    let app = &state.app;
    let last_confirmed = app.arbiter.last_confirmed().map(|(block_num, confirmed)| {
        json!({"blockNum": block_num, "hash": confirmed.hash})
    });
    let connections: Vec<_> = app
        .connections()
        .into_iter()
        .map(|(node_id, info)| {
            let mut value = serde_json::to_value(info).expect("ConnInfo serializes");
            value["nodeId"] = json!(node_id);
            value
        })
        .collect();

    Json(json!({
        "startedAt": app.started_at,
        "connections": connections,
        "forks": app.registry.forks(),
        "lastConfirmed": last_confirmed,
        "deadLetters": app.queue.dead_letters(),
        "peers": app.peers.peer_status().into_iter().map(|p| json!({
            "base": p.base,
            "healthy": p.healthy,
            "lastSuccess": p.last_success,
        })).collect::<Vec<_>>(),
    }))
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(State(state): State<StatusState>) -> impl IntoResponse {
    (StatusCode::OK, state.prometheus.render())
}
