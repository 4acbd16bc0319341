//! HTTP surface: `POST /ingest`, `GET /health`, `GET /metrics`.

use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};
use uplink_protocol::DataPacket;

use crate::cancel::CancellationToken;
use crate::pipeline::{HealthReport, HealthStatus, Pipeline};
use crate::queue::EnqueueError;

/// Shared handler state.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// `/health` answers 503 when the probe score is below this
    pub degraded_below: f64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires, then stop accepting and finish open
/// requests.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// POST /ingest
///
/// 202 on admission (including duplicates), 400 on a malformed body, 409
/// for a resend of a dead-lettered packet, 429 when the queue is full, 503
/// when shutting down.
pub async fn ingest(State(app): State<Arc<AppState>>, body: Bytes) -> (StatusCode, Json<Value>) {
    let packet: DataPacket = match serde_json::from_slice(&body) {
        Ok(packet) => packet,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"accepted": false, "reason": "bad_request", "error": e.to_string()})),
            )
        }
    };

    match app.pipeline.ingest(packet).await {
        Ok(response) => {
            let status = match &response.rejection {
                Some(EnqueueError::QueueFull { .. }) => StatusCode::TOO_MANY_REQUESTS,
                Some(EnqueueError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
                None if response.accepted => StatusCode::ACCEPTED,
                None => StatusCode::CONFLICT,
            };
            (status, Json(json!(response)))
        }
        Err(e) => {
            error!("Ingest failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"accepted": false, "reason": "internal_error", "error": e.to_string()})),
            )
        }
    }
}

/// GET /health
pub async fn health(State(app): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = app.pipeline.health_report(app.degraded_below);
    let status = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

/// GET /metrics (Prometheus text format)
pub async fn metrics(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.pipeline.metrics_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uplink_ledger::UploadLedger;
    use uplink_protocol::{AdmissionPolicy, Destination, PipelineConfig, Priority};

    fn config(max_queue_size: usize) -> PipelineConfig {
        PipelineConfig {
            worker_count: 1,
            max_queue_size,
            aging_threshold_ms: 60_000,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            shard_count: 2,
            batch_size: 1,
            admission_policy: AdmissionPolicy::Reject,
            enqueue_timeout_ms: 10,
            store_pool_size: 1,
            drain_deadline_ms: 1_000,
            health_interval_ms: 1_000,
            probe_timeout_ms: 100,
        }
    }

    async fn app(max_queue_size: usize) -> Arc<AppState> {
        let ledger = UploadLedger::open_in_memory().await.unwrap();
        let pipeline =
            Pipeline::new(config(max_queue_size), ledger, Arc::new(MemoryStore::new())).unwrap();
        Arc::new(AppState {
            pipeline,
            degraded_below: 1.0,
        })
    }

    fn body(id: &str, priority: Priority) -> Bytes {
        let packet = DataPacket::from_json(
            id,
            "compliance-feed",
            Destination::ComplianceData,
            &json!({
                "entity_id": "E-1",
                "policy_id": "P-9",
                "status": "ok",
                "reported_at": "2026-01-01T00:00:00Z"
            }),
            priority,
        )
        .unwrap();
        Bytes::from(serde_json::to_vec(&packet).unwrap())
    }

    #[tokio::test]
    async fn test_ingest_accepts_then_throttles() {
        // Not started: nothing drains the queue.
        let app = app(1).await;
        let (status, Json(value)) = ingest(State(app.clone()), body("a", Priority::Normal)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(value["accepted"], json!(true));

        let (status, Json(value)) = ingest(State(app.clone()), body("b", Priority::Normal)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(value["reason"], json!("queue_full"));

        // Higher priority displaces the queued normal packet.
        let (status, Json(value)) = ingest(State(app.clone()), body("c", Priority::Critical)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(value["displaced"], json!("a"));
    }

    #[tokio::test]
    async fn test_resend_of_displaced_packet_is_conflict() {
        let app = app(1).await;
        ingest(State(app.clone()), body("low", Priority::Normal)).await;
        let (_, Json(value)) = ingest(State(app.clone()), body("urgent", Priority::Critical)).await;
        assert_eq!(value["displaced"], json!("low"));

        let (status, Json(value)) = ingest(State(app.clone()), body("low", Priority::Normal)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(value["accepted"], json!(false));
        assert_eq!(value["reason"], json!("dead_lettered"));
    }

    #[tokio::test]
    async fn test_ingest_malformed_body_is_bad_request() {
        let app = app(4).await;
        let (status, Json(value)) = ingest(State(app), Bytes::from_static(b"{\"id\": 1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["reason"], json!("bad_request"));
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_is_unavailable() {
        let app = app(4).await;
        app.pipeline.start().await.unwrap();
        app.pipeline.shutdown().await.unwrap();

        let (status, Json(value)) = ingest(State(app), body("late", Priority::High)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(value["reason"], json!("shutting_down"));
    }

    #[tokio::test]
    async fn test_health_degraded_when_probe_fails() {
        let app = app(4).await;
        // Workers are not started, so the workers probe fails.
        app.pipeline.health().check_now().await;
        let (status, Json(report)) = health(State(app)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.probes["workers"].ok);
    }

    #[tokio::test]
    async fn test_metrics_is_prometheus_text() {
        let app = app(4).await;
        ingest(State(app.clone()), body("m1", Priority::High)).await;
        let response = metrics(State(app)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("uplink_packets_enqueued_total 1"));
    }
}
