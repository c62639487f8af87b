//! Minimal REST front-end mounting the scheduler core behind axum.
//!
//! Illustrates how a transport layer drives [`Scheduler`]; it is not part
//! of the scheduling core itself and carries no invariants of its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use scheduler::{Config, Priority, RemoteWorkerClient, RequestSpec, SamplingParams, Scheduler};
use serde::Deserialize;
use tracing::info;

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    model_id: String,
    prompt: String,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    priority: Option<String>,
}

async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let priority = match body.priority.as_deref() {
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Normal,
    };
    let spec = RequestSpec {
        model_id: body.model_id,
        prompt: body.prompt,
        sampling_params: SamplingParams {
            max_tokens: body.max_tokens,
            ..SamplingParams::default()
        },
        priority,
        timeout_ms: None,
    };

    match state.scheduler.submit(spec) {
        Ok((request_id, rx)) => {
            info!(%request_id, "accepted request");
            match rx.await {
                Ok(Ok(outcome)) => {
                    (StatusCode::OK, Json(serde_json::json!(outcome_json(outcome))))
                }
                Ok(Err(err)) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
                ),
                Err(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "scheduler dropped the request" })),
                ),
            }
        }
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
        ),
    }
}

fn outcome_json(outcome: scheduler::RequestOutcome) -> serde_json::Value {
    serde_json::json!({
        "request_id": outcome.request_id,
        "text": outcome.text,
        "completion_tokens": outcome.completion_tokens,
        "prefill_worker_id": outcome.prefill_worker_id,
        "decode_worker_id": outcome.decode_worker_id,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.metrics())
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.events(50))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::default();
    let client = Arc::new(RemoteWorkerClient::new(
        Duration::from_millis(config.worker_client.call_timeout_ms),
        config.worker_client.legacy_fallback,
    ));
    let scheduler = Scheduler::new(config, client);
    scheduler.start();

    let app = Router::new()
        .route("/v1/requests", post(submit))
        .route("/v1/metrics", get(metrics))
        .route("/v1/events", get(events))
        .with_state(AppState { scheduler });

    let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
    info!("gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
