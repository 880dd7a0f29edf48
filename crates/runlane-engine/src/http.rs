// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API for the run engine.
//!
//! JSON routes mirroring the [`Engine`] operations. Payloads and outputs are
//! carried as JSON values and stored as their serialized bytes; stored bytes
//! that are not JSON come back as a string.
//!
//! Errors use a single envelope, `{"error": {"code": ..., "message": ...}}`,
//! with the status derived from the engine error:
//!
//! | Error                                              | Status |
//! |----------------------------------------------------|--------|
//! | run / waitpoint / snapshot not found               | 404    |
//! | stale snapshot, terminal run, illegal transition   | 409    |
//! | lock timeout, database unavailable                 | 503    |
//! | validation                                         | 400    |

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::{AttemptContext, AttemptOutcome, DequeuedRun, Engine, ParentRun, TriggerRunRequest};
use crate::error::EngineError;
use crate::persistence::{RunRecord, SnapshotRecord, WaitpointRecord};
use crate::queues::{TaskRegistration, WorkerRegistration};
use crate::snapshots::SnapshotView;

// ============================================================================
// Errors
// ============================================================================

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::RunNotFound { .. }
            | EngineError::WaitpointNotFound { .. }
            | EngineError::SnapshotNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. }
            | EngineError::RunNotBlockable { .. }
            | EngineError::RunTerminal { .. }
            | EngineError::SnapshotStale { .. } => StatusCode::CONFLICT,
            EngineError::LockTimeout { .. } | EngineError::Database { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
                "transient": self.0.is_transient(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn encode_json(value: &Value) -> ApiResult<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(EngineError::from)?)
}

fn decode_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub project_id: String,
    pub task_identifier: String,
    pub queue_name: String,
    pub worker_queue: String,
    pub concurrency_key: Option<String>,
    pub payload: Value,
    pub status: String,
    pub current_snapshot_id: String,
    pub attempt_number: i32,
    pub parent_run_id: Option<String>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<RunRecord> for RunResponse {
    fn from(run: RunRecord) -> Self {
        Self {
            payload: decode_json(&run.payload),
            output: run.output.as_deref().map(decode_json),
            id: run.id,
            friendly_id: run.friendly_id,
            environment_id: run.environment_id,
            project_id: run.project_id,
            task_identifier: run.task_identifier,
            queue_name: run.queue_name,
            worker_queue: run.worker_queue,
            concurrency_key: run.concurrency_key,
            status: run.status,
            current_snapshot_id: run.current_snapshot_id,
            attempt_number: run.attempt_number,
            parent_run_id: run.parent_run_id,
            error: run.error,
            created_at: run.created_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub id: String,
    pub run_id: String,
    pub seq: i64,
    pub status: String,
    pub description: String,
    pub validity: String,
    pub checkpoint_id: Option<String>,
    pub attempt_number: i32,
    pub created_at: DateTime<Utc>,
}

impl From<SnapshotRecord> for SnapshotResponse {
    fn from(s: SnapshotRecord) -> Self {
        Self {
            id: s.id,
            run_id: s.run_id,
            seq: s.seq,
            status: s.status,
            description: s.description,
            validity: s.validity,
            checkpoint_id: s.checkpoint_id,
            attempt_number: s.attempt_number,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WaitpointResponse {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub project_id: String,
    pub kind: String,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub complete_after: Option<DateTime<Utc>>,
    pub completed_by_run_id: Option<String>,
    pub output: Option<Value>,
    pub output_is_error: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<WaitpointRecord> for WaitpointResponse {
    fn from(w: WaitpointRecord) -> Self {
        Self {
            output: w.output.as_deref().map(decode_json),
            id: w.id,
            friendly_id: w.friendly_id,
            environment_id: w.environment_id,
            project_id: w.project_id,
            kind: w.kind,
            status: w.status,
            idempotency_key: w.idempotency_key,
            complete_after: w.complete_after,
            completed_by_run_id: w.completed_by_run_id,
            output_is_error: w.output_is_error,
            created_at: w.created_at,
            completed_at: w.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotViewResponse {
    #[serde(flatten)]
    pub snapshot: SnapshotResponse,
    pub waitpoints: Vec<WaitpointResponse>,
}

impl From<SnapshotView> for SnapshotViewResponse {
    fn from(view: SnapshotView) -> Self {
        Self {
            snapshot: view.snapshot.into(),
            waitpoints: view.waitpoints.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DequeuedRunResponse {
    pub run: RunResponse,
    pub snapshot_id: String,
    pub delivery_count: i32,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl From<DequeuedRun> for DequeuedRunResponse {
    fn from(d: DequeuedRun) -> Self {
        Self {
            run: d.run.into(),
            snapshot_id: d.snapshot_id,
            delivery_count: d.message.delivery_count,
            lease_expires_at: d.message.lease_expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AttemptResponse {
    pub run: RunResponse,
    pub snapshot: SnapshotResponse,
    pub attempt_number: i32,
    pub checkpoint_id: Option<String>,
    pub checkpoint: Option<Value>,
}

impl From<AttemptContext> for AttemptResponse {
    fn from(a: AttemptContext) -> Self {
        Self {
            run: a.run.into(),
            snapshot: a.snapshot.into(),
            attempt_number: a.attempt_number,
            checkpoint_id: a.checkpoint.as_ref().map(|c| c.checkpoint_id.clone()),
            checkpoint: a.checkpoint.map(|c| decode_json(&c.state)),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TriggerRunBody {
    pub environment_id: String,
    pub project_id: String,
    pub task_identifier: String,
    #[serde(default)]
    pub payload: Value,
    pub queue_name: Option<String>,
    pub worker_queue: Option<String>,
    pub concurrency_key: Option<String>,
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub block_parent: bool,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotBody {
    pub snapshot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteAttemptBody {
    pub snapshot_id: String,
    #[serde(default)]
    pub output: Value,
    /// Reports a failed attempt when present.
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuspendBody {
    pub snapshot_id: String,
    pub checkpoint: Value,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "canceled".to_string()
}

#[derive(Debug, Deserialize)]
pub struct BlockBody {
    pub waitpoint_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWaitpointBody {
    pub environment_id: String,
    pub project_id: String,
    pub idempotency_key: Option<String>,
    /// Creates a DATETIME waitpoint when present.
    pub complete_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteWaitpointBody {
    pub output: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
pub struct DequeueBody {
    pub consumer_id: String,
    pub max_messages: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QueueLimitBody {
    pub concurrency_limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct EnvLimitBody {
    pub concurrency_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TaskBody {
    pub task_identifier: String,
    pub queue_name: Option<String>,
    pub concurrency_limit: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub rate_limit_period_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerBody {
    pub environment_id: String,
    pub version: String,
    pub tasks: Vec<TaskBody>,
    pub environment_max: Option<i64>,
    pub organization_max: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeployedBody {
    pub task_identifiers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(engine): State<Engine>) -> ApiResult<Json<Value>> {
    let healthy = engine.persistence().health_check_db().await?;
    Ok(Json(json!({ "healthy": healthy })))
}

async fn trigger_run(
    State(engine): State<Engine>,
    Json(body): Json<TriggerRunBody>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let request = TriggerRunRequest {
        payload: encode_json(&body.payload)?,
        environment_id: body.environment_id,
        project_id: body.project_id,
        task_identifier: body.task_identifier,
        queue_name: body.queue_name,
        worker_queue: body.worker_queue,
        concurrency_key: body.concurrency_key,
        parent: body.parent_run_id.map(|run_id| ParentRun {
            run_id,
            block: body.block_parent,
        }),
    };
    let run = engine.trigger_run(request).await?;
    Ok((StatusCode::CREATED, Json(run.into())))
}

async fn get_run(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    Ok(Json(engine.get_run(&run_id).await?.into()))
}

async fn start_attempt(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<AttemptResponse>> {
    let attempt = engine.start_run_attempt(&run_id, &body.snapshot_id).await?;
    Ok(Json(attempt.into()))
}

async fn heartbeat(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<Value>> {
    let expires_at = engine.heartbeat_run(&run_id, &body.snapshot_id).await?;
    Ok(Json(json!({ "lease_expires_at": expires_at })))
}

async fn complete_attempt(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<CompleteAttemptBody>,
) -> ApiResult<Json<RunResponse>> {
    let outcome = match body.error {
        Some(error) => AttemptOutcome::Failure { error },
        None => AttemptOutcome::Success {
            output: encode_json(&body.output)?,
        },
    };
    let run = engine
        .complete_run_attempt(&run_id, &body.snapshot_id, outcome)
        .await?;
    Ok(Json(run.into()))
}

async fn suspend(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<SuspendBody>,
) -> ApiResult<Json<SnapshotResponse>> {
    let snapshot = engine
        .suspend_run(&run_id, &body.snapshot_id, encode_json(&body.checkpoint)?)
        .await?;
    Ok(Json(snapshot.into()))
}

async fn cancel(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<RunResponse>> {
    Ok(Json(engine.cancel_run(&run_id, &body.reason).await?.into()))
}

async fn block(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
    Json(body): Json<BlockBody>,
) -> ApiResult<Json<SnapshotResponse>> {
    let snapshot = engine
        .block_run_with_waitpoint(&run_id, &body.waitpoint_ids)
        .await?;
    Ok(Json(snapshot.into()))
}

async fn list_snapshots(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<SnapshotResponse>>> {
    let snapshots = engine.list_snapshots(&run_id).await?;
    Ok(Json(snapshots.into_iter().map(Into::into).collect()))
}

async fn latest_snapshot(
    State(engine): State<Engine>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<SnapshotViewResponse>> {
    Ok(Json(engine.get_latest_snapshot(&run_id).await?.into()))
}

async fn snapshots_since(
    State(engine): State<Engine>,
    Path((run_id, snapshot_id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<SnapshotViewResponse>>> {
    match engine.get_snapshots_since(&run_id, &snapshot_id).await? {
        Some(views) => Ok(Json(views.into_iter().map(Into::into).collect())),
        None => Err(EngineError::SnapshotNotFound {
            run_id,
            snapshot_id,
        }
        .into()),
    }
}

async fn create_waitpoint(
    State(engine): State<Engine>,
    Json(body): Json<CreateWaitpointBody>,
) -> ApiResult<(StatusCode, Json<WaitpointResponse>)> {
    let key = body.idempotency_key.as_deref();
    let waitpoint = match body.complete_after {
        Some(at) => {
            engine
                .create_date_time_waitpoint(&body.environment_id, &body.project_id, at, key)
                .await?
        }
        None => {
            engine
                .create_manual_waitpoint(&body.environment_id, &body.project_id, key)
                .await?
        }
    };
    Ok((StatusCode::CREATED, Json(waitpoint.into())))
}

async fn complete_waitpoint(
    State(engine): State<Engine>,
    Path(waitpoint_id): Path<String>,
    Json(body): Json<CompleteWaitpointBody>,
) -> ApiResult<Json<WaitpointResponse>> {
    let output = body.output.as_ref().map(encode_json).transpose()?;
    let waitpoint = engine
        .complete_waitpoint(&waitpoint_id, output, body.is_error)
        .await?;
    Ok(Json(waitpoint.into()))
}

async fn dequeue(
    State(engine): State<Engine>,
    Path(worker_queue): Path<String>,
    Json(body): Json<DequeueBody>,
) -> ApiResult<Json<Vec<DequeuedRunResponse>>> {
    let runs = engine
        .dequeue_from_worker_queue(&body.consumer_id, &worker_queue, body.max_messages)
        .await?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

async fn set_queue_limit(
    State(engine): State<Engine>,
    Path((environment_id, queue_name)): Path<(String, String)>,
    Json(body): Json<QueueLimitBody>,
) -> ApiResult<StatusCode> {
    engine
        .update_queue_concurrency_limits(&environment_id, &queue_name, body.concurrency_limit)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_queue_limit(
    State(engine): State<Engine>,
    Path((environment_id, queue_name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    engine
        .remove_queue_concurrency_limits(&environment_id, &queue_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_env_limit(
    State(engine): State<Engine>,
    Path(environment_id): Path<String>,
    Json(body): Json<EnvLimitBody>,
) -> ApiResult<StatusCode> {
    engine
        .update_env_concurrency_limits(&environment_id, body.concurrency_limit)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_worker(
    State(engine): State<Engine>,
    Json(body): Json<RegisterWorkerBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let registration = WorkerRegistration {
        environment_id: body.environment_id,
        version: body.version,
        tasks: body
            .tasks
            .into_iter()
            .map(|t| TaskRegistration {
                task_identifier: t.task_identifier,
                queue_name: t.queue_name,
                concurrency_limit: t.concurrency_limit,
                rate_limit_count: t.rate_limit_count,
                rate_limit_period_ms: t.rate_limit_period_ms,
            })
            .collect(),
        environment_max: body.environment_max,
        organization_max: body.organization_max,
    };
    // The resume keeps running after the response is sent.
    let registered = engine.register_worker(registration).await?;
    let queues: Vec<Value> = registered
        .queues
        .iter()
        .map(|q| {
            json!({
                "name": q.name,
                "kind": q.kind,
                "concurrency_limit": q.concurrency_limit,
            })
        })
        .collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "worker_id": registered.worker.id,
            "environment_id": registered.worker.environment_id,
            "version": registered.worker.version,
            "queues": queues,
        })),
    ))
}

async fn worker_deployed(
    State(engine): State<Engine>,
    Path(environment_id): Path<String>,
    Json(body): Json<DeployedBody>,
) -> StatusCode {
    let _ = engine.worker_deployed(&environment_id, body.task_identifiers);
    StatusCode::ACCEPTED
}

async fn reclaim_leases(
    State(engine): State<Engine>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let reclaimed = engine
        .reclaim_expired_leases(query.limit.unwrap_or(crate::engine::DEFAULT_RECLAIM_BATCH))
        .await?;
    Ok(Json(json!({ "reclaimed": reclaimed })))
}

async fn complete_due_waitpoints(
    State(engine): State<Engine>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let completed = engine
        .complete_due_date_time_waitpoints(query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({ "completed": completed })))
}

/// Build the API router.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(trigger_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/attempts", post(start_attempt))
        .route("/runs/{run_id}/heartbeat", post(heartbeat))
        .route("/runs/{run_id}/complete", post(complete_attempt))
        .route("/runs/{run_id}/suspend", post(suspend))
        .route("/runs/{run_id}/cancel", post(cancel))
        .route("/runs/{run_id}/block", post(block))
        .route("/runs/{run_id}/snapshots", get(list_snapshots))
        .route("/runs/{run_id}/snapshots/latest", get(latest_snapshot))
        .route(
            "/runs/{run_id}/snapshots/since/{snapshot_id}",
            get(snapshots_since),
        )
        .route("/waitpoints", post(create_waitpoint))
        .route("/waitpoints/{waitpoint_id}/complete", post(complete_waitpoint))
        .route("/worker-queues/{worker_queue}/dequeue", post(dequeue))
        .route(
            "/environments/{environment_id}/queue-limits/{*queue_name}",
            put(set_queue_limit).delete(remove_queue_limit),
        )
        .route("/environments/{environment_id}/limit", put(set_env_limit))
        .route(
            "/environments/{environment_id}/deployments",
            post(worker_deployed),
        )
        .route("/workers", post(register_worker))
        .route("/maintenance/reclaim-leases", post(reclaim_leases))
        .route(
            "/maintenance/complete-due-waitpoints",
            post(complete_due_waitpoints),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve the API until `shutdown_rx` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    engine: Engine,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        })
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                EngineError::RunNotFound {
                    run_id: "r".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                EngineError::SnapshotStale {
                    run_id: "r".to_string(),
                    presented: "a".to_string(),
                    current: "b".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::RunTerminal {
                    run_id: "r".to_string(),
                    status: "FINISHED".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::LockTimeout {
                    run_id: "r".to_string(),
                    waited_ms: 10,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::Validation {
                    field: "f".to_string(),
                    message: "m".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_decode_non_json_bytes() {
        assert_eq!(decode_json(b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(decode_json(b"plain text"), json!("plain text"));
    }

    #[tokio::test]
    async fn test_run_lifecycle_over_http() {
        let engine = test_engine().await;
        register_task(&engine, "email/send").await;
        let app = router(engine);

        let (status, run) = call(
            &app,
            Method::POST,
            "/runs",
            Some(json!({
                "environment_id": "env-1",
                "project_id": "proj-1",
                "task_identifier": "email/send",
                "payload": {"to": "a@b.c"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["status"], "QUEUED");
        assert_eq!(run["payload"]["to"], "a@b.c");
        let run_id = run["id"].as_str().unwrap().to_string();

        let (status, dequeued) = call(
            &app,
            Method::POST,
            "/worker-queues/env-1/dequeue",
            Some(json!({"consumer_id": "worker-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let snapshot_id = dequeued[0]["snapshot_id"].as_str().unwrap().to_string();

        let (status, attempt) = call(
            &app,
            Method::POST,
            &format!("/runs/{run_id}/attempts"),
            Some(json!({"snapshot_id": snapshot_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attempt["attempt_number"], 1);
        let executing = attempt["snapshot"]["id"].as_str().unwrap().to_string();

        // Presenting the dequeue snapshot again is stale.
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/runs/{run_id}/complete"),
            Some(json!({"snapshot_id": snapshot_id, "output": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "SNAPSHOT_STALE");

        let (status, finished) = call(
            &app,
            Method::POST,
            &format!("/runs/{run_id}/complete"),
            Some(json!({"snapshot_id": executing, "output": {"sent": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(finished["status"], "FINISHED");
        assert_eq!(finished["output"]["sent"], true);

        let (status, since) = call(
            &app,
            Method::GET,
            &format!("/runs/{run_id}/snapshots/since/{executing}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(since.as_array().unwrap().len(), 1);
        assert_eq!(since[0]["status"], "FINISHED");
    }

    #[tokio::test]
    async fn test_not_found_and_limits_over_http() {
        let engine = test_engine().await;
        let app = router(engine);

        let (status, body) = call(&app, Method::GET, "/runs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "RUN_NOT_FOUND");

        let (status, _) = call(
            &app,
            Method::GET,
            "/runs/missing/snapshots/since/missing",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/environments/env-1/queue-limits/task/email/send",
            Some(json!({"concurrency_limit": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/environments/env-1/queue-limits/task/email/send",
            Some(json!({"concurrency_limit": -2})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, health) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["healthy"], true);
    }

    #[tokio::test]
    async fn test_waitpoints_over_http() {
        let engine = test_engine().await;
        let app = router(engine);

        let (status, waitpoint) = call(
            &app,
            Method::POST,
            "/waitpoints",
            Some(json!({"environment_id": "env-1", "project_id": "proj-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(waitpoint["kind"], "MANUAL");
        let id = waitpoint["id"].as_str().unwrap();

        let (status, completed) = call(
            &app,
            Method::POST,
            &format!("/waitpoints/{id}/complete"),
            Some(json!({"output": {"approved": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["status"], "COMPLETED");
        assert_eq!(completed["output"]["approved"], true);
    }

    #[tokio::test]
    async fn test_dequeue_with_oversized_batch_hint() {
        let engine = test_engine().await;
        register_task(&engine, "email/send").await;
        for _ in 0..2 {
            engine.trigger_run(trigger("email/send")).await.unwrap();
        }
        let app = router(engine);

        let (status, dequeued) = call(
            &app,
            Method::POST,
            "/worker-queues/env-1/dequeue",
            Some(json!({"consumer_id": "worker-1", "max_messages": u64::MAX})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dequeued.as_array().unwrap().len(), 2);
    }
}
