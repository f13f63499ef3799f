use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use orchestra_core::{
    DeviceRecord, DeviceStatus, ErrorKind, JobStatus, ModelRecord, ModelStatus, OrchestraError,
    TrainingJobRecord, get_architecture, list_architectures,
};
use orchestra_store::{NewTrainingJob, StoreError};

use crate::app::AppContext;

pub struct ApiError(OrchestraError);

impl From<OrchestraError> for ApiError {
    fn from(err: OrchestraError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidArgument => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::FailedPrecondition => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self.0.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(json!({ "error": self.0.kind(), "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:id", get(get_device).delete(delete_device))
        .route("/devices/:id/command", post(queue_device_command))
        .route("/models", get(list_models))
        .route("/models/:id", get(get_model).delete(delete_model))
        .route("/architectures", get(architectures))
        .route("/training/jobs", post(create_job).get(list_jobs))
        .route("/training/jobs/:id", get(get_job).delete(delete_job))
        .route("/training/jobs/:id/stop", post(stop_job))
        .route("/training/jobs/:id/retry", post(retry_job))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(middleware::from_fn(track_request))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn track_request(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        %request_id,
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

async fn require_api_key(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &ctx.settings.api_key {
        let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return ApiError(OrchestraError::Unauthenticated).into_response();
        }
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct StatusFilter {
    status: Option<String>,
}

// devices

async fn list_devices(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<Json<Vec<DeviceRecord>>> {
    let status = filter
        .status
        .map(|s| s.parse::<DeviceStatus>())
        .transpose()?;
    Ok(Json(ctx.devices.list_all(status).await?))
}

async fn get_device(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeviceRecord>> {
    let device = ctx
        .devices
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("device {id}")))?;
    Ok(Json(device))
}

async fn delete_device(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if !ctx.devices.delete(id).await? {
        return Err(OrchestraError::not_found(format!("device {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Operator-side command injection, e.g. `update_interval` or `shutdown`.
async fn queue_device_command(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
    Json(command): Json<orchestra_core::DeviceCommand>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.devices
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("device {id}")))?;
    ctx.heartbeat.queue_command(id, &command).await?;
    info!(device_id = %id, command = ?command.kind, "device command queued");
    Ok(Json(json!({ "queued": true })))
}

// models

async fn list_models(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<Json<Vec<ModelRecord>>> {
    let status = filter
        .status
        .map(|s| s.parse::<ModelStatus>())
        .transpose()?;
    Ok(Json(ctx.models.list_all(status).await?))
}

async fn get_model(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ModelRecord>> {
    let model = ctx
        .models
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("model {id}")))?;
    Ok(Json(model))
}

async fn delete_model(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let model = ctx
        .models
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("model {id}")))?;
    if model.status == ModelStatus::Training {
        return Err(OrchestraError::failed_precondition("model is training").into());
    }
    if ctx.jobs.count_active_for_model(id).await? > 0 {
        return Err(
            OrchestraError::failed_precondition("model is referenced by active jobs").into(),
        );
    }
    ctx.models.delete(id).await?;
    ctx.blob.delete_model_blob(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn architectures(State(_ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let entries: Vec<serde_json::Value> = list_architectures()
        .iter()
        .map(|arch| {
            json!({
                "key": arch.key,
                "name": arch.name,
                "input_shape": arch.input_shape,
                "num_classes": arch.num_classes,
                "tensors": arch
                    .tensors
                    .iter()
                    .map(|t| json!({ "name": t.name, "shape": t.shape }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({ "architectures": entries }))
}

// training jobs

#[derive(Deserialize)]
struct CreateJobRequest {
    model_id: Option<Uuid>,
    num_rounds: u32,
    min_devices: u32,
    learning_rate: f64,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

async fn create_job(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<TrainingJobRecord>)> {
    if request.num_rounds < 1 {
        return Err(OrchestraError::invalid_argument("num_rounds must be >= 1").into());
    }
    if request.min_devices < 1 {
        return Err(OrchestraError::invalid_argument("min_devices must be >= 1").into());
    }
    if !(request.learning_rate > 0.0) {
        return Err(OrchestraError::invalid_argument("learning_rate must be positive").into());
    }
    if let Some(model_id) = request.model_id {
        let model = ctx
            .models
            .get(model_id)
            .await?
            .ok_or_else(|| OrchestraError::not_found(format!("model {model_id}")))?;
        get_architecture(&model.architecture)?;
    }

    let job = ctx
        .jobs
        .create(NewTrainingJob {
            model_id: request.model_id,
            num_rounds: request.num_rounds,
            min_devices: request.min_devices,
            learning_rate: request.learning_rate,
            config: request.config,
        })
        .await?;
    info!(job_id = %job.id, rounds = job.num_rounds, "training job created");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<Json<Vec<TrainingJobRecord>>> {
    let status = filter.status.map(|s| s.parse::<JobStatus>()).transpose()?;
    Ok(Json(ctx.jobs.list_all(status).await?))
}

async fn get_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TrainingJobRecord>> {
    let job = ctx
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("job {id}")))?;
    Ok(Json(job))
}

async fn stop_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = ctx
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("job {id}")))?;
    match job.status {
        JobStatus::Running => {
            // The coordinator consumes the flag at the next round boundary.
            ctx.blob.request_stop(id).await?;
            info!(job_id = %id, "stop requested");
            Ok(Json(json!({ "status": "stopping" })))
        }
        JobStatus::Pending => {
            ctx.jobs.set_status(id, JobStatus::Stopped).await?;
            Ok(Json(json!({ "status": "stopped" })))
        }
        other => Err(OrchestraError::failed_precondition(format!(
            "job is {other}, only pending or running jobs can be stopped"
        ))
        .into()),
    }
}

async fn retry_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    match ctx.jobs.retry(id).await? {
        Some(job) => {
            info!(job_id = %id, resume_from_round = job.resume_from_round(), "job retried");
            Ok(Json(json!({
                "status": "running",
                "resume_from_round": job.resume_from_round(),
            })))
        }
        None => {
            ctx.jobs
                .get(id)
                .await?
                .ok_or_else(|| OrchestraError::not_found(format!("job {id}")))?;
            Err(OrchestraError::failed_precondition("only failed jobs can be retried").into())
        }
    }
}

async fn delete_job(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let job = ctx
        .jobs
        .get(id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("job {id}")))?;
    if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
        return Err(OrchestraError::failed_precondition("job is active").into());
    }

    if let Some(model_id) = job.model_id {
        ctx.blob.clear_all_gradients(model_id, job.num_rounds).await?;
    }
    ctx.blob.clear_stop(id).await?;
    ctx.jobs.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
