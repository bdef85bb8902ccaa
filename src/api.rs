//! HTTP surface for strategies and their executions.

use crate::errors::{causes_list, NotFoundError, ScheduleError, StoreError, ValidationError};
use crate::job_status::JobStatusSnapshot;
use crate::models::{
    BtExecution, BtStrategy, ExecutionError, ExecutionId, ExecutionResult, ExecutionStatus,
    NewBtStrategy, StrategyId,
};
use crate::repository::StrategyRepository;
use crate::retry::retry_db_operation;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::scheduler::JobScheduler;
use crate::store::ExecutionStore;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: JobScheduler,
    pub strategies: Arc<dyn StrategyRepository>,
    pub executions: Arc<dyn ExecutionStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backtesting-strategies", post(add_strategy))
        .route("/backtesting-strategies/:id/execute", post(execute_strategy))
        .route(
            "/backtesting-strategies/:id/execution/:execution_id/progress",
            get(execution_progress),
        )
        .route(
            "/backtesting-strategies/:id/execution/:execution_id/result",
            get(execution_result),
        )
        .route(
            "/backtesting-strategies/:id/execution/:execution_id/cancel",
            post(cancel_execution),
        )
        .route(
            "/backtesting-strategies/:id/lastExecution/progress",
            get(last_execution_progress),
        )
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: ApiState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("HTTP API listening on {}", bind_addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Uniform error body: `{"error": {"name", "type", "message", "causesList"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    name: &'static str,
    kind: &'static str,
    message: String,
    causes: Vec<String>,
}

impl ApiError {
    fn new(
        status: StatusCode,
        name: &'static str,
        kind: &'static str,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self {
            status,
            name,
            kind,
            message: err.to_string(),
            causes: causes_list(err),
        }
    }

    fn not_finished(id: &ExecutionId, status: ExecutionStatus) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            name: "ExecutionNotFinishedError",
            kind: "conflict",
            message: format!("execution {} is {}, no result available", id, status),
            causes: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{}: {}", self.name, self.message);
        }
        let body = json!({
            "error": {
                "name": self.name,
                "type": self.kind,
                "message": self.message,
                "causesList": self.causes,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "ValidationError", "validation", &err)
    }
}

impl From<NotFoundError> for ApiError {
    fn from(err: NotFoundError) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "NotFoundError", "not_found", &err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ExecutionNotFound(id) => NotFoundError::Execution(id).into(),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "StoreError",
                "internal",
                &other,
            ),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::StrategyNotFound(id) => NotFoundError::Strategy(id).into(),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ScheduleError",
                "internal",
                &other,
            ),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ValidationError::new("body", rejection.body_text()).into()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub execution_id: ExecutionId,
    pub bt_strategy_id: StrategyId,
    pub status: ExecutionStatus,
    pub percentage: u8,
    pub logs: Vec<String>,
    pub error: Option<ExecutionError>,
}

impl From<BtExecution> for ExecutionProgress {
    fn from(record: BtExecution) -> Self {
        Self {
            execution_id: record.id,
            bt_strategy_id: record.bt_strategy_id,
            status: record.status,
            percentage: record.percentage,
            logs: record.logs,
            error: record.error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduledExecution {
    execution_id: ExecutionId,
    status: ExecutionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    jobs: JobStatusSnapshot,
    executions: BTreeMap<String, usize>,
}

async fn health(State(state): State<ApiState>) -> ApiResult<Json<HealthReport>> {
    let executions = state.executions.count_by_status().await?;
    Ok(Json(HealthReport {
        status: "ok",
        jobs: state.scheduler.status().snapshot(),
        executions,
    }))
}

async fn add_strategy(
    State(state): State<ApiState>,
    payload: Result<Json<NewBtStrategy>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BtStrategy>)> {
    let Json(payload) = payload?;
    let config = state.scheduler.config();
    payload.validate(config.sandbox.max_program_bytes)?;
    compile_check(&state, &payload.body)?;

    let strategies = &state.strategies;
    let strategy = retry_db_operation!("adding strategy", async {
        strategies.add(payload.clone()).await
    })?;
    info!(
        "Added strategy {} ({} {} {})",
        strategy.id,
        strategy.exchange,
        strategy.symbol,
        strategy.timeframe.as_str()
    );
    Ok((StatusCode::CREATED, Json(strategy)))
}

fn compile_check(state: &ApiState, body: &str) -> Result<(), ValidationError> {
    let config = state.scheduler.config();
    let sandbox = Sandbox::start(SandboxConfig {
        limits: config.sandbox.clone(),
        deadline: config.job_timeout,
        prelude: None,
    })
    .map_err(|err| ValidationError::new("body", err.to_string()))?;
    sandbox
        .check(body)
        .map_err(|message| ValidationError::new("body", message))?;
    Ok(())
}

async fn execute_strategy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<ScheduledExecution>)> {
    let strategy_id = StrategyId::parse(&id)?;
    let execution_id = state.scheduler.schedule(&strategy_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScheduledExecution {
            execution_id,
            status: ExecutionStatus::Pending,
        }),
    ))
}

async fn load_execution(
    state: &ApiState,
    strategy_id: &str,
    execution_id: &str,
) -> ApiResult<BtExecution> {
    let strategy_id = StrategyId::parse(strategy_id)?;
    let execution_id = ExecutionId::parse(execution_id)?;
    let executions = &state.executions;
    let record = retry_db_operation!(format!("loading execution {}", execution_id), async {
        executions.get_by_id(&execution_id).await
    })?;
    match record {
        Some(record) if record.bt_strategy_id == strategy_id => Ok(record),
        _ => Err(NotFoundError::Execution(execution_id).into()),
    }
}

async fn execution_progress(
    State(state): State<ApiState>,
    Path((id, execution_id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionProgress>> {
    let record = load_execution(&state, &id, &execution_id).await?;
    Ok(Json(record.into()))
}

async fn execution_result(
    State(state): State<ApiState>,
    Path((id, execution_id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionResult>> {
    let record = load_execution(&state, &id, &execution_id).await?;
    match record.result {
        Some(result) if record.status == ExecutionStatus::Finished => Ok(Json(result)),
        _ => Err(ApiError::not_finished(&record.id, record.status)),
    }
}

async fn cancel_execution(
    State(state): State<ApiState>,
    Path((id, execution_id)): Path<(String, String)>,
) -> ApiResult<Json<ScheduledExecution>> {
    let record = load_execution(&state, &id, &execution_id).await?;
    let status = state
        .scheduler
        .cancel(&record.id)
        .await?
        .ok_or_else(|| NotFoundError::Execution(record.id.clone()))?;
    Ok(Json(ScheduledExecution {
        execution_id: record.id,
        status,
    }))
}

async fn last_execution_progress(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionProgress>> {
    let strategy_id = StrategyId::parse(&id)?;
    let strategies = &state.strategies;
    let exists = retry_db_operation!(format!("checking strategy {}", strategy_id), async {
        strategies.exists_by_id(&strategy_id).await
    })?;
    if !exists {
        return Err(NotFoundError::Strategy(strategy_id).into());
    }
    let executions = &state.executions;
    let record = retry_db_operation!(
        format!("loading last execution of {}", strategy_id),
        async { executions.get_last_for_strategy(&strategy_id).await }
    )?;
    record
        .map(|record| Json(record.into()))
        .ok_or_else(|| NotFoundError::NoExecutions(strategy_id).into())
}
