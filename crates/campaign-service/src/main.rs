use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::{FormRejection, JsonRejection, QueryRejection};
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use campaign_artifacts::{ArtifactStore, FsArtifactStore};
use campaign_content::{build_generator, StaticEvidenceSource};
use campaign_domain::CampaignError;
use campaign_history_core::HistoryStore;
use campaign_history_sqlite::SqliteHistoryStore;
use campaign_orchestrator::campaign::StartRequest;
use campaign_orchestrator::status::StatusView;
use campaign_orchestrator::{
    ActivityEnv, ApiError, CampaignApi, Disposition, Engine, EngineError, RunSummary,
    StartOutcome, API_CONTRACT_VERSION,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod config;

use config::{Args, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: CampaignApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RunQuery {
    #[serde(rename = "runId", alias = "run_id", default)]
    run_id: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RunsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegeneratePayload {
    #[serde(rename = "runId", alias = "run_id", default)]
    run_id: Option<String>,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    tone: Option<String>,
    #[serde(rename = "toneOverride", default)]
    tone_override: Option<String>,
}

impl RegeneratePayload {
    /// `tone` when it carries a value, otherwise `toneOverride`.
    fn tone(&self) -> Option<&str> {
        self.tone
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or(self.tone_override.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TerminatePayload {
    #[serde(rename = "runId", alias = "run_id", default)]
    run_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AcceptedResponse {
    #[serde(rename = "instanceId")]
    instance_id: String,
    #[serde(rename = "runId")]
    run_id: String,
    disposition: Disposition,
    #[serde(rename = "statusUri")]
    status_uri: String,
}

#[derive(Debug, Clone, Serialize)]
struct RunsResponse {
    runs: Vec<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
struct TerminateResponse {
    #[serde(rename = "runId")]
    run_id: String,
    terminated: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    artifact_store_configured: bool,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    configuration_error_total: AtomicU64,
    integrity_error_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    drives_started_total: AtomicU64,
    drive_failure_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    configuration_error_total: u64,
    integrity_error_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    drives_started_total: u64,
    drive_failure_total: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(api: CampaignApi, operation_timeout: Duration) -> Self {
        Self {
            api,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_form_with_telemetry(&self, rejection: &FormRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn classify_api_error(err: &ApiError) -> ServiceFailure {
        let message = err.to_string();
        match err {
            ApiError::Rejected(CampaignError::Validation(_))
            | ApiError::Engine(EngineError::InvalidInstanceId(_)) => {
                Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
            }
            ApiError::Rejected(CampaignError::NotFound(_)) => {
                Self::failure(StatusCode::NOT_FOUND, "not_found", message, None)
            }
            ApiError::Rejected(CampaignError::Configuration(_)) => Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "configuration_error",
                message,
                None,
            ),
            ApiError::Rejected(CampaignError::Integrity(_)) => Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "integrity_error",
                message,
                None,
            ),
            ApiError::Engine(_) | ApiError::Storage(_) => Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                message,
                None,
            ),
        }
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(CampaignApi) -> Result<T, ApiError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err);
                self.telemetry.record_failure(failure.code, false);
                if failure.status.is_server_error() {
                    error!(operation = operation_label, code = failure.code, error = %err, "operation failed");
                } else {
                    debug!(operation = operation_label, code = failure.code, error = %err, "operation rejected");
                }
                Err(failure)
            }
        }
    }

    /// Drive `instance_id` to completion on the blocking pool. The engine
    /// ignores a drive for an instance that is already being driven.
    fn spawn_drive(&self, instance_id: String) {
        self.telemetry.drives_started_total.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(self.api.engine());
        let telemetry = Arc::clone(&self.telemetry);
        tokio::task::spawn_blocking(move || drive_instance(&engine, &instance_id, &telemetry));
    }
}

fn drive_instance(engine: &Engine, instance_id: &str, telemetry: &ServiceTelemetry) {
    match engine.run_instance(instance_id) {
        Ok(Some(record)) => {
            debug!(instance_id, status = record.runtime_status.as_str(), "drive finished");
        }
        Ok(None) => warn!(instance_id, "drive target does not exist"),
        Err(err) => {
            telemetry.drive_failure_total.fetch_add(1, Ordering::Relaxed);
            error!(instance_id, error = %err, "drive stopped; instance left for recovery");
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "timeout" => return,
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "configuration_error" => &self.configuration_error_total,
            "integrity_error" => &self.integrity_error_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            configuration_error_total: self.configuration_error_total.load(Ordering::Relaxed),
            integrity_error_total: self.integrity_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            drives_started_total: self.drives_started_total.load(Ordering::Relaxed),
            drive_failure_total: self.drive_failure_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn accepted(run_id: &str, outcome: StartOutcome) -> (StatusCode, Json<ServiceEnvelope<AcceptedResponse>>) {
    let response = AcceptedResponse {
        status_uri: format!("/v1/campaign/status?runId={run_id}"),
        run_id: run_id.to_string(),
        instance_id: outcome.instance_id,
        disposition: outcome.disposition,
    };
    (StatusCode::ACCEPTED, Json(envelope(response)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/campaign/start", post(campaign_start))
        .route("/v1/campaign/status", get(campaign_status))
        .route("/v1/campaign/regenerate", post(campaign_regenerate))
        .route("/v1/campaign/fetch", get(campaign_fetch))
        .route("/v1/campaign/download", get(campaign_download))
        .route("/v1/campaign/runs", get(campaign_runs))
        .route("/v1/campaign/terminate", post(campaign_terminate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

fn build_state(config: &ServiceConfig) -> Result<ServiceState> {
    let history = SqliteHistoryStore::open(&config.history_db)?;
    history.migrate()?;

    let artifacts: Option<Arc<dyn ArtifactStore>> = match &config.results_root {
        Some(root) => Some(Arc::new(FsArtifactStore::open(root)?)),
        None => {
            warn!("no results root configured; runs cannot persist artifacts");
            None
        }
    };
    let content = build_generator(&config.content)?;
    info!(generator = content.generator_name(), "content generator ready");

    let env = ActivityEnv {
        artifacts,
        content,
        evidence: Arc::new(StaticEvidenceSource),
    };
    let engine = Engine::new(Arc::new(history), env, config.engine.clone());
    Ok(ServiceState::new(
        CampaignApi::new(Arc::new(engine)),
        config.operation_timeout,
    ))
}

fn resume_unfinished(state: &ServiceState) -> Result<()> {
    for instance_id in state.api.engine().recover_unfinished()? {
        state.spawn_drive(instance_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::resolve(Args::parse())?;
    init_tracing(&config.log_level, config.log_json)?;
    let state = build_state(&config)?;
    resume_unfinished(&state)?;

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, history_db = %config.history_db.display(), "campaign service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        artifact_store_configured: state.api.engine().env().artifacts.is_some(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn campaign_start(
    State(state): State<ServiceState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<AcceptedResponse>>), ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let outcome = state
        .run_blocking("campaign_start", move |api| api.start_run(&request))
        .await?;
    state.spawn_drive(outcome.instance_id.clone());
    let run_id = outcome.instance_id.clone();
    Ok(accepted(&run_id, outcome))
}

async fn campaign_status(
    State(state): State<ServiceState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<StatusView>>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let run_id = query.run_id.unwrap_or_default();
    let view = state
        .run_blocking("campaign_status", move |api| api.status(&run_id))
        .await?;
    Ok(Json(envelope(view)))
}

async fn campaign_regenerate(
    State(state): State<ServiceState>,
    request: Request,
) -> Result<(StatusCode, Json<ServiceEnvelope<AcceptedResponse>>), ServiceFailure> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    let payload = if is_form {
        Form::<RegeneratePayload>::from_request(request, &state)
            .await
            .map(|Form(payload)| payload)
            .map_err(|rejection| state.invalid_form_with_telemetry(&rejection))?
    } else {
        Json::<RegeneratePayload>::from_request(request, &state)
            .await
            .map(|Json(payload)| payload)
            .map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?
    };

    let run_id = payload.run_id.clone().unwrap_or_default();
    let outcome = state
        .run_blocking("campaign_regenerate", move |api| {
            api.regenerate(
                payload.run_id.as_deref(),
                payload.section.as_deref(),
                payload.tone(),
            )
        })
        .await?;
    state.spawn_drive(outcome.instance_id.clone());
    Ok(accepted(run_id.trim(), outcome))
}

async fn campaign_fetch(
    State(state): State<ServiceState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Response, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let run_id = query.run_id.unwrap_or_default();
    let bytes = state
        .run_blocking("campaign_fetch", move |api| api.fetch(&run_id, query.file.as_deref()))
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], bytes).into_response())
}

async fn campaign_download(
    State(state): State<ServiceState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Response, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let run_id = query.run_id.unwrap_or_default();
    let file_name = format!("campaign-{}.md", run_id.trim());
    let markdown = state
        .run_blocking("campaign_download", move |api| api.export(&run_id))
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        markdown,
    )
        .into_response())
}

async fn campaign_runs(
    State(state): State<ServiceState>,
    query: Result<Query<RunsQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<RunsResponse>>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let runs = state
        .run_blocking("campaign_runs", move |api| api.list_runs(query.limit))
        .await?;
    Ok(Json(envelope(RunsResponse { runs })))
}

async fn campaign_terminate(
    State(state): State<ServiceState>,
    payload: Result<Json<TerminatePayload>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<TerminateResponse>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let run_id = request.run_id.unwrap_or_default();
    let target = run_id.clone();
    let terminated = state
        .run_blocking("campaign_terminate", move |api| {
            api.terminate(&target, request.reason.as_deref())
        })
        .await?;
    Ok(Json(envelope(TerminateResponse { run_id, terminated })))
}
