#![deny(unsafe_code)]

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use marketflow_core::storage::{BidRecord, JobRecord, TransactionRecord};
use marketflow_core::{
    AuthorizationGate, ClientQuote, EngineConfig, ExportFormat, Identity, IdentityResolver,
    MarketEngine, TokenDirectory, TransactionSource, TransitionReport, WorkflowError,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    /// JSON token directory; without one every request is unauthenticated.
    pub identities: Option<PathBuf>,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<MarketEngine>,
    pub gate: AuthorizationGate,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { engine, identities } = config;
        let directory = match identities {
            Some(path) => TokenDirectory::load(path)?,
            None => TokenDirectory::new(),
        };
        if directory.is_empty() {
            warn!("identity directory is empty; all requests will be rejected as unauthenticated");
        } else {
            info!(tokens = directory.len(), "identity directory loaded");
        }
        let engine = MarketEngine::bootstrap(engine).await?;
        Ok(Self::new(engine, Arc::new(directory)))
    }

    pub fn new(engine: MarketEngine, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            engine: Arc::new(engine),
            gate: AuthorizationGate::new(resolver),
        }
    }

    async fn caller(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        Ok(self.gate.resolve_caller(bearer_token(headers)).await?)
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(open_job))
        .route("/jobs/reconcile", post(reconcile_job))
        .route(
            "/bids",
            get(list_bids)
                .post(place_bid)
                .put(update_bid)
                .delete(withdraw_bid),
        )
        .route("/bids/accept", post(accept_bid))
        .route("/bids/reject", post(reject_bid))
        .route(
            "/transactions",
            get(list_transactions)
                .post(create_transaction)
                .delete(delete_transaction),
        )
        .route("/transactions/cancel", post(cancel_transaction))
        .route("/transactions/refund", post(refund_transaction))
        .route("/transactions/complete", post(complete_transaction))
        .route("/transactions/export", get(export_transactions))
        .with_state(state)
}

/// Token from `Authorization: Bearer <token>`; a bare value is accepted too.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value);
    Some(token.trim())
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

fn workflow_status(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::InvalidInput(_) | WorkflowError::ConflictingState(_) => {
            StatusCode::BAD_REQUEST
        }
        WorkflowError::StoreFailure(_) | WorkflowError::PartialFailure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => (
                status,
                Json(serde_json::json!({ "error": message, "kind": "invalid_input" })),
            )
                .into_response(),
            ApiError::Workflow(err) => {
                let status = workflow_status(&err);
                let mut body = serde_json::json!({
                    "error": err.to_string(),
                    "kind": err.kind().label(),
                });
                if let Some(report) = err.partial_report() {
                    warn!(
                        operation = %report.operation,
                        failed_step = %report.failed_step,
                        committed = report.committed_steps.len(),
                        "request ended in partial failure"
                    );
                    body["operation"] = serde_json::json!(report.operation);
                    body["failed_step"] = serde_json::json!(report.failed_step);
                    body["committed_steps"] = serde_json::json!(report.committed_steps);
                    body["snapshot"] = serde_json::json!(report.snapshot);
                }
                (status, Json(body)).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "marketflow-service",
        store_backend: state.engine.backend_label(),
    })
}

/// `{"success": true}` plus the step report of the operation, when there is one.
#[derive(Debug, Clone, Serialize)]
struct SuccessResponse {
    success: bool,
    #[serde(flatten)]
    report: Option<TransitionReport>,
}

impl SuccessResponse {
    fn bare() -> Json<Self> {
        Json(Self {
            success: true,
            report: None,
        })
    }

    fn with_report(report: TransitionReport) -> Json<Self> {
        Json(Self {
            success: true,
            report: Some(report),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenJobRequest {
    title: String,
}

async fn open_job(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<OpenJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let job = state.engine.workflow().open_job(&caller, &request.title).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
struct JobRef {
    job_id: String,
}

async fn reconcile_job(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<JobRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let report = state
        .engine
        .workflow()
        .reconcile_job(&caller, &request.job_id)
        .await?;
    Ok(SuccessResponse::with_report(report))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    job_id: Option<String>,
}

impl JobQuery {
    fn required(self) -> Result<String, ApiError> {
        self.job_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("job_id is required"))
    }
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Option<String>,
}

impl IdQuery {
    fn required(self) -> Result<String, ApiError> {
        self.id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("id is required"))
    }
}

async fn list_bids(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<BidRecord>>, ApiError> {
    let caller = state.caller(&headers).await?;
    let job_id = query.required()?;
    Ok(Json(state.engine.bids().list_bids(&caller, &job_id).await?))
}

#[derive(Debug, Deserialize)]
struct PlaceBidRequest {
    job_id: String,
    price: i64,
}

async fn place_bid(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<PlaceBidRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BidRecord>), ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let bid = state
        .engine
        .bids()
        .place_bid(&caller, &request.job_id, request.price)
        .await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

#[derive(Debug, Deserialize)]
struct UpdateBidRequest {
    id: String,
    price: i64,
}

async fn update_bid(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<UpdateBidRequest>, JsonRejection>,
) -> Result<Json<BidRecord>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let bid = state
        .engine
        .bids()
        .update_bid(&caller, &request.id, request.price)
        .await?;
    Ok(Json(bid))
}

async fn withdraw_bid(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let bid_id = query.required()?;
    state.engine.bids().withdraw_bid(&caller, &bid_id).await?;
    Ok(SuccessResponse::bare())
}

#[derive(Debug, Deserialize)]
struct BidRef {
    bid_id: String,
}

async fn accept_bid(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<BidRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let report = state
        .engine
        .workflow()
        .accept_bid(&caller, &request.bid_id)
        .await?;
    Ok(SuccessResponse::with_report(report))
}

async fn reject_bid(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<BidRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    state
        .engine
        .workflow()
        .reject_bid(&caller, &request.bid_id)
        .await?;
    Ok(SuccessResponse::bare())
}

async fn list_transactions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
    let caller = state.caller(&headers).await?;
    let job_id = query.required()?;
    let txs = state
        .engine
        .workflow()
        .list_transactions(&caller, &job_id)
        .await?;
    Ok(Json(txs))
}

/// Either `job_id` or `bid_id`. `amount` and `commission` are an optional
/// client quote and must be sent together.
#[derive(Debug, Deserialize)]
struct CreateTransactionRequest {
    job_id: Option<String>,
    bid_id: Option<String>,
    amount: Option<i64>,
    commission: Option<i64>,
}

impl CreateTransactionRequest {
    fn into_parts(self) -> Result<(TransactionSource, Option<ClientQuote>), ApiError> {
        let source = match (self.job_id, self.bid_id) {
            (Some(_), Some(_)) => {
                return Err(ApiError::bad_request("send either job_id or bid_id, not both"))
            }
            (Some(job_id), None) => TransactionSource::Job(job_id),
            (None, Some(bid_id)) => TransactionSource::Bid(bid_id),
            (None, None) => return Err(ApiError::bad_request("job_id or bid_id is required")),
        };
        let quote = match (self.amount, self.commission) {
            (Some(amount_minor), Some(commission_minor)) => Some(ClientQuote {
                amount_minor,
                commission_minor,
            }),
            (None, None) => None,
            _ => {
                return Err(ApiError::bad_request(
                    "amount and commission must be sent together",
                ))
            }
        };
        Ok((source, quote))
    }
}

async fn create_transaction(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SuccessResponse>), ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let (source, quote) = request.into_parts()?;
    let report = state
        .engine
        .workflow()
        .create_transaction(&caller, source, quote)
        .await?;
    Ok((StatusCode::CREATED, SuccessResponse::with_report(report)))
}

async fn delete_transaction(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let tx_id = query.required()?;
    state
        .engine
        .workflow()
        .delete_transaction(&caller, &tx_id)
        .await?;
    Ok(SuccessResponse::bare())
}

#[derive(Debug, Deserialize)]
struct TransactionRef {
    transaction_id: String,
}

async fn cancel_transaction(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<TransactionRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let report = state
        .engine
        .workflow()
        .cancel_transaction(&caller, &request.transaction_id)
        .await?;
    Ok(SuccessResponse::with_report(report))
}

async fn refund_transaction(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<TransactionRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let report = state
        .engine
        .workflow()
        .refund_transaction(&caller, &request.transaction_id)
        .await?;
    Ok(SuccessResponse::with_report(report))
}

async fn complete_transaction(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<TransactionRef>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let caller = state.caller(&headers).await?;
    let Json(request) = body?;
    let report = state
        .engine
        .workflow()
        .complete_transaction(&caller, &request.transaction_id)
        .await?;
    Ok(SuccessResponse::with_report(report))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export_transactions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let caller = state.caller(&headers).await?;
    let format: ExportFormat = query.format.as_deref().unwrap_or_default().parse()?;
    let document = state
        .engine
        .workflow()
        .export_transactions(&caller, format)
        .await?;
    let mut response = (
        [(header::CONTENT_TYPE, document.content_type())],
        document.body,
    )
        .into_response();
    if document.format == ExportFormat::Csv {
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_static("attachment; filename=\"transactions.csv\""),
        );
    }
    Ok(response)
}
