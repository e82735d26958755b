use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use loan_flow::{
    ApplicationStateSnapshot, Collaborators, FlowError, InMemorySessionStore, WorkflowEngine,
    in_memory::{CustomerDirectory, InMemoryOtpProvider, ReferenceDocumentIssuer},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{TurnRequest, TurnResponse},
};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// A [`FlowError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            FlowError::Validation { .. } => (StatusCode::BAD_REQUEST, self.0.to_string()),
            FlowError::OutOfOrderTurn { .. } => (StatusCode::CONFLICT, self.0.to_string()),
            FlowError::CollaboratorTimeout { .. } | FlowError::HandlerTimeout(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Sorry, one of our systems is slow to respond right now. Please try again in a moment."
                    .to_string(),
            ),
            FlowError::Collaborator { .. } => (
                StatusCode::BAD_GATEWAY,
                "Sorry, we could not reach one of our systems. Please try again shortly.".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong on our side.".to_string(),
            ),
        };
        let body = json!({
            "error": message,
            "details": self.0.to_string(),
            "retryable": self.0.is_recoverable(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

impl AppState {
    /// Wires the engine to in-process collaborators built from `config`.
    pub fn from_config(config: &ServiceConfig) -> loan_flow::Result<Self> {
        let directory = if config.customers.is_empty() {
            CustomerDirectory::demo()
        } else {
            CustomerDirectory::new(config.customers.clone())
        };
        let directory = Arc::new(directory);
        let otp_provider = match &config.fixed_otp {
            Some(code) => InMemoryOtpProvider::with_fixed_code(code.clone()),
            None => InMemoryOtpProvider::new(),
        };
        let collaborators = Collaborators {
            credit_bureau: directory.clone(),
            offer_catalog: directory,
            document_issuer: Arc::new(ReferenceDocumentIssuer::new()),
            otp_provider: Arc::new(otp_provider),
        };

        let engine = WorkflowEngine::standard(
            collaborators,
            config.engine.clone(),
            Arc::new(InMemorySessionStore::new()),
        )?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/turn", post(process_turn))
        .route("/session/{id}", get(get_session).delete(delete_session))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Tags every request with a correlation id, reusing the caller's when present.
async fn correlation_id_middleware(mut request: Request<axum::body::Body>, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert(CORRELATION_HEADER, value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Loan Origination Workflow Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /turn": "Process one customer turn",
            "GET /session/{id}": "Read-only snapshot of a session",
            "DELETE /session/{id}": "Discard a session",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "sessions": state.engine.store().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn process_turn(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        session_id = %session_id,
        turn_id = ?request.intent.turn_id,
        "Processing turn"
    );

    match state.engine.process_turn(&session_id, request.intent).await {
        Ok(outcome) => {
            info!(
                session_id = %session_id,
                stage = %outcome.stage,
                status = ?outcome.response.status,
                "Turn completed"
            );
            Ok(Json(TurnResponse {
                session_id,
                stage: outcome.stage,
                response: outcome.response,
            }))
        }
        Err(err) => {
            if err.is_recoverable() {
                warn!(session_id = %session_id, error = %err, "Turn failed, session unchanged");
            } else {
                error!(session_id = %session_id, error = %err, "Turn failed");
            }
            Err(err.into())
        }
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApplicationStateSnapshot>, Response> {
    match state.engine.get_state(&session_id).await {
        Ok(Some(snapshot)) => Ok(Json(snapshot)),
        Ok(None) => {
            info!(session_id = %session_id, "Session not found");
            Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Session not found", "session_id": session_id })),
            )
                .into_response())
        }
        Err(err) => {
            error!(session_id = %session_id, error = %err, "Failed to read session");
            Err(ApiError::from(err).into_response())
        }
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.discard_session(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        info!(session_id = %session_id, "Session not found");
        Ok(StatusCode::NOT_FOUND)
    }
}
