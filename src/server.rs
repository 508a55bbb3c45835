use crate::{
    error::ChartQaError,
    messages::{AnalyzeRequest, AnalyzeResponse},
    service::ChartQaService,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{Method, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Builds the HTTP surface of the service.
///
/// `max_request_bytes` bounds the JSON body, which carries the base64 image.
pub fn router(service: Arc<ChartQaService>, max_request_bytes: usize) -> Router {
    let state = AppState {
        service,
        max_request_bytes,
    };
    Router::new()
        .route("/", get(|| async { "Chart QA backend is running" }))
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/analyze", post(post_analyze))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(cors_layer())
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    service: Arc<ChartQaService>,
    max_request_bytes: usize,
}

// the browser extension calls from arbitrary origins
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.health())
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.status())
}

async fn post_analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            log::warn!("Rejected analyze body over {} bytes", state.max_request_bytes);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(AnalyzeResponse::failure(format!(
                    "Request body exceeds {} bytes",
                    state.max_request_bytes
                ))),
            );
        }
        Err(rejection) => {
            log::debug!("Rejected analyze body: {rejection}");
            return (
                StatusCode::BAD_REQUEST,
                Json(AnalyzeResponse::failure("No data provided")),
            );
        }
    };

    match state.service.analyze(request).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (status_code(&err), Json(AnalyzeResponse::failure(err.to_string()))),
    }
}

/// Client-caused failures are 400, everything else is 500.
pub fn status_code(err: &ChartQaError) -> StatusCode {
    if err.kind().is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
