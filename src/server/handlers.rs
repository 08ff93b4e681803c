//! Axum handlers for the chat API.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::{
    engine::Completer,
    types::{ErrorBody, GenerateRequest, GenerateResponse, HealthResponse},
};

pub const GENERATE_PATH: &str = "/api/chat/generate";
pub const HEALTH_PATH: &str = "/api/chat/healthcheck";

pub const ERROR_BAD_REQUEST: &str = "Invalid request, 'prompt' missing";
pub const ERROR_INTERNAL: &str = "Internal server error";
pub const ERROR_NO_RESPONSE: &str = "No response from AI server.";

type SharedCompleter = Arc<dyn Completer>;

/// Build the chat API router around a completer
pub fn router(completer: SharedCompleter) -> Router {
    Router::new()
        .route(GENERATE_PATH, post(generate))
        .route(HEALTH_PATH, get(health_check))
        .with_state(completer)
}

/// Health check handler
async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    let health = HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    };
    (StatusCode::OK, Json(health))
}

/// Complete a prompt
async fn generate(
    State(completer): State<SharedCompleter>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let prompt = match payload {
        Ok(Json(GenerateRequest {
            prompt: Some(prompt),
        })) if !prompt.is_empty() => prompt,
        Ok(_) => return bad_request(),
        Err(rejection) => {
            tracing::debug!("rejected generate request: {rejection}");
            return bad_request();
        }
    };

    match completer.complete(&prompt).await {
        Ok(completion) if !completion.text.is_empty() => (
            StatusCode::OK,
            Json(GenerateResponse {
                response: completion.text,
            }),
        )
            .into_response(),
        Ok(_) => internal_error(ERROR_NO_RESPONSE.to_string()),
        Err(e) => {
            tracing::error!("Error: {e}");
            internal_error(e.to_string())
        }
    }
}

fn bad_request() -> Response {
    let body = ErrorBody {
        error: ERROR_BAD_REQUEST.to_string(),
        details: None,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn internal_error(details: String) -> Response {
    let body = ErrorBody {
        error: ERROR_INTERNAL.to_string(),
        details: Some(details),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
