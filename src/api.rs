use rocket::http::Status;
use rocket::serde::json::{self, Json};
use rocket::{catch, get, options, post, Request, State};

use crate::app_state::AppState;
use crate::error::{AppError, GenerationError};
use crate::types::{
    EchoResponse,
    ErrorDetail,
    GenerationResult,
    GreetingResponse,
    HealthResponse,
    TextLengthResponse,
    TextRequest,
};

#[get("/")]
pub async fn root() -> Json<GreetingResponse> {
    Json(GreetingResponse {
        message: "Hello World".to_string(),
    })
}

#[get("/health")]
pub async fn health(state: &State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_status: state.model_status().to_string(),
        model_path: state.config.model_path.display().to_string(),
    })
}

fn require_text(text: Option<String>) -> Result<String, AppError> {
    text.ok_or_else(|| AppError::Validation("missing query parameter `text`".to_string()))
}

#[post("/send-text?<text>")]
pub async fn send_text(text: Option<String>) -> Result<Json<EchoResponse>, AppError> {
    let received_text = require_text(text)?;
    Ok(Json(EchoResponse { received_text }))
}

#[post("/send-text-len?<text>")]
pub async fn send_text_len(text: Option<String>) -> Result<Json<TextLengthResponse>, AppError> {
    let text = require_text(text)?;
    // 按字符计数，而不是字节
    Ok(Json(TextLengthResponse {
        text_length: text.chars().count(),
    }))
}

#[post("/send-model-response", data = "<req>")]
pub async fn send_model_response(
    state: &State<AppState>,
    req: Result<Json<TextRequest>, json::Error<'_>>,
) -> Result<Json<GenerationResult>, AppError> {
    let req = req.map_err(|e| AppError::Validation(e.to_string()))?;

    let engine = state.engine().await?;
    let _permit = state.generation_permit().await?;
    let params = &state.config.generation;
    tracing::debug!(
        model = engine.model_name(),
        prompt_chars = req.text.chars().count(),
        max_length = params.max_length,
        "generating"
    );

    let candidates = engine.generate(&req.text, params).await?;
    let response = candidates
        .into_iter()
        .next()
        .ok_or(GenerationError::NoCandidate)?;

    Ok(Json(GenerationResult { response }))
}

/// CORS preflight；响应头由 Cors fairing 填
#[options("/<_..>")]
pub async fn preflight() {}

#[catch(default)]
pub fn default_catcher(status: Status, _req: &Request<'_>) -> (Status, Json<ErrorDetail>) {
    (
        status,
        Json(ErrorDetail {
            detail: status.reason_lossy().to_string(),
        }),
    )
}
