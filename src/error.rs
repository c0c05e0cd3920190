use std::path::PathBuf;

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use thiserror::Error;

use crate::types::ErrorDetail;

/// 模型或 tokenizer 加载失败
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model artifact `{}` not found", .0.display())]
    MissingArtifact(PathBuf),

    #[error("invalid model config `{}`: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),

    #[error("failed to load model weights: {0}")]
    Weights(#[from] candle_core::Error),

    #[error("failed to fetch `{repo}` from the hub: {source}")]
    Hub {
        repo: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },

    #[error("max_length {max_length} exceeds the model window of {window} positions")]
    MaxLengthExceedsWindow { max_length: usize, window: usize },

    #[error("model loader task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 推理阶段的失败
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("failed to decode generated tokens: {0}")]
    Decode(String),

    #[error("prompt has {tokens} tokens but the model window is {window}")]
    PromptTooLong { tokens: usize, window: usize },

    #[error("tensor op failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("generation returned no candidate sequence")]
    NoCandidate,

    #[error("generation task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl AppError {
    pub fn status(&self) -> Status {
        match self {
            AppError::Validation(_) => Status::UnprocessableEntity,
            AppError::Load(_) | AppError::Generation(_) => Status::InternalServerError,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for AppError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        // 5xx 只记日志，不把内部细节返回给调用方
        let detail = if status.class().is_server_error() {
            tracing::error!(uri = %req.uri(), error = %self, "request failed");
            Status::InternalServerError.reason_lossy().to_string()
        } else {
            tracing::debug!(uri = %req.uri(), error = %self, "rejected request");
            self.to_string()
        };

        (status, Json(ErrorDetail { detail })).respond_to(req)
    }
}
