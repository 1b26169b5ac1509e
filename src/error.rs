use std::time::Duration;

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{0}")]
  Validation(&'static str),
  #[error("{0}")]
  Extraction(String),
  #[error("{0}")]
  Transcode(String),
  #[error("source produced no audio data")]
  EmptySource,
  #[error("stream aborted: {0}")]
  Streaming(&'static str),
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  #[error("malformed extractor output: {0}")]
  Json(#[from] serde_json::Error),
  #[error("io error: {0}")]
  IO(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// An error on its way to the client, with the one-line summary of the
// endpoint that failed.
#[derive(Debug)]
pub struct ApiError {
  summary: &'static str,
  error: Error,
}

impl ApiError {
  pub fn new(summary: &'static str, error: Error) -> Self {
    Self { summary, error }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    match self.error {
      Error::Validation(msg) => {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
      }
      err => (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": self.summary, "details": err.to_string() })),
      )
        .into_response(),
    }
  }
}
