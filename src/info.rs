use axum::{
  extract::{Query, State},
  Json,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{error::ApiError, extractor::MediaMetadata, AppState, Error};

const INFO_FAILED: &str = "Failed to fetch video info";

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
  url: Option<String>,
}

pub async fn get_info(
  State(app): State<AppState>,
  Query(query): Query<InfoQuery>,
) -> Result<Json<MediaMetadata>, ApiError> {
  let fail = |err| ApiError::new(INFO_FAILED, err);

  let url = query
    .url
    .filter(|url| !url.trim().is_empty())
    .ok_or(Error::Validation("No URL provided"))
    .map_err(fail)?;

  info!(%url, "getting info");

  let probe = tokio::time::timeout(app.probe_timeout, app.extractor.probe(&url));
  match probe.await {
    Ok(Ok(metadata)) => Ok(Json(metadata)),
    Ok(Err(err)) => {
      warn!(%url, error = %err, "info failed");
      Err(fail(err))
    }
    Err(_) => {
      warn!(%url, "info timed out");
      Err(fail(Error::Timeout(app.probe_timeout)))
    }
  }
}
