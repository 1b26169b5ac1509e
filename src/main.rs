use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{response::IntoResponse, routing::get, Router};
use http::{header, Method};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod audio;
mod config;
mod download;
mod error;
mod extractor;
mod info;
mod pipeline;
mod process;
mod response;
mod transcoder;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};

use config::Config;
use extractor::{Extractor, Ytdlp};
use pipeline::Pipeline;
use transcoder::{Ffmpeg, Transcoder};

#[derive(Clone)]
pub struct AppState {
  pub extractor: Arc<dyn Extractor>,
  pub pipeline: Arc<Pipeline>,
  pub probe_timeout: Duration,
}

impl AppState {
  pub fn new(config: &Config) -> Self {
    Self::with_tools(
      Arc::new(Ytdlp::new(config)),
      Arc::new(Ffmpeg::new(config)),
      config,
    )
  }

  pub fn with_tools(
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    config: &Config,
  ) -> Self {
    let pipeline = Pipeline::new(
      extractor.clone(),
      transcoder,
      config.buffer_chunks,
      config.download_timeout,
    );

    Self {
      extractor,
      pipeline: Arc::new(pipeline),
      probe_timeout: config.probe_timeout,
    }
  }
}

pub fn router(state: AppState) -> Router {
  // browsers only let scripts read the suggested file name when it is
  // exposed explicitly
  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods([Method::GET])
    .expose_headers([header::CONTENT_DISPOSITION]);

  Router::new()
    .route("/health", get(health))
    .route("/info", get(info::get_info))
    .route("/download", get(download::get_download))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env()?;
  let addr = config.listen_addr;
  let app = router(AppState::new(&config));

  Toplevel::new(move |s| async move {
    s.start(SubsystemBuilder::new("http", move |subsys| {
      serve(addr, app, subsys)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(Duration::from_secs(5))
  .await
  .map_err(|e| anyhow!("{e}"))
}

async fn serve(
  addr: SocketAddr,
  app: Router,
  subsys: SubsystemHandle,
) -> anyhow::Result<()> {
  info!("Listening on {addr}");

  axum::Server::bind(&addr)
    .serve(app.into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await?;

  Ok(())
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}
