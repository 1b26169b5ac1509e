use std::{
  path::PathBuf,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use async_trait::async_trait;
use axum::{body::HttpBody, response::Response};
use futures::StreamExt;

use crate::{
  audio::AudioStream,
  config::Config,
  extractor::{Extraction, Extractor, MediaMetadata, Ytdlp},
  pipeline::{DownloadRequest, Pipeline},
  transcoder::{Ffmpeg, Transcoder, Transcoding},
  AppState, Result,
};

/// Writes an executable shell script standing in for an external tool.
#[cfg(unix)]
pub fn tool_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.path().join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
    .unwrap();
  path
}

pub fn config_with_tools(ytdlp: PathBuf, ffmpeg: PathBuf) -> Config {
  Config {
    ytdlp_path: ytdlp,
    ffmpeg_path: ffmpeg,
    ..Config::default()
  }
}

pub fn pipeline_with_tools(ytdlp: PathBuf, ffmpeg: PathBuf) -> Pipeline {
  let config = config_with_tools(ytdlp, ffmpeg);
  Pipeline::new(
    Arc::new(Ytdlp::new(&config)),
    Arc::new(Ffmpeg::new(&config)),
    config.buffer_chunks,
    config.download_timeout,
  )
}

/// App state whose tools count every process they start.
pub fn counting_app(
  ytdlp: PathBuf,
  ffmpeg: PathBuf,
) -> (AppState, Arc<AtomicUsize>) {
  let config = config_with_tools(ytdlp, ffmpeg);
  let spawns = Arc::new(AtomicUsize::new(0));
  let extractor = Counting {
    inner: Ytdlp::new(&config),
    spawns: spawns.clone(),
  };
  let transcoder = Counting {
    inner: Ffmpeg::new(&config),
    spawns: spawns.clone(),
  };

  let app = AppState::with_tools(Arc::new(extractor), Arc::new(transcoder), &config);
  (app, spawns)
}

struct Counting<T> {
  inner: T,
  spawns: Arc<AtomicUsize>,
}

#[async_trait]
impl<T: Extractor> Extractor for Counting<T> {
  async fn probe(&self, url: &str) -> Result<MediaMetadata> {
    self.spawns.fetch_add(1, Ordering::SeqCst);
    self.inner.probe(url).await
  }

  fn extract(&self, url: &str) -> Result<Extraction> {
    self.spawns.fetch_add(1, Ordering::SeqCst);
    self.inner.extract(url)
  }
}

impl<T: Transcoder> Transcoder for Counting<T> {
  fn transcode(
    &self,
    input: AudioStream,
    request: &DownloadRequest,
  ) -> Result<Transcoding> {
    self.spawns.fetch_add(1, Ordering::SeqCst);
    self.inner.transcode(input, request)
  }
}

pub async fn collect_stream(mut stream: AudioStream) -> Result<Vec<u8>> {
  let mut bytes = Vec::new();
  while let Some(chunk) = stream.next().await {
    bytes.extend_from_slice(&chunk?);
  }
  Ok(bytes)
}

pub async fn read_body(resp: Response) -> Result<Vec<u8>, axum::Error> {
  let mut body = resp.into_body();
  let mut bytes = Vec::new();
  while let Some(chunk) = body.data().await {
    bytes.extend_from_slice(&chunk?);
  }
  Ok(bytes)
}
