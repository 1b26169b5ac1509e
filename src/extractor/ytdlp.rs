use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use crate::{
  audio,
  config::{redact_proxy, Config},
  process::ToolProcess,
  Error, Result,
};

use super::{Extraction, Extractor, MediaMetadata};

// run yt-dlp command line to probe sources and stream their audio.
pub struct Ytdlp {
  program: PathBuf,
  proxy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtdlpInfo {
  title: String,
  thumbnail: Option<String>,
  uploader: Option<String>,
  channel: Option<String>,
}

impl From<YtdlpInfo> for MediaMetadata {
  fn from(info: YtdlpInfo) -> Self {
    Self {
      title: info.title,
      thumbnail_url: info.thumbnail,
      uploader_name: info.uploader,
      channel_name: info.channel,
    }
  }
}

impl Ytdlp {
  pub fn new(config: &Config) -> Self {
    if let Some(proxy) = &config.ytdlp_proxy {
      info!("yt-dlp using proxy: {}", redact_proxy(proxy));
    }

    Self {
      program: config.ytdlp_path.clone(),
      proxy: config.ytdlp_proxy.clone(),
    }
  }

  fn command(&self) -> Command {
    let mut cmd = Command::new(&self.program);
    cmd.stdin(Stdio::null()).arg("--no-playlist");
    if let Some(proxy) = &self.proxy {
      cmd.arg("--proxy").arg(proxy);
    }
    cmd
  }

  fn probe_command(&self, url: &str) -> Command {
    let mut cmd = self.command();
    cmd
      // emit the output as a single json object instead of jsonl
      .arg("--dump-single-json")
      .arg("--skip-download")
      .arg("--no-warnings")
      // the url is never an option, even when it starts with '-'
      .arg("--")
      .arg(url);
    cmd
  }

  fn stream_command(&self, url: &str) -> Command {
    let mut cmd = self.command();
    cmd
      .arg("--format")
      .arg("bestaudio")
      .arg("--no-progress")
      .arg("--output")
      .arg("-")
      .arg("--")
      .arg(url);
    cmd
  }
}

#[async_trait]
impl Extractor for Ytdlp {
  async fn probe(&self, url: &str) -> Result<MediaMetadata> {
    let output = self
      .probe_command(url)
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| Error::Extraction(format!("failed to start yt-dlp: {e}")))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      let reason = stderr
        .lines()
        .rev()
        .find(|line| line.contains("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("no error output");
      return Err(Error::Extraction(format!(
        "yt-dlp exited with {}: {}",
        output.status,
        reason.trim()
      )));
    }

    parse_info(&output.stdout)
  }

  fn extract(&self, url: &str) -> Result<Extraction> {
    let mut process = ToolProcess::spawn("yt-dlp", &mut self.stream_command(url))
      .map_err(|e| Error::Extraction(format!("failed to start yt-dlp: {e}")))?;
    let stdout = process
      .take_stdout()
      .ok_or(Error::Extraction("yt-dlp stdout not captured".into()))?;

    Ok(Extraction {
      stream: audio::reader_stream(stdout),
      process,
    })
  }
}

fn parse_info(stdout: &[u8]) -> Result<MediaMetadata> {
  let info: YtdlpInfo = serde_json::from_slice(stdout)?;
  Ok(info.into())
}
