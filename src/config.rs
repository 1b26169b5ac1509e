use std::{
  net::SocketAddr,
  path::PathBuf,
  str::FromStr,
  time::Duration,
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct Config {
  pub listen_addr: SocketAddr,
  pub ytdlp_path: PathBuf,
  pub ytdlp_proxy: Option<String>,
  pub ffmpeg_path: PathBuf,
  /// Number of encoded chunks buffered between ffmpeg and the HTTP body.
  pub buffer_chunks: usize,
  pub probe_timeout: Duration,
  /// Upper bound for a whole download. `None` lets a download run as long
  /// as both tools keep going.
  pub download_timeout: Option<Duration>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
      ytdlp_path: PathBuf::from("yt-dlp"),
      ytdlp_proxy: None,
      ffmpeg_path: PathBuf::from("ffmpeg"),
      buffer_chunks: 8,
      probe_timeout: Duration::from_secs(60),
      download_timeout: None,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let mut config = Config::default();
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(addr) = var("LISTEN_ADDR") {
      config.listen_addr = parse("LISTEN_ADDR", &addr)?;
    }
    if let Some(path) = var("YTDLP_PATH") {
      config.ytdlp_path = PathBuf::from(path);
    }
    config.ytdlp_proxy = var("YTDLP_PROXY");
    if let Some(path) = var("FFMPEG_PATH") {
      config.ffmpeg_path = PathBuf::from(path);
    }
    if let Some(chunks) = var("PIPELINE_BUFFER_CHUNKS") {
      config.buffer_chunks = parse::<usize>("PIPELINE_BUFFER_CHUNKS", &chunks)?;
      anyhow::ensure!(
        config.buffer_chunks > 0,
        "PIPELINE_BUFFER_CHUNKS must be at least 1"
      );
    }
    if let Some(secs) = var("PROBE_TIMEOUT_SECS") {
      config.probe_timeout =
        Duration::from_secs(parse("PROBE_TIMEOUT_SECS", &secs)?);
    }
    if let Some(secs) = var("DOWNLOAD_TIMEOUT_SECS") {
      config.download_timeout =
        Some(Duration::from_secs(parse("DOWNLOAD_TIMEOUT_SECS", &secs)?));
    }

    Ok(config)
  }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  value
    .trim()
    .parse()
    .with_context(|| format!("invalid value for {key}: {value:?}"))
}

// used to remove cred info from proxy url before printing
static AUTH_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"//[^:/@]+(:[^@]+)?@").unwrap());

pub fn redact_proxy(proxy: &str) -> String {
  AUTH_REGEX.replace(proxy, "//<REDACTED>@").into_owned()
}
