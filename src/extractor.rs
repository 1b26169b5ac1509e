mod ytdlp;

use async_trait::async_trait;
use serde::Serialize;

use crate::{audio::AudioStream, process::ToolProcess, Result};

pub use ytdlp::Ytdlp;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMetadata {
  pub title: String,
  #[serde(rename = "thumbnail", skip_serializing_if = "Option::is_none")]
  pub thumbnail_url: Option<String>,
  #[serde(rename = "author", skip_serializing_if = "Option::is_none")]
  pub uploader_name: Option<String>,
  #[serde(rename = "channel", skip_serializing_if = "Option::is_none")]
  pub channel_name: Option<String>,
}

/// The raw audio track of a source, still being produced by `process`.
pub struct Extraction {
  pub stream: AudioStream,
  pub process: ToolProcess,
}

#[async_trait]
pub trait Extractor: Send + Sync {
  /// Fetches the descriptive metadata of a source without downloading it.
  async fn probe(&self, url: &str) -> Result<MediaMetadata>;

  /// Starts streaming the best audio-only track of a source. Returns as soon
  /// as the tool is running; its exit status must still be checked once the
  /// stream ends.
  fn extract(&self, url: &str) -> Result<Extraction>;
}
