use std::{io, path::PathBuf, process::Stdio};

use futures::StreamExt;
use tokio::{io::AsyncWriteExt, process::ChildStdin, process::Command};
use tracing::debug;

use crate::{
  audio::{self, AudioStream},
  config::Config,
  pipeline::DownloadRequest,
  process::ToolProcess,
  Error, Result,
};

use super::{id3_fields, Transcoder, Transcoding, BITRATE, ID3V2_VERSION};

// re-encode any audio ffmpeg understands into a tagged mp3 stream.
// the binary location comes from the config, not from PATH lookups at
// call sites.
pub struct Ffmpeg {
  program: PathBuf,
}

impl Ffmpeg {
  pub fn new(config: &Config) -> Self {
    Self {
      program: config.ffmpeg_path.clone(),
    }
  }

  fn args(request: &DownloadRequest) -> Vec<String> {
    let mut args: Vec<String> = [
      "-hide_banner",
      "-loglevel",
      "error",
      "-i",
      "pipe:0",
      "-vn",
      // drop whatever tags the source carried
      "-map_metadata",
      "-1",
      "-codec:a",
      "libmp3lame",
      "-b:a",
      BITRATE,
      "-id3v2_version",
      ID3V2_VERSION,
    ]
    .into_iter()
    .map(String::from)
    .collect();

    for (key, value) in id3_fields(request) {
      args.push("-metadata".into());
      args.push(format!("{key}={value}"));
    }

    // keep ffmpeg from adding its own encoder tag
    args.extend(
      ["-fflags", "+bitexact", "-flags:a", "+bitexact", "-f", "mp3", "pipe:1"]
        .map(String::from),
    );
    args
  }
}

impl Transcoder for Ffmpeg {
  fn transcode(
    &self,
    input: AudioStream,
    request: &DownloadRequest,
  ) -> Result<Transcoding> {
    let mut cmd = Command::new(&self.program);
    cmd.args(Self::args(request)).stdin(Stdio::piped());

    let mut process = ToolProcess::spawn("ffmpeg", &mut cmd)
      .map_err(|e| Error::Transcode(format!("failed to start ffmpeg: {e}")))?;
    let stdin = process
      .take_stdin()
      .ok_or(Error::Transcode("ffmpeg stdin not captured".into()))?;
    let stdout = process
      .take_stdout()
      .ok_or(Error::Transcode("ffmpeg stdout not captured".into()))?;

    Ok(Transcoding {
      output: audio::reader_stream(stdout),
      process,
      feeder: tokio::spawn(feed(input, stdin)),
    })
  }
}

// Every write waits for ffmpeg to make room in its stdin pipe, so a slow
// encoder stalls the source instead of piling bytes up here.
async fn feed(mut input: AudioStream, mut stdin: ChildStdin) -> Result<u64> {
  let mut fed = 0u64;

  while let Some(chunk) = input.next().await {
    let chunk =
      chunk.map_err(|e| Error::Extraction(format!("reading source: {e}")))?;

    match stdin.write_all(&chunk).await {
      Ok(()) => fed += chunk.len() as u64,
      Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
        return Err(Error::Transcode("ffmpeg stopped reading its input".into()))
      }
      Err(e) => return Err(e.into()),
    }
  }

  // closing stdin is how ffmpeg learns the input is complete
  drop(stdin);
  debug!(bytes = fed, "source fully fed to encoder");

  if fed == 0 {
    return Err(Error::EmptySource);
  }
  Ok(fed)
}
