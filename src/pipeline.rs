use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
  audio::AudioStream,
  extractor::{Extraction, Extractor},
  process::{StageState, ToolProcess},
  transcoder::{Transcoder, Transcoding},
  Error, Result,
};

// how long a failed encoder waits for the pump and the source to settle; a
// dead source is the usual reason the encoder failed
const SOURCE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
  pub source_url: String,
  pub title: String,
  pub artist: String,
  pub album: Option<String>,
  pub album_artist: Option<String>,
  pub genre: Option<String>,
  pub year: Option<String>,
  pub track_number: Option<String>,
  pub composer: Option<String>,
}

impl DownloadRequest {
  pub fn new(
    source_url: impl Into<String>,
    title: impl Into<String>,
    artist: impl Into<String>,
  ) -> Self {
    Self {
      source_url: source_url.into(),
      title: title.into(),
      artist: artist.into(),
      album: None,
      album_artist: None,
      genre: None,
      year: None,
      track_number: None,
      composer: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  Extracting,
  Streaming,
  Completed,
  /// Failed before the first encoded byte reached the response.
  FailedPreFlight,
  /// Failed after the response body started.
  FailedMidStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
  pub state: PipelineState,
  pub bytes_sent: u64,
  pub source: StageState,
  pub encoder: StageState,
}

/// A started download. `output` yields encoded chunks and, if the download
/// fails, one final error. `report` resolves once both tools are gone.
pub struct PipelineRun {
  pub output: mpsc::Receiver<Result<Bytes>>,
  pub report: JoinHandle<PipelineReport>,
}

pub struct Pipeline {
  extractor: Arc<dyn Extractor>,
  transcoder: Arc<dyn Transcoder>,
  buffer_chunks: usize,
  max_duration: Option<Duration>,
  next_id: AtomicU64,
}

impl Pipeline {
  pub fn new(
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    buffer_chunks: usize,
    max_duration: Option<Duration>,
  ) -> Self {
    Self {
      extractor,
      transcoder,
      buffer_chunks: buffer_chunks.max(1),
      max_duration,
      next_id: AtomicU64::new(1),
    }
  }

  /// Spawns the extractor and the encoder and hands them to a supervisor
  /// task. Fails without side effects if either tool cannot be started.
  pub async fn start(&self, request: DownloadRequest) -> Result<PipelineRun> {
    if request.source_url.trim().is_empty() {
      return Err(Error::Validation("No URL provided"));
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let span = info_span!("download", id, url = %request.source_url);
    let (source, transcoding) =
      self.spawn_stages(&request).instrument(span.clone()).await?;

    let (tx, rx) = mpsc::channel(self.buffer_chunks);
    let handle = PipelineHandle {
      state: PipelineState::Streaming,
      source,
      encoder: transcoding.process,
      feeder: Some(transcoding.feeder),
      bytes_sent: 0,
    };
    let report = tokio::spawn(
      handle
        .run(transcoding.output, tx, self.max_duration)
        .instrument(span),
    );

    Ok(PipelineRun { output: rx, report })
  }

  async fn spawn_stages(
    &self,
    request: &DownloadRequest,
  ) -> Result<(ToolProcess, Transcoding)> {
    let mut state = PipelineState::Idle;

    transition(&mut state, PipelineState::Extracting);
    let Extraction {
      stream,
      process: mut source,
    } = self.extractor.extract(&request.source_url).map_err(|err| {
      transition(&mut state, PipelineState::FailedPreFlight);
      warn!(error = %err, "failed to start extraction");
      err
    })?;

    // the encoder only starts once the source is running
    match self.transcoder.transcode(stream, request) {
      Ok(transcoding) => {
        transition(&mut state, PipelineState::Streaming);
        info!(title = %request.title, artist = %request.artist, "streaming");
        Ok((source, transcoding))
      }
      Err(err) => {
        warn!(error = %err, "failed to start transcoding");
        source.terminate().await;
        transition(&mut state, PipelineState::FailedPreFlight);
        Err(err)
      }
    }
  }
}

fn transition(state: &mut PipelineState, next: PipelineState) {
  debug!(from = ?*state, to = ?next, "pipeline state");
  *state = next;
}

// Live state of one download, owned by its supervisor task.
struct PipelineHandle {
  state: PipelineState,
  source: ToolProcess,
  encoder: ToolProcess,
  feeder: Option<JoinHandle<Result<u64>>>,
  bytes_sent: u64,
}

impl PipelineHandle {
  async fn run(
    mut self,
    mut output: AudioStream,
    tx: mpsc::Sender<Result<Bytes>>,
    max_duration: Option<Duration>,
  ) -> PipelineReport {
    let result = match max_duration {
      Some(limit) => {
        tokio::time::timeout(limit, self.drive(&mut output, &tx))
          .await
          .unwrap_or(Err(Error::Timeout(limit)))
      }
      None => self.drive(&mut output, &tx).await,
    };

    match result {
      Ok(()) => {
        transition(&mut self.state, PipelineState::Completed);
        info!(bytes = self.bytes_sent, "download completed");
      }
      Err(err) => {
        self.shutdown().await;
        drop(output);

        let failed = if self.bytes_sent == 0 {
          PipelineState::FailedPreFlight
        } else {
          PipelineState::FailedMidStream
        };
        transition(&mut self.state, failed);

        match err {
          Error::Streaming(reason) => {
            info!(bytes = self.bytes_sent, "download abandoned: {reason}")
          }
          err => {
            warn!(bytes = self.bytes_sent, error = %err, "download failed");
            // before the first chunk this becomes an error reply, after it
            // the response is cut off
            let _ = tx.send(Err(err)).await;
          }
        }
      }
    }

    self.report()
  }

  async fn drive(
    &mut self,
    output: &mut AudioStream,
    tx: &mpsc::Sender<Result<Bytes>>,
  ) -> Result<()> {
    loop {
      let next = tokio::select! {
        next = output.next() => next,
        _ = tx.closed() => return Err(Error::Streaming("client disconnected")),
      };

      let Some(chunk) = next else { break };
      let chunk = chunk
        .map_err(|e| Error::Transcode(format!("reading ffmpeg output: {e}")))?;
      if chunk.is_empty() {
        continue;
      }

      let len = chunk.len() as u64;
      // waits while the client is behind
      tx.send(Ok(chunk))
        .await
        .map_err(|_| Error::Streaming("client disconnected"))?;
      if self.bytes_sent == 0 {
        debug!("first encoded bytes handed to the response");
      }
      self.bytes_sent += len;
    }

    self.finish().await
  }

  // The encoded stream ended. Decide whether that was a success: no stage
  // is trusted on its output alone.
  async fn finish(&mut self) -> Result<()> {
    if let Err(detail) = self.encoder.check_exit().await {
      let fed = self.settled_feeder().await;
      // ffmpeg quit while input was still coming; the source dying of a
      // broken pipe afterwards is a consequence, not the cause
      if let Some(Err(Error::Transcode(_))) = fed {
        return Err(Error::Transcode(detail));
      }
      if let Ok(Err(source_detail)) =
        tokio::time::timeout(SOURCE_GRACE, self.source.check_exit()).await
      {
        return Err(Error::Extraction(source_detail));
      }
      if let Some(Err(Error::EmptySource)) = fed {
        return Err(Error::EmptySource);
      }
      return Err(Error::Transcode(detail));
    }

    let fed = match self.feeder.take() {
      Some(feeder) => feeder.await.map_err(|e| {
        Error::Transcode(format!("input pump stopped unexpectedly: {e}"))
      })?,
      None => Ok(0),
    };
    self.source.check_exit().await.map_err(Error::Extraction)?;
    fed?;

    if self.bytes_sent == 0 {
      return Err(Error::Transcode("ffmpeg produced no output".into()));
    }
    Ok(())
  }

  // The pump's verdict, if it reaches one within the grace period. It
  // stops soon after the encoder is gone: the next write fails.
  async fn settled_feeder(&mut self) -> Option<Result<u64>> {
    let mut feeder = self.feeder.take()?;
    match tokio::time::timeout(SOURCE_GRACE, &mut feeder).await {
      Ok(joined) => joined.ok(),
      Err(_) => {
        self.feeder = Some(feeder);
        None
      }
    }
  }

  // Both tools are gone once this returns.
  async fn shutdown(&mut self) {
    if let Some(feeder) = self.feeder.take() {
      feeder.abort();
    }
    tokio::join!(self.source.terminate(), self.encoder.terminate());
  }

  fn report(&self) -> PipelineReport {
    PipelineReport {
      state: self.state,
      bytes_sent: self.bytes_sent,
      source: self.source.state(),
      encoder: self.encoder.state(),
    }
  }
}
