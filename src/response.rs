use std::{
  pin::Pin,
  task::{Context, Poll},
};

use axum::{
  body::StreamBody,
  response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use http::{header, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{error::ApiError, Error, Result};

pub const DEFAULT_NAME: &str = "audio";
pub const DEFAULT_ARTIST: &str = "Unknown";

const DOWNLOAD_FAILED: &str = "Failed to download audio";

static FILENAME_REJECT_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new("[^A-Za-z0-9 _-]+").unwrap());

/// Keeps only characters that are safe both in a quoted header value and
/// in a file name.
pub fn sanitize(s: &str) -> String {
  FILENAME_REJECT_REGEX.replace_all(s, "").into_owned()
}

pub fn filename(name: &str, artist: &str) -> String {
  let or_default = |s: String, default: &str| {
    if s.trim().is_empty() {
      default.to_string()
    } else {
      s
    }
  };
  let name = or_default(sanitize(name), DEFAULT_NAME);
  let artist = or_default(sanitize(artist), DEFAULT_ARTIST);
  format!("{name} - {artist}.mp3")
}

/// What is left to do with a failed download.
pub enum Rejection {
  /// The headers are still open: a complete JSON error reply.
  Reply(Response),
  /// The headers are out: the body has to end with this error.
  Abort(Error),
}

impl IntoResponse for Rejection {
  fn into_response(self) -> Response {
    match self {
      Rejection::Reply(resp) => resp,
      // a body that fails on its first poll
      Rejection::Abort(err) => {
        let body = futures::stream::once(async move { Err::<Bytes, _>(err) });
        StreamBody::new(body).into_response()
      }
    }
  }
}

/// Turns the output of a pipeline into an HTTP response.
///
/// Until the first encoded chunk arrives any failure can still be answered
/// with a JSON error. The first chunk freezes the headers; from then on the
/// only way to signal a failure is to cut the body short, which makes the
/// server drop the connection.
pub struct ResponseStreamer {
  filename: String,
  headers_frozen: bool,
}

impl ResponseStreamer {
  pub fn new(name: &str, artist: &str) -> Self {
    Self {
      filename: filename(name, artist),
      headers_frozen: false,
    }
  }

  pub fn filename(&self) -> &str {
    &self.filename
  }

  pub async fn stream(
    mut self,
    mut output: mpsc::Receiver<Result<Bytes>>,
  ) -> Response {
    match output.recv().await {
      Some(Ok(first)) => self.commit(first, output),
      Some(Err(err)) => self.reject(err).into_response(),
      None => self
        .reject(Error::Transcode("pipeline ended without output".into()))
        .into_response(),
    }
  }

  /// Answers with a JSON error while that is still possible. Once the
  /// headers are frozen the response can only be cut off.
  pub fn reject(&self, err: Error) -> Rejection {
    if self.headers_frozen {
      warn!(
        filename = %self.filename,
        error = %err,
        "error after headers were sent"
      );
      return Rejection::Abort(err);
    }
    Rejection::Reply(ApiError::new(DOWNLOAD_FAILED, err).into_response())
  }

  fn commit(
    mut self,
    first: Bytes,
    rest: mpsc::Receiver<Result<Bytes>>,
  ) -> Response {
    self.headers_frozen = true;
    debug!(filename = %self.filename, "headers frozen");

    let disposition = format!("attachment; filename=\"{}\"", self.filename);
    let disposition = HeaderValue::from_str(&disposition)
      .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    let body = CommittedBody {
      streamer: self,
      first: Some(first),
      rest,
      written: 0,
    };

    (
      [
        (header::CONTENT_TYPE, HeaderValue::from_static("audio/mpeg")),
        (header::CONTENT_DISPOSITION, disposition),
      ],
      StreamBody::new(body),
    )
      .into_response()
  }
}

// The body of a committed response. It owns the streamer, so every failure
// after the commit still goes through `reject`.
struct CommittedBody {
  streamer: ResponseStreamer,
  first: Option<Bytes>,
  rest: mpsc::Receiver<Result<Bytes>>,
  written: u64,
}

impl Stream for CommittedBody {
  type Item = Result<Bytes>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    if let Some(first) = this.first.take() {
      this.written += first.len() as u64;
      return Poll::Ready(Some(Ok(first)));
    }

    match this.rest.poll_recv(cx) {
      Poll::Ready(Some(Ok(bytes))) => {
        this.written += bytes.len() as u64;
        Poll::Ready(Some(Ok(bytes)))
      }
      Poll::Ready(Some(Err(err))) => {
        debug!(written = this.written, "aborting response mid-stream");
        match this.streamer.reject(err) {
          Rejection::Abort(err) => Poll::Ready(Some(Err(err))),
          // never built with open headers; end the body all the same
          Rejection::Reply(_) => Poll::Ready(Some(Err(Error::Streaming(
            "error reply after the body started",
          )))),
        }
      }
      Poll::Ready(None) => Poll::Ready(None),
      Poll::Pending => Poll::Pending,
    }
  }
}
