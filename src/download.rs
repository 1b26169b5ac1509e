use axum::{
  extract::{Query, State},
  response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
  pipeline::{DownloadRequest, PipelineRun},
  response::{ResponseStreamer, DEFAULT_ARTIST, DEFAULT_NAME},
  AppState, Error, Result,
};

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
  url: Option<String>,
  name: Option<String>,
  artist: Option<String>,
  album: Option<String>,
  album_artist: Option<String>,
  genre: Option<String>,
  year: Option<String>,
  track: Option<String>,
  composer: Option<String>,
}

impl DownloadQuery {
  fn into_request(self) -> Result<DownloadRequest> {
    let source_url =
      non_blank(self.url).ok_or(Error::Validation("No URL provided"))?;

    Ok(DownloadRequest {
      source_url,
      title: non_blank(self.name).unwrap_or_else(|| DEFAULT_NAME.into()),
      artist: non_blank(self.artist).unwrap_or_else(|| DEFAULT_ARTIST.into()),
      album: non_blank(self.album),
      album_artist: non_blank(self.album_artist),
      genre: non_blank(self.genre),
      year: non_blank(self.year),
      track_number: non_blank(self.track),
      composer: non_blank(self.composer),
    })
  }
}

// the form sends every field, empty ones included
fn non_blank(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}

pub async fn get_download(
  State(app): State<AppState>,
  Query(query): Query<DownloadQuery>,
) -> Response {
  let streamer = ResponseStreamer::new(
    query.name.as_deref().unwrap_or_default(),
    query.artist.as_deref().unwrap_or_default(),
  );

  let request = match query.into_request() {
    Ok(request) => request,
    Err(err) => return streamer.reject(err).into_response(),
  };

  info!(url = %request.source_url, filename = streamer.filename(), "downloading");

  match app.pipeline.start(request).await {
    Ok(PipelineRun { output, report }) => {
      tokio::spawn(async move {
        if let Ok(report) = report.await {
          debug!(
            state = ?report.state,
            bytes = report.bytes_sent,
            source = ?report.source,
            encoder = ?report.encoder,
            "download settled"
          );
        }
      });
      streamer.stream(output).await
    }
    Err(err) => streamer.reject(err).into_response(),
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::sync::atomic::Ordering;

  use http::{header, StatusCode};
  use serde_json::{json, Value};

  use super::*;
  use crate::test_util::{counting_app, read_body, tool_script};

  fn query(url: &str) -> DownloadQuery {
    DownloadQuery {
      url: Some(url.into()),
      name: Some("My Song!!".into()),
      artist: Some("DJ/Test".into()),
      ..DownloadQuery::default()
    }
  }

  #[test]
  fn test_into_request() {
    let request = DownloadQuery {
      url: Some("https://youtube.com/watch?v=abc".into()),
      album: Some("".into()),
      year: Some("2020".into()),
      track: Some("4".into()),
      ..DownloadQuery::default()
    }
    .into_request()
    .unwrap();

    assert_eq!(request.title, "audio");
    assert_eq!(request.artist, "Unknown");
    assert_eq!(request.album, None);
    assert_eq!(request.year.as_deref(), Some("2020"));
    assert_eq!(request.track_number.as_deref(), Some("4"));

    assert!(matches!(
      DownloadQuery::default().into_request(),
      Err(Error::Validation(_))
    ));
  }

  #[tokio::test]
  async fn test_download() {
    let dir = tempfile::tempdir().unwrap();
    let (app, spawns) = counting_app(
      tool_script(&dir, "yt-dlp", "printf 'raw audio'"),
      // prints the tags it was asked to write, then the audio
      tool_script(
        &dir,
        "ffmpeg",
        r#"for arg in "$@"; do case "$arg" in *=*) echo "$arg";; esac; done; cat"#,
      ),
    );

    let resp =
      get_download(State(app), Query(query("https://youtube.com/watch?v=abc")))
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
      resp.headers()[header::CONTENT_DISPOSITION],
      "attachment; filename=\"My Song - DJTest.mp3\""
    );

    let body = read_body(resp).await.unwrap();
    assert_eq!(
      String::from_utf8(body).unwrap(),
      "title=My Song!!\nartist=DJ/Test\nraw audio"
    );
    assert_eq!(spawns.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_download_without_url() {
    let dir = tempfile::tempdir().unwrap();
    let (app, spawns) = counting_app(
      tool_script(&dir, "yt-dlp", "exec yes"),
      tool_script(&dir, "ffmpeg", "exec cat"),
    );

    for url in [None, Some(String::new())] {
      let query = DownloadQuery {
        url,
        ..query("")
      };
      let resp = get_download(State(app.clone()), Query(query)).await;
      assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

      let body: Value = serde_json::from_slice(&read_body(resp).await.unwrap())
        .unwrap();
      assert_eq!(body, json!({ "error": "No URL provided" }));
    }
    assert_eq!(spawns.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_download_failure_before_first_byte() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = counting_app(
      tool_script(
        &dir,
        "yt-dlp",
        "echo 'ERROR: [youtube] abc: Video unavailable' >&2; exit 1",
      ),
      tool_script(&dir, "ffmpeg", "exec cat"),
    );

    let resp =
      get_download(State(app), Query(query("https://youtube.com/watch?v=abc")))
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(resp.headers().get(header::CONTENT_DISPOSITION).is_none());

    let body: Value =
      serde_json::from_slice(&read_body(resp).await.unwrap()).unwrap();
    assert_eq!(body["error"], "Failed to download audio");
    assert!(body["details"]
      .as_str()
      .unwrap()
      .contains("Video unavailable"));
  }

  #[tokio::test]
  async fn test_download_missing_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = counting_app(
      tool_script(&dir, "yt-dlp", "exec yes"),
      "/nonexistent/ffmpeg".into(),
    );

    let resp =
      get_download(State(app), Query(query("https://youtube.com/watch?v=abc")))
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[tokio::test]
  async fn test_download_failure_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = counting_app(
      tool_script(
        &dir,
        "yt-dlp",
        "printf 'partial audio'
         echo 'ERROR: unable to download video data' >&2
         exit 1",
      ),
      tool_script(&dir, "ffmpeg", "exec cat"),
    );

    let resp =
      get_download(State(app), Query(query("https://youtube.com/watch?v=abc")))
        .await;
    // headers went out with the first chunk
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(read_body(resp).await.is_err());
  }
}
