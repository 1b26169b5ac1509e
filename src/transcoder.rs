mod ffmpeg;

use tokio::task::JoinHandle;

use crate::{
  audio::AudioStream, pipeline::DownloadRequest, process::ToolProcess, Result,
};

pub use ffmpeg::Ffmpeg;

/// Output bitrate of every encoded file.
pub const BITRATE: &str = "192k";

/// ID3v2 minor version written into the output; v2.3 is what most players
/// read reliably.
pub const ID3V2_VERSION: &str = "3";

/// The encoded, tagged stream and everything that keeps it going.
pub struct Transcoding {
  pub output: AudioStream,
  pub process: ToolProcess,
  /// Copies the raw stream into the encoder. Resolves to the number of raw
  /// bytes fed once the raw stream ends.
  pub feeder: JoinHandle<Result<u64>>,
}

pub trait Transcoder: Send + Sync {
  fn transcode(
    &self,
    input: AudioStream,
    request: &DownloadRequest,
  ) -> Result<Transcoding>;
}

/// Maps the caller's fields onto ffmpeg metadata keys, skipping blank ones.
pub fn id3_fields(request: &DownloadRequest) -> Vec<(&'static str, &str)> {
  let fields = [
    ("title", Some(request.title.as_str())),
    ("artist", Some(request.artist.as_str())),
    ("album", request.album.as_deref()),
    ("album_artist", request.album_artist.as_deref()),
    ("genre", request.genre.as_deref()),
    // ffmpeg writes this as TYER for ID3v2.3
    ("date", request.year.as_deref()),
    ("track", request.track_number.as_deref()),
    ("composer", request.composer.as_deref()),
  ];

  fields
    .into_iter()
    .filter_map(|(key, value)| Some((key, value?)))
    .filter(|(_, value)| !value.trim().is_empty())
    .collect()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_id3_fields_skip_absent() {
    let request = DownloadRequest {
      album: Some("Album".into()),
      genre: Some("  ".into()),
      year: Some("2021".into()),
      ..DownloadRequest::new("https://youtube.com/watch?v=abc", "Song", "Artist")
    };

    assert_eq!(
      id3_fields(&request),
      [
        ("title", "Song"),
        ("artist", "Artist"),
        ("album", "Album"),
        ("date", "2021"),
      ]
    );
  }

  #[test]
  fn test_id3_fields_all() {
    let request = DownloadRequest {
      album: Some("Album".into()),
      album_artist: Some("Various Artists".into()),
      genre: Some("Electronic".into()),
      year: Some("1999".into()),
      track_number: Some("3/12".into()),
      composer: Some("Someone Else".into()),
      ..DownloadRequest::new("https://youtube.com/watch?v=abc", "Song", "Artist")
    };

    let keys: Vec<_> = id3_fields(&request).into_iter().map(|f| f.0).collect();
    assert_eq!(
      keys,
      [
        "title",
        "artist",
        "album",
        "album_artist",
        "genre",
        "date",
        "track",
        "composer"
      ]
    );
  }
}
