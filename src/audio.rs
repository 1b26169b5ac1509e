use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::Result;

/// Upper bound for a single chunk read from a tool's stdout.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Live, non-restartable audio bytes with exactly one consumer.
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

pub fn reader_stream<R>(reader: R) -> AudioStream
where
  R: AsyncRead + Send + 'static,
{
  ReaderStream::with_capacity(reader, CHUNK_SIZE)
    .map(|res| res.map_err(|e| e.into()))
    .boxed()
}
