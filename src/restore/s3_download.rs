// pgphase/src/restore/s3_download.rs
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{AppError, Result};
use crate::storage::{ArchiveSource, S3Fault, S3Store};
use crate::utils::retry::retry;

const PUMP_BUFFER: usize = 64 * 1024;

/// Establishes the GetObject stream for `key`. Only the request is retried;
/// once bytes flow, a failure is reported by [`pump`].
pub(crate) async fn open_download(store: &S3Store, key: &str) -> Result<ArchiveSource> {
    let request = format!("GET {}", key);
    let output = retry(&store.policy, &request, S3Fault::is_transient, || async move {
        store
            .client
            .get_object()
            .bucket(&store.bucket)
            .key(key)
            .send()
            .await
            .map_err(S3Fault::from_sdk)
    })
    .await?;

    tracing::debug!(
        "Streaming s3://{}/{} ({} bytes)",
        store.bucket,
        key,
        output.content_length().unwrap_or(-1)
    );
    Ok(Box::new(Box::pin(output.body.into_async_read())))
}

/// How a pumped stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The whole object reached the consumer.
    Completed { bytes: u64 },
    /// The consumer stopped reading after the prefix it needed.
    ConsumerClosed { bytes: u64 },
}

impl StreamOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            StreamOutcome::Completed { bytes } | StreamOutcome::ConsumerClosed { bytes } => *bytes,
        }
    }
}

/// Copies `source` into `consumer` until either side ends.
///
/// A read error is a failed transfer and is fatal. A write error of the
/// hang-up kind means the consumer closed its input early, which is not a
/// failure by itself; the consumer's exit status decides.
pub async fn pump<R, W>(source: &mut R, consumer: &mut W) -> Result<StreamOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await.map_err(|e| {
            AppError::Storage(format!("archive transfer failed after {} bytes: {}", total, e))
        })?;
        if n == 0 {
            return match consumer.shutdown().await {
                Ok(()) => Ok(StreamOutcome::Completed { bytes: total }),
                Err(e) if consumer_hung_up(&e) => {
                    Ok(StreamOutcome::ConsumerClosed { bytes: total })
                }
                Err(e) => Err(e.into()),
            };
        }
        match consumer.write_all(&buf[..n]).await {
            Ok(()) => total += n as u64,
            Err(e) if consumer_hung_up(&e) => {
                return Ok(StreamOutcome::ConsumerClosed { bytes: total });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn consumer_hung_up(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
}
