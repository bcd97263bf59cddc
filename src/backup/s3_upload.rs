// pgphase/src/backup/s3_upload.rs
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{AppError, Result};
use crate::storage::{S3Fault, S3Store};
use crate::utils::retry::retry;

/// S3 caps a multipart upload at this many parts.
const MAX_PARTS: i32 = 10_000;
/// Capacity of the in-memory pipe between the producer and the uploader task.
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Write half of an upload in flight.
///
/// Bytes written here are consumed by a background task. Nothing becomes
/// visible in the store until [`UploadSink::finish`] commits; [`UploadSink::abort`]
/// or dropping the sink discards everything written so far.
pub struct UploadSink {
    writer: DuplexStream,
    commit: oneshot::Sender<bool>,
    task: JoinHandle<Result<u64>>,
}

impl UploadSink {
    /// Wires a pipe to `consumer`, which receives the read half and the commit decision.
    pub fn spawn<F, Fut>(pipe_capacity: usize, consumer: F) -> Self
    where
        F: FnOnce(DuplexStream, oneshot::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<u64>> + Send + 'static,
    {
        let (writer, reader) = tokio::io::duplex(pipe_capacity);
        let (commit, decision) = oneshot::channel();
        let task = tokio::spawn(consumer(reader, decision));
        UploadSink { writer, commit, task }
    }

    /// Signals end of stream, commits, and returns the number of bytes stored.
    pub async fn finish(self) -> Result<u64> {
        let UploadSink { mut writer, commit, task } = self;
        let shutdown = writer.shutdown().await;
        drop(writer);
        // The uploader may already be gone after a failed part; its own error is the one to report.
        let _ = commit.send(shutdown.is_ok());
        let stored = join_uploader(task).await?;
        shutdown?;
        Ok(stored)
    }

    /// Discards the upload. Returns the uploader's own failure, if it had one.
    pub async fn abort(self) -> Result<()> {
        let UploadSink { writer, commit, task } = self;
        drop(writer);
        let _ = commit.send(false);
        join_uploader(task).await.map(|_| ())
    }
}

async fn join_uploader(task: JoinHandle<Result<u64>>) -> Result<u64> {
    task.await
        .map_err(|e| AppError::Storage(format!("upload task did not complete: {}", e)))?
}

impl AsyncWrite for UploadSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Starts a streaming upload of `key` into `store`'s bucket.
pub(crate) fn start_upload(store: &S3Store, key: &str) -> UploadSink {
    let target = UploadTarget {
        client: store.client.clone(),
        bucket: store.bucket.clone(),
        key: key.to_string(),
        policy: store.policy,
        chunk_size: store.chunk_size,
    };
    UploadSink::spawn(PIPE_CAPACITY, move |reader, decision| target.run(reader, decision))
}

struct UploadTarget {
    client: s3::Client,
    bucket: String,
    key: String,
    policy: crate::utils::retry::RetryPolicy,
    chunk_size: usize,
}

impl UploadTarget {
    async fn run(self, mut reader: DuplexStream, decision: oneshot::Receiver<bool>) -> Result<u64> {
        let first = read_chunk(&mut reader, self.chunk_size).await?;

        if first.len() < self.chunk_size {
            // Whole archive fits in one part: a plain PutObject, issued only after commit.
            if !decision.await.unwrap_or(false) {
                tracing::warn!("Upload of {} discarded before commit", self.key);
                return Ok(0);
            }
            let size = first.len() as u64;
            self.put_single(first).await?;
            tracing::info!("✅ Uploaded s3://{}/{} ({} bytes)", self.bucket, self.key, size);
            return Ok(size);
        }

        let upload_id = self.create_multipart().await?;
        match self.upload_parts(&upload_id, first, &mut reader).await {
            Ok((parts, size)) => {
                if decision.await.unwrap_or(false) {
                    self.complete_multipart(&upload_id, parts).await?;
                    tracing::info!("✅ Uploaded s3://{}/{} ({} bytes)", self.bucket, self.key, size);
                    Ok(size)
                } else {
                    tracing::warn!("Upload of {} discarded before commit", self.key);
                    self.abort_multipart(&upload_id).await;
                    Ok(0)
                }
            }
            Err(e) => {
                self.abort_multipart(&upload_id).await;
                Err(e)
            }
        }
    }

    async fn put_single(&self, body: Bytes) -> Result<()> {
        retry(&self.policy, &format!("PUT {}", self.key), S3Fault::is_transient, || {
            let body = body.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(S3Fault::from_sdk)
            }
        })
        .await?;
        Ok(())
    }

    async fn create_multipart(&self) -> Result<String> {
        let created = retry(
            &self.policy,
            &format!("CreateMultipartUpload {}", self.key),
            S3Fault::is_transient,
            || async move {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .send()
                    .await
                    .map_err(S3Fault::from_sdk)
            },
        )
        .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| AppError::Storage(format!("no upload id returned for {}", self.key)))?
            .to_string();
        tracing::info!("Started multipart upload of s3://{}/{}", self.bucket, self.key);
        Ok(upload_id)
    }

    async fn upload_parts(
        &self,
        upload_id: &str,
        first: Bytes,
        reader: &mut DuplexStream,
    ) -> Result<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part_number = 1;
        let mut chunk = first;

        while !chunk.is_empty() {
            if part_number > MAX_PARTS {
                return Err(AppError::Storage(format!(
                    "archive for {} exceeds {} parts of {} bytes; raise the storage chunk size",
                    self.key, MAX_PARTS, self.chunk_size
                )));
            }
            let len = chunk.len() as u64;
            let body = chunk.clone();
            let uploaded = retry(
                &self.policy,
                &format!("UploadPart {} #{}", self.key, part_number),
                S3Fault::is_transient,
                || {
                    let body = body.clone();
                    async move {
                        self.client
                            .upload_part()
                            .bucket(&self.bucket)
                            .key(&self.key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(body))
                            .send()
                            .await
                            .map_err(S3Fault::from_sdk)
                    }
                },
            )
            .await?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(uploaded.e_tag().unwrap_or_default())
                    .build(),
            );
            total += len;
            tracing::debug!(
                "Uploaded part {} of {} ({} bytes, {} total)",
                part_number,
                self.key,
                len,
                total
            );

            part_number += 1;
            chunk = read_chunk(reader, self.chunk_size).await?;
        }
        Ok((parts, total))
    }

    async fn complete_multipart(&self, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()> {
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        retry(
            &self.policy,
            &format!("CompleteMultipartUpload {}", self.key),
            S3Fault::is_transient,
            || {
                let completed = completed.clone();
                async move {
                    self.client
                        .complete_multipart_upload()
                        .bucket(&self.bucket)
                        .key(&self.key)
                        .upload_id(upload_id)
                        .multipart_upload(completed)
                        .send()
                        .await
                        .map_err(S3Fault::from_sdk)
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str) {
        let aborted = retry(
            &self.policy,
            &format!("AbortMultipartUpload {}", self.key),
            S3Fault::is_transient,
            || async move {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(S3Fault::from_sdk)
            },
        )
        .await;
        match aborted {
            Ok(_) => tracing::info!("Aborted multipart upload of {}", self.key),
            Err(e) => tracing::error!(
                "❌ Could not abort multipart upload {} for {}; \
                 remove it with a bucket lifecycle rule: {}",
                upload_id,
                self.key,
                e
            ),
        }
    }
}

/// Reads up to `chunk_size` bytes; a short result means end of stream.
async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(chunk_size);
    reader.take(chunk_size as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn collecting_sink() -> UploadSink {
        UploadSink::spawn(16, |mut reader, decision| async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            let committed = decision.await.unwrap_or(false);
            Ok::<u64, AppError>(if committed { buf.len() as u64 } else { 0 })
        })
    }

    #[tokio::test]
    async fn test_finish_commits_everything_written() -> anyhow::Result<()> {
        let mut sink = collecting_sink();
        sink.write_all(b"PGDMP").await?;
        sink.write_all(&[0u8; 100]).await?;
        assert_eq!(sink.finish().await?, 105);
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_discards() -> anyhow::Result<()> {
        let mut sink = collecting_sink();
        sink.write_all(b"partial dump").await?;
        sink.abort().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_uploader_failure_surfaces_on_finish() {
        let mut sink = UploadSink::spawn(16, |_reader, _decision| async move {
            Err::<u64, AppError>(AppError::Storage("part 1 rejected".into()))
        });
        // The reader is gone, so writes may fail; the uploader error is what matters.
        let _ = sink.write_all(&[1u8; 64]).await;
        let err = sink.finish().await.unwrap_err();
        assert!(matches!(err, AppError::Storage(ref msg) if msg.contains("part 1 rejected")));
    }

    #[tokio::test]
    async fn test_read_chunk_splits_stream() -> anyhow::Result<()> {
        let data = vec![7u8; 25];
        let mut reader = std::io::Cursor::new(data);
        assert_eq!(read_chunk(&mut reader, 10).await?.len(), 10);
        assert_eq!(read_chunk(&mut reader, 10).await?.len(), 10);
        assert_eq!(read_chunk(&mut reader, 10).await?.len(), 5);
        assert!(read_chunk(&mut reader, 10).await?.is_empty());
        Ok(())
    }
}
