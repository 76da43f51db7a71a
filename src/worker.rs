// Segment worker pool: bounded concurrent fetch -> decrypt -> validate ->
// persist, with per-segment retry and fail-hard draining.

use crate::client;
use crate::decryption::{self, KeyCache};
use crate::error::{DecryptErrorKind, EngineError};
use crate::playlist::{SegmentDescriptor, SegmentIv};
use crate::progress::ProgressTracker;
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::store::SegmentStore;
use crate::validate;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Raw segment bytes, straight off the wire.
#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    async fn fetch(&self, segment: &SegmentDescriptor) -> Result<Bytes, EngineError>;
}

/// Raw bytes to muxable bytes (decryption, or pass-through for clear streams).
#[async_trait]
pub trait SegmentTransformer: Send + Sync {
    async fn transform(
        &self,
        raw: Bytes,
        segment: &SegmentDescriptor,
    ) -> Result<Bytes, EngineError>;
}

pub struct HttpSegmentDownloader {
    client: Client,
    headers: HeaderMap,
}

impl HttpSegmentDownloader {
    pub fn new(client: Client, headers: HeaderMap) -> Self {
        Self { client, headers }
    }
}

#[async_trait]
impl SegmentDownloader for HttpSegmentDownloader {
    async fn fetch(&self, segment: &SegmentDescriptor) -> Result<Bytes, EngineError> {
        client::get_bytes(&self.client, segment.url.as_str(), &self.headers).await
    }
}

pub struct DecryptingTransformer {
    keys: KeyCache,
}

impl DecryptingTransformer {
    pub fn new(keys: KeyCache) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl SegmentTransformer for DecryptingTransformer {
    async fn transform(
        &self,
        raw: Bytes,
        segment: &SegmentDescriptor,
    ) -> Result<Bytes, EngineError> {
        let Some(encryption) = &segment.encryption else {
            return Ok(raw);
        };
        let key = self.keys.key_for(&encryption.key_uri).await?;
        let iv = match &encryption.iv {
            SegmentIv::Explicit(iv) => *iv,
            SegmentIv::Sequence(msn) => decryption::derive_iv(*msn),
        };
        decryption::decrypt_aes128_cbc(raw, &key, &iv)
    }
}

/// Everything a worker needs besides the segment itself.
pub(crate) struct WorkerContext {
    pub downloader: Arc<dyn SegmentDownloader>,
    pub transformer: Arc<dyn SegmentTransformer>,
    pub store: Arc<SegmentStore>,
    pub tracker: Arc<ProgressTracker>,
    pub retry: RetryPolicy,
}

/// Download every pending segment with at most
/// `min(concurrency, pending.len())` in flight.
///
/// Segments are pulled in ascending index order (stable FIFO); completions
/// land in completion order. The first segment to exhaust its retries trips a
/// pool-local child token so the remaining workers drain, and its error is
/// returned once the pool is empty. A caller-initiated cancel surfaces as
/// `Cancelled`.
pub(crate) async fn download_all(
    ctx: &WorkerContext,
    pending: Vec<SegmentDescriptor>,
    token: &CancellationToken,
    concurrency: usize,
) -> Result<(), EngineError> {
    if pending.is_empty() {
        return Ok(());
    }

    let workers = concurrency.clamp(1, pending.len());
    let pool_token = token.child_token();
    let mut first_error: Option<EngineError> = None;

    debug!(
        pending = pending.len(),
        workers, "Starting segment worker pool"
    );

    let mut completions = stream::iter(pending.into_iter().map(|segment| {
        let downloader = Arc::clone(&ctx.downloader);
        let transformer = Arc::clone(&ctx.transformer);
        let store = Arc::clone(&ctx.store);
        let tracker = Arc::clone(&ctx.tracker);
        let retry = ctx.retry.clone();
        let pool_token = pool_token.clone();
        async move {
            process_segment(
                &segment,
                downloader.as_ref(),
                transformer.as_ref(),
                &store,
                &tracker,
                &retry,
                &pool_token,
            )
            .await
            .map_err(|err| (segment.index, err))
        }
    }))
    .buffer_unordered(workers);

    while let Some(result) = completions.next().await {
        if let Err((index, err)) = result {
            if matches!(err, EngineError::Cancelled) {
                continue;
            }
            error!(index, error = %err, "Segment exhausted its retries");
            if first_error.is_none() {
                first_error = Some(err);
                // Drain: let in-flight workers observe the cancel instead of
                // aborting them mid-write.
                pool_token.cancel();
            }
        }
    }
    drop(completions);

    if let Some(err) = first_error {
        return Err(err);
    }
    if token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

/// One segment through the whole pipeline, with retry/backoff around the
/// attempt. `Decrypt(BadPadding)` is assumed to be a truncated body the first
/// time and fatal the second.
async fn process_segment(
    segment: &SegmentDescriptor,
    downloader: &dyn SegmentDownloader,
    transformer: &dyn SegmentTransformer,
    store: &SegmentStore,
    tracker: &ProgressTracker,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<(), EngineError> {
    let decrypt_failures = AtomicU32::new(0);

    retry_with_backoff(retry, token, |_attempt| {
        let decrypt_failures = &decrypt_failures;
        async move {
            let raw = match downloader.fetch(segment).await {
                Ok(raw) => raw,
                Err(err) if err.is_retryable() => return RetryAction::Retry(err),
                Err(err) => return RetryAction::Fail(err),
            };

            let data = match transformer.transform(raw, segment).await {
                Ok(data) => data,
                Err(
                    err @ EngineError::Decrypt {
                        kind: DecryptErrorKind::BadPadding,
                    },
                ) => {
                    if decrypt_failures.fetch_add(1, Ordering::Relaxed) >= 1 {
                        return RetryAction::Fail(err);
                    }
                    return RetryAction::Retry(err);
                }
                Err(err) if err.is_retryable() => return RetryAction::Retry(err),
                Err(err) => return RetryAction::Fail(err),
            };

            if validate::detect_media_segment(&data).is_none() {
                return RetryAction::Retry(EngineError::Validation {
                    index: segment.index,
                    reason: "no MPEG-TS or fMP4 signature".to_string(),
                });
            }

            if token.is_cancelled() {
                return RetryAction::Fail(EngineError::Cancelled);
            }

            match store.write_segment(segment.index, &data).await {
                Ok(size) => {
                    tracker.record_segment(size);
                    RetryAction::Success(())
                }
                Err(err) if err.is_retryable() => RetryAction::Retry(err),
                Err(err) => RetryAction::Fail(err),
            }
        }
    })
    .await
}
