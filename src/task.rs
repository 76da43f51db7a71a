// Task driver: owns one download end-to-end and serializes its state
// machine. Components are wired through trait seams so the pipeline can run
// against stub fetchers and muxers in tests.

use crate::error::EngineError;
use crate::events::{EngineEvent, EventSender};
use crate::muxer::{sanitize_filename, VideoMuxer};
use crate::playlist::PlaylistSource;
use crate::progress::{self, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::store::SegmentStore;
use crate::worker::{self, SegmentDownloader, SegmentTransformer, WorkerContext};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Task lifecycle states with their stable UI status codes.
///
/// ```text
/// new(10) ──start──▶ queued(1) ──admit──▶ downloading(2)
/// downloading ──all-done──▶ download-complete(3) ──▶ muxing(4) ──▶ muxed(5)
/// any ──cancel──▶ cancelled(0)        muxing ──ffmpeg-err──▶ mux-failed(400)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Queued,
    Downloading,
    DownloadComplete,
    Muxing,
    Muxed,
    Cancelled,
    MuxFailed,
}

impl TaskStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Cancelled => 0,
            Self::Queued => 1,
            Self::Downloading => 2,
            Self::DownloadComplete => 3,
            Self::Muxing => 4,
            Self::Muxed => 5,
            Self::New => 10,
            Self::MuxFailed => 400,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Muxed | Self::Cancelled | Self::MuxFailed)
    }
}

/// Caller-supplied description of one download.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Opaque id, stable across process restarts; also names the temp dir.
    pub id: String,
    /// Media playlist URL. Master playlists are rejected.
    pub url: String,
    /// Display name; sanitized into the output file name.
    pub name: String,
    pub output_dir: PathBuf,
    /// Segment worker budget.
    pub thread_count: usize,
    /// Extra request headers (referer, cookies, tokens).
    pub headers: HashMap<String, String>,
}

pub(crate) struct TaskDriver {
    pub spec: TaskSpec,
    pub store: Arc<SegmentStore>,
    pub playlist: Arc<dyn PlaylistSource>,
    pub downloader: Arc<dyn SegmentDownloader>,
    pub transformer: Arc<dyn SegmentTransformer>,
    pub muxer: Arc<dyn VideoMuxer>,
    pub events: EventSender,
    pub token: CancellationToken,
    pub retry: RetryPolicy,
    pub concurrency: usize,
}

fn emit_terminal(
    events: &EventSender,
    id: &str,
    status_tx: &watch::Sender<TaskStatus>,
    tracker: &ProgressTracker,
    status: TaskStatus,
) {
    status_tx.send_replace(status);
    let _ = events.send(progress::progress_event(id, tracker, status, 0.0));
}

impl TaskDriver {
    pub(crate) async fn run(self) -> Result<(), EngineError> {
        let TaskDriver {
            spec,
            store,
            playlist,
            downloader,
            transformer,
            muxer: mux_driver,
            events,
            token,
            retry,
            concurrency,
        } = self;

        let (status_tx, status_rx) = watch::channel(TaskStatus::New);
        let id = spec.id.clone();
        info!(id = %id, url = %spec.url, threads = concurrency, "Task accepted");
        status_tx.send_replace(TaskStatus::Queued);

        let created = match store.ensure_dir().await {
            Ok(created) => created,
            Err(err) => {
                error!(id = %id, error = %err, "Cannot create temp directory");
                emit_terminal(
                    &events,
                    &id,
                    &status_tx,
                    &ProgressTracker::new(0),
                    TaskStatus::Cancelled,
                );
                return Err(err);
            }
        };
        let _ = events.send(EngineEvent::CreateTempDirectory {
            id: id.clone(),
            is_created_temp_dir: created,
        });

        status_tx.send_replace(TaskStatus::Downloading);

        let manifest = match playlist.load(&spec.url).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(id = %id, error = %err, "Manifest rejected");
                emit_terminal(
                    &events,
                    &id,
                    &status_tx,
                    &ProgressTracker::new(0),
                    TaskStatus::Cancelled,
                );
                return Err(err);
            }
        };

        let total = manifest.segments.len();
        let tracker = Arc::new(ProgressTracker::new(total));

        let recovered = match store.recover().await {
            Ok(recovered) => recovered,
            Err(err) => {
                emit_terminal(&events, &id, &status_tx, &tracker, TaskStatus::Cancelled);
                return Err(err);
            }
        };
        tracker.seed(recovered.done.len(), recovered.total_bytes());

        let pending: Vec<_> = manifest
            .segments
            .iter()
            .filter(|segment| !recovered.contains(segment.index))
            .cloned()
            .collect();
        info!(
            id = %id,
            total,
            resumed = recovered.done.len(),
            pending = pending.len(),
            "Segment inventory ready"
        );

        let sampler = progress::spawn_sampler(
            id.clone(),
            Arc::clone(&tracker),
            status_rx,
            events.clone(),
            token.clone(),
        );

        let ctx = WorkerContext {
            downloader,
            transformer,
            store: Arc::clone(&store),
            tracker: Arc::clone(&tracker),
            retry,
        };
        let download_result = worker::download_all(&ctx, pending, &token, concurrency).await;

        match download_result {
            Err(EngineError::Cancelled) => {
                info!(id = %id, "Task cancelled; temp directory kept for resume");
                emit_terminal(&events, &id, &status_tx, &tracker, TaskStatus::Cancelled);
                let _ = sampler.await;
                // Cancellation is a state, not an error.
                return Ok(());
            }
            Err(err) => {
                error!(id = %id, error = %err, "Download failed; temp directory kept");
                emit_terminal(&events, &id, &status_tx, &tracker, TaskStatus::Cancelled);
                let _ = sampler.await;
                return Err(err);
            }
            Ok(()) => {}
        }

        status_tx.send_replace(TaskStatus::DownloadComplete);
        let _ = sampler.await;
        let _ = events.send(progress::progress_event(
            &id,
            &tracker,
            TaskStatus::DownloadComplete,
            0.0,
        ));

        // Cancel may have landed between the last segment and here; muxing a
        // cancelled task would fight delete_download over the temp dir.
        if token.is_cancelled() {
            emit_terminal(&events, &id, &status_tx, &tracker, TaskStatus::Cancelled);
            return Ok(());
        }

        status_tx.send_replace(TaskStatus::Muxing);
        let _ = events.send(EngineEvent::StartMergeVideo { id: id.clone() });

        let output = spec
            .output_dir
            .join(format!("{}.mp4", sanitize_filename(&spec.name)));

        let mux_result = match crate::muxer::write_concat_list(&store, total).await {
            Ok(concat) => mux_driver.mux(store.root(), &concat, &output).await,
            Err(err) => Err(err),
        };

        match mux_result {
            Err(err) => {
                error!(id = %id, error = %err, "Mux failed");
                emit_terminal(&events, &id, &status_tx, &tracker, TaskStatus::MuxFailed);
                Err(err)
            }
            Ok(()) => {
                if let Err(err) = store.remove().await {
                    warn!(id = %id, error = %err, "Temp directory cleanup failed");
                }
                status_tx.send_replace(TaskStatus::Muxed);
                let _ = events.send(EngineEvent::MergeVideo {
                    id: id.clone(),
                    is_merged: true,
                    file: output.to_string_lossy().to_string(),
                });
                info!(id = %id, output = %output.display(), "Task finished");
                Ok(())
            }
        }
    }
}
