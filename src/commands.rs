// Command surface consumed by the UI collaborator: start / cancel / delete
// plus the small system queries. Commands go in, events come out over the
// channel supplied at construction; no other state crosses the boundary.

use crate::client::{self, sanitize_headers};
use crate::config::EngineConfig;
use crate::decryption::KeyCache;
use crate::error::EngineError;
use crate::events::EventSender;
use crate::muxer::FfmpegMuxer;
use crate::playlist::HttpPlaylistSource;
use crate::registry::{TaskHandle, TaskRegistry};
use crate::store::SegmentStore;
use crate::task::{TaskDriver, TaskSpec};
use crate::worker::{DecryptingTransformer, HttpSegmentDownloader};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Physical and logical core counts, for the UI's thread-budget picker.
pub fn get_cpu_info() -> (usize, usize) {
    (num_cpus::get_physical(), num_cpus::get())
}

/// The download engine. One instance per process; cheap to share behind an
/// `Arc`.
pub struct Engine {
    config: EngineConfig,
    client: Client,
    registry: Arc<TaskRegistry>,
    events: EventSender,
}

impl Engine {
    /// Build the engine with its shared HTTP client. The connection pool is
    /// sized so a single task at the concurrency cap cannot exhaust it.
    pub fn new(config: EngineConfig, events: EventSender) -> Result<Self, EngineError> {
        let pool_size = config
            .http
            .pool_max_idle_per_host
            .max(config.worker.concurrency_cap);
        let client = client::create_client(&config.http, pool_size)?;
        Ok(Self {
            config,
            client,
            registry: Arc::new(TaskRegistry::new()),
            events,
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run one download to a terminal state.
    ///
    /// Resolves `Ok` on `muxed` and on user cancellation; any failure is the
    /// `Err`. The task is registered before the first await so
    /// `cancel_download` works from the moment this returns control to the
    /// caller's executor.
    pub async fn start_download(&self, spec: TaskSpec) -> Result<(), EngineError> {
        let id = spec.id.clone();
        let token = CancellationToken::new();
        let store = Arc::new(SegmentStore::new(&spec.output_dir, &spec.id));

        let handle = Arc::new(TaskHandle::new(token.clone(), store.root().to_path_buf()));
        self.registry.register(&id, Arc::clone(&handle))?;

        let headers = sanitize_headers(&spec.headers);
        let cap = self.config.worker.concurrency_cap.max(1);
        let concurrency = spec.thread_count.clamp(1, cap);

        let driver = TaskDriver {
            spec,
            store,
            playlist: Arc::new(HttpPlaylistSource::new(self.client.clone(), headers.clone())),
            downloader: Arc::new(HttpSegmentDownloader::new(
                self.client.clone(),
                headers.clone(),
            )),
            transformer: Arc::new(DecryptingTransformer::new(KeyCache::new(
                self.client.clone(),
                headers,
            ))),
            muxer: Arc::new(FfmpegMuxer::new(&self.config.muxer)),
            events: self.events.clone(),
            token,
            retry: self.config.worker.retry.clone(),
            concurrency,
        };

        // The wrapper latches `finished` the moment the driver unwinds, so
        // `delete_download` can wait for a quiescent temp directory even if
        // the caller dropped this future.
        let handle_for_driver = Arc::clone(&handle);
        handle.attach_driver(tokio::spawn(async move {
            let result = driver.run().await;
            handle_for_driver.mark_finished();
            result
        }));

        let result = handle
            .wait()
            .await
            .unwrap_or_else(|| Err(EngineError::internal("task driver already consumed")));

        self.registry.remove(&id);
        result
    }

    /// Trip a task's cancel switch. Idempotent; a terminal or unknown id is a
    /// no-op. The temp directory is kept so the task can resume later.
    pub fn cancel_download(&self, id: &str) {
        self.registry.cancel(id);
    }

    /// Cancel the task if it is active, wait for its driver to unwind, then
    /// remove the temp directory.
    pub async fn delete_download(&self, id: &str, output_dir: &Path) -> Result<(), EngineError> {
        if let Some(handle) = self.registry.get(id) {
            handle.cancel();
            // The driver drains outstanding writes before finishing, so the
            // directory is quiescent when we delete it.
            handle.finished().await;
            self.registry.remove(id);
        }

        let temp_dir = SegmentStore::temp_dir_path(output_dir, id);
        if tokio::fs::try_exists(&temp_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&temp_dir).await?;
            info!(id, dir = %temp_dir.display(), "Removed task temp directory");
        } else {
            warn!(id, "delete_download found no temp directory");
        }
        Ok(())
    }

    /// Remove a finalized output file. Unconditional; recycle-bin style
    /// policies belong to the caller.
    pub async fn delete_file(&self, file_path: &Path) -> Result<(), EngineError> {
        tokio::fs::remove_file(file_path).await?;
        info!(file = %file_path.display(), "Removed file");
        Ok(())
    }
}
