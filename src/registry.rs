// Process-wide task registry: one handle per active download, owning the
// cancellation switch and the driver join handle.

use crate::error::EngineError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type DriverJoin = JoinHandle<Result<(), EngineError>>;

/// Runtime handle for one active task.
pub struct TaskHandle {
    token: CancellationToken,
    temp_dir: PathBuf,
    /// Latched once the driver has fully unwound (journal consistent, no
    /// writes in flight). `delete_download` waits on this before removing
    /// the temp directory.
    finished: CancellationToken,
    driver: Mutex<Option<DriverJoin>>,
}

impl TaskHandle {
    pub(crate) fn new(token: CancellationToken, temp_dir: PathBuf) -> Self {
        Self {
            token,
            temp_dir,
            finished: CancellationToken::new(),
            driver: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub(crate) fn attach_driver(&self, join: DriverJoin) {
        *self.driver.lock().unwrap() = Some(join);
    }

    /// Await the driving task. Consumes the join handle; subsequent calls
    /// return `None`.
    pub(crate) async fn wait(&self) -> Option<Result<(), EngineError>> {
        let join = self.driver.lock().unwrap().take()?;
        let result = join.await.unwrap_or_else(|e| {
            Err(EngineError::internal(format!("task driver panicked: {e}")))
        });
        Some(result)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Resolves once the driver has unwound.
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await;
    }
}

/// Mapping from task id to handle, serialized by one coarse lock. Per-segment
/// hot paths never touch this lock; they hold their own Arc'd state.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, std::sync::Arc<TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Rejects duplicates: two drivers on one task id would
    /// share a segment store, which the store's single-writer journal
    /// protocol forbids.
    pub fn register(
        &self,
        id: &str,
        handle: std::sync::Arc<TaskHandle>,
    ) -> Result<(), EngineError> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(id) {
            warn!(id, "Rejecting duplicate task registration");
            return Err(EngineError::TaskExists { id: id.to_string() });
        }
        tasks.insert(id.to_string(), handle);
        debug!(id, "Task registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<std::sync::Arc<TaskHandle>> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    /// Trip a task's cancel switch. Idempotent; unknown and terminal ids are
    /// a no-op.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.cancel();
                debug!(id, "Task cancelled");
                true
            }
            None => {
                debug!(id, "Cancel for unknown task ignored");
                false
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<std::sync::Arc<TaskHandle>> {
        self.tasks.lock().unwrap().remove(id)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(
            CancellationToken::new(),
            PathBuf::from("/tmp/.m3u8dl-x"),
        ))
    }

    #[test]
    fn register_and_lookup() {
        let registry = TaskRegistry::new();
        registry.register("a", handle()).unwrap();
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = TaskRegistry::new();
        registry.register("a", handle()).unwrap();
        let err = registry.register("a", handle()).unwrap_err();
        assert!(matches!(err, EngineError::TaskExists { .. }));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_tolerates_unknown_ids() {
        let registry = TaskRegistry::new();
        let task = handle();
        registry.register("a", Arc::clone(&task)).unwrap();

        assert!(registry.cancel("a"));
        assert!(task.is_cancelled());
        // Again, and for a task that never existed.
        assert!(registry.cancel("a"));
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn remove_frees_the_id_for_reuse() {
        let registry = TaskRegistry::new();
        registry.register("a", handle()).unwrap();
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        registry.register("a", handle()).unwrap();
    }

    #[tokio::test]
    async fn wait_consumes_the_driver_handle() {
        let task = handle();
        task.attach_driver(tokio::spawn(async { Ok::<(), EngineError>(()) }));
        assert!(matches!(task.wait().await, Some(Ok(()))));
        assert!(task.wait().await.is_none());
    }

    #[tokio::test]
    async fn finished_latch_resolves_after_mark() {
        let task = handle();
        task.mark_finished();
        // Does not hang.
        task.finished().await;
    }
}
