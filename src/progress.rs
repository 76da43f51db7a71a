// Progress aggregation and the 1 Hz speed sampler.

use crate::events::{EngineEvent, EventSender};
use crate::task::TaskStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared per-task counters. Workers bump them on each segment completion;
/// the sampler and the driver read them to build progress snapshots.
pub struct ProgressTracker {
    total_count: usize,
    done_count: AtomicUsize,
    bytes_total: AtomicU64,
}

impl ProgressTracker {
    pub fn new(total_count: usize) -> Self {
        Self {
            total_count,
            done_count: AtomicUsize::new(0),
            bytes_total: AtomicU64::new(0),
        }
    }

    /// Count segments proven durable by the resume journal before any worker
    /// starts.
    pub fn seed(&self, done_count: usize, bytes: u64) {
        self.done_count.store(done_count, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    pub fn record_segment(&self, bytes: u64) {
        self.done_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn done_count(&self) -> usize {
        self.done_count.load(Ordering::Relaxed)
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        self.total_count > 0 && self.done_count() >= self.total_count
    }

    /// Integer percent, floor semantics, bounded to 100.
    pub fn percent(&self) -> u32 {
        if self.total_count == 0 {
            return 0;
        }
        ((self.done_count() * 100 / self.total_count) as u32).min(100)
    }
}

/// Format a byte rate the way the UI displays it.
pub fn format_speed(bytes_per_sec: f64) -> String {
    let kib = bytes_per_sec / 1024.0;
    if kib >= 1024.0 {
        format!("{:.1} MB/s", kib / 1024.0)
    } else {
        format!("{kib:.1} KB/s")
    }
}

/// Build a progress event from the current counters.
pub(crate) fn progress_event(
    id: &str,
    tracker: &ProgressTracker,
    status: TaskStatus,
    speed_bps: f64,
) -> EngineEvent {
    EngineEvent::DownloadProgress {
        id: id.to_string(),
        progress: tracker.percent(),
        speed: format_speed(speed_bps),
        status: status.code(),
        done_count: tracker.done_count(),
        total_count: tracker.total_count(),
    }
}

/// Spawn the 1 Hz sampler for one task.
///
/// Each tick computes `speed = bytes_total - bytes_total_1s_ago` and emits a
/// `download_progress` event only when the integer percent moved, which caps
/// the stream at 100 emissions plus the driver's terminal snapshot. The
/// sampler exits as soon as the task leaves `Downloading` or is cancelled.
pub(crate) fn spawn_sampler(
    id: String,
    tracker: Arc<ProgressTracker>,
    mut status_rx: watch::Receiver<TaskStatus>,
    events: EventSender,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        // Consume the immediate first tick so the first sample is a real
        // one-second window.
        interval.tick().await;

        let mut last_bytes = tracker.bytes_total();
        let mut last_percent: Option<u32> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = status_rx.changed() => {
                    // Leaving `Downloading` (or the sender going away) ends
                    // the sampler; the driver emits the terminal snapshot.
                    if changed.is_err() || *status_rx.borrow() != TaskStatus::Downloading {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let status = *status_rx.borrow();
                    if status != TaskStatus::Downloading {
                        break;
                    }

                    let bytes = tracker.bytes_total();
                    let speed_bps = bytes.saturating_sub(last_bytes) as f64;
                    last_bytes = bytes;

                    let percent = tracker.percent();
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        let _ = events.send(progress_event(&id, &tracker, status, speed_bps));
                    }
                }
            }
        }
    })
}
