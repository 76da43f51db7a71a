// Typed events the engine emits toward the UI collaborator. Field names keep
// the wire shapes the UI already consumes (camelCase where the protocol has
// them), so payloads can be forwarded verbatim as JSON.

use serde::Serialize;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Sent once when the per-task temp directory is established.
    CreateTempDirectory {
        id: String,
        #[serde(rename = "isCreatedTempDir")]
        is_created_temp_dir: bool,
    },
    /// Periodic progress snapshot; also the final word on cancelled (status 0)
    /// and mux-failed (status 400) tasks.
    DownloadProgress {
        id: String,
        /// Integer percent in `[0, 100]`, floor of `done / total`.
        progress: u32,
        /// Human-readable rate, e.g. `"734.2 KB/s"`.
        speed: String,
        /// Stable status code shared with the UI.
        status: u16,
        done_count: usize,
        total_count: usize,
    },
    /// Entering the muxing phase; the UI uses this to free a download slot.
    StartMergeVideo { id: String },
    /// Mux finished; `file` is the absolute output path.
    MergeVideo {
        id: String,
        #[serde(rename = "isMerged")]
        is_merged: bool,
        file: String,
    },
}

impl EngineEvent {
    /// Event name on the UI bus.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTempDirectory { .. } => "create_temp_directory",
            Self::DownloadProgress { .. } => "download_progress",
            Self::StartMergeVideo { .. } => "start_merge_video",
            Self::MergeVideo { .. } => "merge_video",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::CreateTempDirectory { id, .. }
            | Self::DownloadProgress { id, .. }
            | Self::StartMergeVideo { id }
            | Self::MergeVideo { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_keep_the_ui_field_names() {
        let event = EngineEvent::CreateTempDirectory {
            id: "t1".to_string(),
            is_created_temp_dir: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "create_temp_directory");
        assert_eq!(json["isCreatedTempDir"], true);

        let event = EngineEvent::MergeVideo {
            id: "t1".to_string(),
            is_merged: true,
            file: "/videos/movie.mp4".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["isMerged"], true);
        assert_eq!(json["file"], "/videos/movie.mp4");
    }

    #[test]
    fn names_and_ids_round_trip() {
        let event = EngineEvent::StartMergeVideo {
            id: "abc".to_string(),
        };
        assert_eq!(event.name(), "start_merge_video");
        assert_eq!(event.task_id(), "abc");
    }
}
