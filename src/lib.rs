//! HLS VOD download engine.
//!
//! Given a media playlist URL, a destination directory, a thread budget and
//! optional HTTP headers, the engine downloads every segment (decrypting
//! AES-128 streams), survives crashes through a per-segment resume journal,
//! and drives ffmpeg to produce a single MP4. Commands go in through
//! [`Engine`]; progress and lifecycle updates come out as [`EngineEvent`]s
//! on the channel supplied at construction.
//!
//! ```no_run
//! use m3u8dl_engine::{Engine, EngineConfig, TaskSpec};
//!
//! # async fn demo() -> Result<(), m3u8dl_engine::EngineError> {
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let engine = Engine::new(EngineConfig::default(), events_tx)?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events_rx.recv().await {
//!         println!("{}: {:?}", event.name(), event);
//!     }
//! });
//!
//! engine
//!     .start_download(TaskSpec {
//!         id: "ep-01".into(),
//!         url: "https://cdn.example.com/vod/playlist.m3u8".into(),
//!         name: "Episode 1".into(),
//!         output_dir: "/videos".into(),
//!         thread_count: 8,
//!         headers: Default::default(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod commands;
pub mod config;
pub mod decryption;
pub mod error;
pub mod events;
pub mod muxer;
pub mod playlist;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;
pub mod validate;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for easier access
pub use commands::{get_cpu_info, Engine};
pub use config::{EngineConfig, HttpConfig, MuxerConfig, WorkerConfig};
pub use error::{DecryptErrorKind, EngineError, NetworkErrorKind};
pub use events::{EngineEvent, EventReceiver, EventSender};
pub use playlist::{MediaManifest, SegmentDescriptor};
pub use registry::{TaskHandle, TaskRegistry};
pub use retry::RetryPolicy;
pub use task::{TaskSpec, TaskStatus};
