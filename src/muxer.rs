//! External muxer driver: turns the finalized segment files into a single
//! MP4 by driving ffmpeg over a concat list, without re-encoding.

use crate::config::MuxerConfig;
use crate::error::EngineError;
use crate::store::SegmentStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Rolling stderr tail kept for the mux-failed diagnostic.
const STDERR_TAIL_LIMIT: usize = 4096;

#[async_trait]
pub trait VideoMuxer: Send + Sync {
    /// Produce `output` from the concat list. `temp_dir` is the task's
    /// segment directory and becomes the child's working directory.
    async fn mux(
        &self,
        temp_dir: &Path,
        concat_list: &Path,
        output: &Path,
    ) -> Result<(), EngineError>;
}

/// Write `concat.txt` listing every finalized segment in index order.
///
/// File names are generated from the index, so no untrusted string from the
/// playlist ever reaches the list or ffmpeg's argv.
pub async fn write_concat_list(
    store: &SegmentStore,
    total_count: usize,
) -> Result<PathBuf, EngineError> {
    let path = store.concat_path();
    let mut contents = String::with_capacity(total_count * 24);
    for index in 0..total_count {
        contents.push_str("file '");
        contents.push_str(&SegmentStore::segment_file_name(index));
        contents.push_str("'\n");
    }
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}

pub struct FfmpegMuxer {
    ffmpeg_path: String,
}

impl FfmpegMuxer {
    /// Binary resolution order: explicit config, `FFMPEG_PATH` env, `ffmpeg`
    /// on the search path.
    pub fn new(config: &MuxerConfig) -> Self {
        let ffmpeg_path = config
            .ffmpeg_path
            .clone()
            .or_else(|| std::env::var("FFMPEG_PATH").ok())
            .unwrap_or_else(|| "ffmpeg".to_string());
        Self { ffmpeg_path }
    }

    pub fn with_ffmpeg_path(path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: path.into(),
        }
    }

    fn build_args(concat_list: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            concat_list.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            "-bsf:a".to_string(),
            "aac_adtstoasc".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

fn ffmpeg_command(program: &str) -> Command {
    let mut command = Command::new(program);
    #[cfg(windows)]
    command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW
    command
}

/// Append a line to the rolling tail, dropping whole lines from the front
/// once the buffer exceeds the limit.
fn append_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    while tail.len() > STDERR_TAIL_LIMIT {
        match tail.find('\n') {
            Some(pos) => {
                tail.drain(..=pos);
            }
            None => {
                tail.clear();
            }
        }
    }
}

#[async_trait]
impl VideoMuxer for FfmpegMuxer {
    async fn mux(
        &self,
        temp_dir: &Path,
        concat_list: &Path,
        output: &Path,
    ) -> Result<(), EngineError> {
        let args = Self::build_args(concat_list, output);
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "Spawning muxer");

        let mut child = ffmpeg_command(&self.ffmpeg_path)
            .args(&args)
            .current_dir(temp_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // ffmpeg logs to stderr; stream it so long muxes stay observable and
        // keep a bounded tail for the failure diagnostic.
        let tail_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "m3u8dl_engine::ffmpeg", "{line}");
                    append_tail(&mut tail, &line);
                }
                tail
            })
        });

        let status = child.wait().await?;
        let stderr_tail = match tail_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(EngineError::Muxer {
                exit: status.code(),
                stderr_tail,
            });
        }

        // A zero exit with a missing or empty output still counts as failure.
        let output_len = tokio::fs::metadata(output).await.map(|m| m.len()).ok();
        match output_len {
            Some(len) if len > 0 => {
                info!(output = %output.display(), bytes = len, "Mux finished");
                Ok(())
            }
            _ => Err(EngineError::Muxer {
                exit: status.code(),
                stderr_tail: if stderr_tail.is_empty() {
                    "output file missing or empty".to_string()
                } else {
                    stderr_tail
                },
            }),
        }
    }
}

/// Strip characters the target file systems refuse, plus leading/trailing
/// dots and spaces. Windows device names get an underscore suffix. An empty
/// result falls back to `output`.
pub fn sanitize_filename(name: &str) -> String {
    const ILLEGAL: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

    let filtered: String = name.chars().filter(|c| !ILLEGAL.contains(c)).collect();
    let trimmed = filtered.trim_matches(|c| c == ' ' || c == '.');

    let mut sanitized = trimmed.to_string();

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = sanitized.split('.').next().unwrap_or("").to_uppercase();
    if RESERVED.contains(&stem.as_str()) {
        sanitized.push('_');
    }

    if sanitized.is_empty() {
        "output".to_string()
    } else {
        sanitized
    }
}
