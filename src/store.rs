//! On-disk segment store: one temp directory per task, an atomic
//! write-then-rename protocol for segment files, and an append-only journal
//! that proves which segments are durable across crashes.
//!
//! Durability contract: a segment counts as done iff its finalized file
//! exists, its size matches the (latest) journal entry, and the content
//! passes the media-segment validator. Anything else reverts to pending and
//! the stale file is discarded.

use crate::error::EngineError;
use crate::validate;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "journal.log";
const CONCAT_FILE: &str = "concat.txt";

/// How much of a segment file the resume validator reads. The validator only
/// inspects the head of the data, so re-validation stays O(journal).
const VALIDATION_PREFIX_LEN: usize = 512;

/// Segments recovered from the journal at task start: index to size on disk.
#[derive(Debug, Default)]
pub struct RecoveredSegments {
    pub done: BTreeMap<usize, u64>,
}

impl RecoveredSegments {
    pub fn contains(&self, index: usize) -> bool {
        self.done.contains_key(&index)
    }

    pub fn total_bytes(&self) -> u64 {
        self.done.values().sum()
    }
}

pub struct SegmentStore {
    root: PathBuf,
    journal: Mutex<Option<File>>,
}

impl SegmentStore {
    /// Temp directory layout shared with `delete_download`:
    /// `<output_dir>/.m3u8dl-<task id>`.
    pub fn temp_dir_path(output_dir: &Path, task_id: &str) -> PathBuf {
        output_dir.join(format!(".m3u8dl-{task_id}"))
    }

    pub fn new(output_dir: &Path, task_id: &str) -> Self {
        Self {
            root: Self::temp_dir_path(output_dir, task_id),
            journal: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("seg-{index:06}.ts"))
    }

    pub fn segment_file_name(index: usize) -> String {
        format!("seg-{index:06}.ts")
    }

    fn part_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("seg-{index:06}.ts.part"))
    }

    pub fn concat_path(&self) -> PathBuf {
        self.root.join(CONCAT_FILE)
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    /// Create the temp directory. Returns whether it had to be created.
    pub async fn ensure_dir(&self) -> Result<bool, EngineError> {
        let existed = tokio::fs::try_exists(&self.root).await.unwrap_or(false);
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(!existed)
    }

    /// First 4 bytes of the SHA-1 of the segment body, hex encoded.
    pub fn fingerprint(data: &[u8]) -> String {
        hex::encode(&Sha1::digest(data)[..4])
    }

    /// Persist one finalized segment.
    ///
    /// Download order: write `.part`, fsync, rename to the final name, append
    /// the journal line, fsync the journal. A crash between rename and append
    /// leaves the file unreferenced, so it is simply re-downloaded; a crash
    /// after the append means the file is complete on disk.
    pub async fn write_segment(&self, index: usize, data: &[u8]) -> Result<u64, EngineError> {
        let part = self.part_path(index);
        let final_path = self.segment_path(index);

        let mut file = File::create(&part).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&part, &final_path).await?;

        let line = format!("{index} {} {}\n", data.len(), Self::fingerprint(data));
        let mut journal = self.journal.lock().await;
        if journal.is_none() {
            *journal = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.journal_path())
                    .await?,
            );
        }
        let journal_file = journal.as_mut().expect("journal opened above");
        journal_file.write_all(line.as_bytes()).await?;
        journal_file.sync_all().await?;

        debug!(index, size = data.len(), "Segment persisted");
        Ok(data.len() as u64)
    }

    /// Replay the journal and re-validate every referenced segment file.
    ///
    /// Later journal entries win for an index (a resumed run may have
    /// re-downloaded a segment that failed validation earlier). Invalid or
    /// missing files are deleted and their indices revert to pending.
    pub async fn recover(&self) -> Result<RecoveredSegments, EngineError> {
        let mut recovered = RecoveredSegments::default();

        let journal_path = self.journal_path();
        if !tokio::fs::try_exists(&journal_path).await.unwrap_or(false) {
            return Ok(recovered);
        }

        let text = tokio::fs::read_to_string(&journal_path).await?;
        let mut entries: BTreeMap<usize, u64> = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_journal_line(line) {
                Ok((index, size)) => {
                    entries.insert(index, size);
                }
                Err(err) => {
                    warn!(error = %err, line, "Skipping corrupt journal line");
                }
            }
        }

        for (index, size) in entries {
            if self.revalidate_segment(index, size).await {
                recovered.done.insert(index, size);
            }
        }

        info!(
            recovered = recovered.done.len(),
            bytes = recovered.total_bytes(),
            "Journal replay finished"
        );
        Ok(recovered)
    }

    /// Check one journal-referenced file: existence, size, and content head.
    /// Deletes the file when any check fails.
    async fn revalidate_segment(&self, index: usize, journal_size: u64) -> bool {
        let path = self.segment_path(index);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                debug!(index, "Journaled segment file is missing");
                return false;
            }
        };
        if metadata.len() != journal_size {
            warn!(
                index,
                on_disk = metadata.len(),
                journaled = journal_size,
                "Segment size mismatch, discarding file"
            );
            let _ = tokio::fs::remove_file(&path).await;
            return false;
        }

        match read_prefix(&path, VALIDATION_PREFIX_LEN).await {
            Ok(prefix) if validate::is_valid_media_segment(&prefix) => true,
            Ok(_) => {
                warn!(index, "Segment failed re-validation, discarding file");
                let _ = tokio::fs::remove_file(&path).await;
                false
            }
            Err(err) => {
                warn!(index, error = %err, "Cannot read segment, discarding file");
                let _ = tokio::fs::remove_file(&path).await;
                false
            }
        }
    }

    /// Remove the temp directory with everything in it (segments, journal,
    /// concat list).
    pub async fn remove(&self) -> Result<(), EngineError> {
        // Drop the journal handle first so removal works on platforms that
        // refuse to delete open files.
        *self.journal.lock().await = None;
        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }
}

fn parse_journal_line(line: &str) -> Result<(usize, u64), EngineError> {
    let mut parts = line.split_whitespace();
    let index = parts
        .next()
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| EngineError::JournalCorruption {
            reason: format!("bad index in `{line}`"),
        })?;
    let size = parts
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| EngineError::JournalCorruption {
            reason: format!("bad size in `{line}`"),
        })?;
    // The sha1 prefix is kept for diagnostics; its absence is tolerated so an
    // older journal format still resumes.
    Ok((index, size))
}

async fn read_prefix(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; limit];
    let mut filled = 0;
    loop {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
        if filled == buffer.len() {
            break;
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::TS_PACKET_LEN;
    use tempfile::TempDir;

    fn ts_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for offset in (0..len).step_by(TS_PACKET_LEN) {
            data[offset] = 0x47;
        }
        data
    }

    #[tokio::test]
    async fn write_segment_finalizes_file_and_journal() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();

        let data = ts_bytes(1024);
        let size = store.write_segment(3, &data).await.unwrap();
        assert_eq!(size, 1024);

        let final_path = store.segment_path(3);
        assert!(final_path.exists());
        assert!(!store.part_path(3).exists());
        assert!(final_path.ends_with("seg-000003.ts"));

        let journal = std::fs::read_to_string(store.journal_path()).unwrap();
        let expected = format!("3 1024 {}\n", SegmentStore::fingerprint(&data));
        assert_eq!(journal, expected);
    }

    #[tokio::test]
    async fn recover_returns_journaled_valid_segments() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();
        store.write_segment(0, &ts_bytes(1024)).await.unwrap();
        store.write_segment(1, &ts_bytes(2048)).await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.done.len(), 2);
        assert_eq!(recovered.done[&0], 1024);
        assert_eq!(recovered.done[&1], 2048);
        assert_eq!(recovered.total_bytes(), 3072);
    }

    #[tokio::test]
    async fn recover_discards_size_mismatches() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();
        store.write_segment(0, &ts_bytes(1024)).await.unwrap();

        // Truncate the file behind the journal's back.
        std::fs::write(store.segment_path(0), ts_bytes(188)).unwrap();

        let recovered = store.recover().await.unwrap();
        assert!(recovered.done.is_empty());
        assert!(!store.segment_path(0).exists());
    }

    #[tokio::test]
    async fn recover_discards_invalid_content() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();

        // Journaled entry whose file is an HTML error page of the right size.
        let body = vec![b'x'; 1024];
        std::fs::write(store.segment_path(0), &body).unwrap();
        std::fs::write(store.journal_path(), "0 1024 deadbeef\n").unwrap();

        let recovered = store.recover().await.unwrap();
        assert!(recovered.done.is_empty());
        assert!(!store.segment_path(0).exists());
    }

    #[tokio::test]
    async fn recover_skips_corrupt_journal_lines() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();

        let data = ts_bytes(1024);
        std::fs::write(store.segment_path(2), &data).unwrap();
        let journal = format!(
            "not a line\n\n2 1024 {}\n9999 nonsense\n",
            SegmentStore::fingerprint(&data)
        );
        std::fs::write(store.journal_path(), journal).unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.done.len(), 1);
        assert!(recovered.contains(2));
    }

    #[tokio::test]
    async fn later_journal_entries_win() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();

        let data = ts_bytes(2048);
        std::fs::write(store.segment_path(0), &data).unwrap();
        // First entry is stale (different size), the re-download appended a
        // second entry with the real size.
        std::fs::write(store.journal_path(), "0 1024 aaaaaaaa\n0 2048 bbbbbbbb\n").unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.done[&0], 2048);
    }

    #[tokio::test]
    async fn recover_without_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();
        let recovered = store.recover().await.unwrap();
        assert!(recovered.done.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_the_temp_directory() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), "task-1");
        store.ensure_dir().await.unwrap();
        store.write_segment(0, &ts_bytes(188)).await.unwrap();

        store.remove().await.unwrap();
        assert!(!store.root().exists());
        // Removing again is a no-op.
        store.remove().await.unwrap();
    }

    #[test]
    fn temp_dir_path_embeds_the_task_id() {
        let path = SegmentStore::temp_dir_path(Path::new("/videos"), "abc123");
        assert_eq!(path, PathBuf::from("/videos/.m3u8dl-abc123"));
    }
}
