//! Segment files: naming, the active writer, and the startup scan.
//!
//! Segments are newline-delimited JSON, one [`EventRecord`] per line, named
//! `wal_<UTC yyyymmdd_hhmmss>.log` so a lexicographic sort of file names is
//! also the creation order. Status updates are appended as full records with
//! the same id; the latest occurrence of an id wins during a scan.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use afftok_types::EventRecord;

use crate::error::{WalError, WalResult};

pub(crate) const SEGMENT_PREFIX: &str = "wal_";
pub(crate) const SEGMENT_SUFFIX: &str = ".log";

/// A closed segment and the ids of every record appearing in it.
///
/// The id set drives compaction: a segment may be deleted only once every
/// id it references is in a terminal state, so that no status mark an entry
/// depends on is lost.
#[derive(Debug)]
pub(crate) struct SegmentMeta {
    /// Segment file path.
    pub path: PathBuf,
    /// Ids of all records (appends and marks) written to this segment.
    pub ids: HashSet<Uuid>,
}

/// Outcome of scanning a WAL directory at startup.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    /// Closed segments in creation order.
    pub segments: Vec<SegmentMeta>,
    /// Latest record per id across all segments.
    pub entries: HashMap<Uuid, EventRecord>,
    /// Highest sequence number observed.
    pub max_seq: u64,
    /// Lines that failed JSON parse or checksum verification.
    pub corrupt_lines: u64,
}

/// Parse one segment line, verifying the checksum. Returns `None` for
/// corrupt lines; the caller counts them.
pub(crate) fn parse_line(line: &str) -> Option<EventRecord> {
    if line.trim().is_empty() {
        return None;
    }
    let record: EventRecord = serde_json::from_str(line).ok()?;
    if !record.verify_integrity() {
        return None;
    }
    Some(record)
}

/// Scan every segment in `dir` in name order, recovering entry state,
/// the maximum sequence number and the corruption count.
pub(crate) async fn scan_dir(dir: &Path) -> WalResult<ScanOutcome> {
    let mut names = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(dirent) = rd.next_entry().await? {
        if let Some(name) = dirent.file_name().to_str() {
            if name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    let mut outcome = ScanOutcome::default();
    for name in names {
        let path = dir.join(&name);
        let contents = fs::read_to_string(&path).await?;
        let mut ids = HashSet::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(record) => {
                    outcome.max_seq = outcome.max_seq.max(record.seq);
                    ids.insert(record.id);
                    // Later lines supersede earlier ones for the same id.
                    outcome.entries.insert(record.id, record);
                }
                None => {
                    outcome.corrupt_lines += 1;
                    warn!(segment = %name, "skipping corrupt WAL line");
                }
            }
        }
        outcome.segments.push(SegmentMeta { path, ids });
    }
    Ok(outcome)
}

/// The single active segment file. Owned by one mutex-protected writer;
/// readers only ever touch closed segments.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    bytes: u64,
    /// Ids referenced by the active segment, moved into [`SegmentMeta`]
    /// on rotation.
    ids: HashSet<Uuid>,
}

impl SegmentWriter {
    /// Create a fresh segment in `dir` and open it for append.
    pub async fn create(dir: &Path) -> WalResult<Self> {
        let path = next_segment_path(dir).await?;
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            bytes: 0,
            ids: HashSet::new(),
        })
    }

    /// Append one record as a JSONL line, optionally fsyncing the data.
    /// Returns the active segment size after the write.
    pub async fn write_record(&mut self, record: &EventRecord, sync: bool) -> WalResult<u64> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        if sync {
            self.file.sync_data().await?;
        }
        self.bytes += line.len() as u64;
        self.ids.insert(record.id);
        Ok(self.bytes)
    }

    /// Flush buffered data to disk.
    pub async fn sync(&mut self) -> WalResult<()> {
        self.file.sync_data().await?;
        Ok(())
    }

    /// Close the active segment (fsynced) and open a new one. Returns the
    /// metadata of the now-closed segment.
    pub async fn rotate(&mut self) -> WalResult<SegmentMeta> {
        self.file.sync_all().await?;
        let closed = SegmentMeta {
            path: std::mem::take(&mut self.path),
            ids: std::mem::take(&mut self.ids),
        };
        let fresh = Self::create(&self.dir).await?;
        self.file = fresh.file;
        self.path = fresh.path;
        self.bytes = 0;
        Ok(closed)
    }

    /// Current size of the active segment in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Ids referenced by the active segment.
    pub fn ids(&self) -> &HashSet<Uuid> {
        &self.ids
    }

    /// Path of the active segment.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Next free segment path. Rotation twice within one second gets a numeric
/// disambiguator that still sorts after the base name.
async fn next_segment_path(dir: &Path) -> WalResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let base = dir.join(format!("{SEGMENT_PREFIX}{stamp}{SEGMENT_SUFFIX}"));
    if !base.exists() {
        return Ok(base);
    }
    for n in 1..10_000u32 {
        let candidate = dir.join(format!("{SEGMENT_PREFIX}{stamp}_{n}{SEGMENT_SUFFIX}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(WalError::DirectoryUnusable(format!(
        "cannot allocate a segment name in {}",
        dir.display()
    )))
}
