//! The write-ahead log proper: append, mark, replay, compact.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use afftok_types::{EventKind, EventRecord, EventStatus, MAX_PAYLOAD_BYTES};

use crate::error::{WalError, WalResult};
use crate::segment::{scan_dir, SegmentMeta, SegmentWriter};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Write-ahead log configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files. Created if absent.
    pub dir: PathBuf,
    /// Rotation threshold for the active segment.
    pub max_segment_bytes: u64,
    /// Ceiling on entries in the pending state before appends are refused.
    pub max_pending: usize,
    /// Interval of the periodic fsync task.
    pub sync_interval: Duration,
    /// When true (the default), every append fsyncs before returning and
    /// the durability guarantee is per-entry. When false, durability is
    /// bounded by `sync_interval`.
    pub sync_on_append: bool,
}

impl WalConfig {
    /// Config with defaults for the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: 100 * 1024 * 1024,
            max_pending: 100_000,
            sync_interval: Duration::from_millis(100),
            sync_on_append: true,
        }
    }
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

/// Point-in-time WAL statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct WalMetrics {
    /// Records appended since startup.
    pub appended: u64,
    /// Status marks written since startup.
    pub marked: u64,
    /// Entries re-delivered by replay since startup.
    pub replayed: u64,
    /// Entries marked failed since startup.
    pub failed: u64,
    /// Lines skipped for JSON or checksum corruption.
    pub corrupt_lines: u64,
    /// Entries currently pending.
    pub pending: usize,
    /// Closed segments on disk.
    pub closed_segments: usize,
    /// Size of the active segment in bytes.
    pub active_segment_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    appended: AtomicU64,
    marked: AtomicU64,
    replayed: AtomicU64,
    failed: AtomicU64,
    corrupt_lines: AtomicU64,
}

//─────────────────────────────
//  Replay
//─────────────────────────────

/// Handler invoked for each pending entry during replay.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    /// Process one recovered entry. An `Ok` marks it replayed; an `Err`
    /// marks it failed with the error message.
    async fn handle(&self, record: &EventRecord) -> anyhow::Result<()>;
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    /// Entries delivered and marked replayed.
    pub replayed: u64,
    /// Entries whose handler failed; marked failed.
    pub failed: u64,
}

/// Summary of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionSummary {
    /// Segment files deleted.
    pub segments_removed: usize,
    /// Entries evicted from the in-memory index.
    pub entries_dropped: usize,
}

//─────────────────────────────
//  The log
//─────────────────────────────

/// State behind the single writer mutex: the active segment, the closed
/// segment list and the entry index (latest record per id).
struct WalState {
    writer: SegmentWriter,
    segments: Vec<SegmentMeta>,
    entries: HashMap<Uuid, EventRecord>,
    pending: usize,
}

/// Crash-durable, checksum-verified append-only journal.
///
/// Every admitted event is appended here before any downstream work; after
/// a crash, [`WriteAheadLog::replay`] re-delivers everything that never
/// reached a terminal status. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct WriteAheadLog {
    config: Arc<WalConfig>,
    seq: Arc<AtomicU64>,
    state: Arc<Mutex<WalState>>,
    counters: Arc<Counters>,
}

impl WriteAheadLog {
    /// Open the log, scanning existing segments to recover entry state and
    /// the maximum sequence number, then start a fresh active segment.
    pub async fn open(config: WalConfig) -> WalResult<Self> {
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| WalError::DirectoryUnusable(format!("{}: {e}", config.dir.display())))?;

        let scan = scan_dir(&config.dir).await?;
        let pending = scan
            .entries
            .values()
            .filter(|r| r.status == EventStatus::Pending)
            .count();
        info!(
            segments = scan.segments.len(),
            entries = scan.entries.len(),
            pending,
            max_seq = scan.max_seq,
            corrupt = scan.corrupt_lines,
            "WAL recovered"
        );

        let writer = SegmentWriter::create(&config.dir).await?;
        let counters = Counters {
            corrupt_lines: AtomicU64::new(scan.corrupt_lines),
            ..Counters::default()
        };
        Ok(Self {
            config: Arc::new(config),
            seq: Arc::new(AtomicU64::new(scan.max_seq)),
            state: Arc::new(Mutex::new(WalState {
                writer,
                segments: scan.segments,
                entries: scan.entries,
                pending,
            })),
            counters: Arc::new(counters),
        })
    }

    /// Append a new pending entry. On success the entry is durable (with
    /// `sync_on_append`) and its strictly increasing sequence is assigned.
    pub async fn append(
        &self,
        kind: EventKind,
        tenant_id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> WalResult<EventRecord> {
        let payload_size = serde_json::to_vec(&payload)?.len();
        if payload_size > MAX_PAYLOAD_BYTES {
            return Err(WalError::PayloadTooLarge {
                size: payload_size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let mut state = self.state.lock().await;
        if state.pending >= self.config.max_pending {
            return Err(WalError::BackpressureExceeded {
                pending: state.pending,
                ceiling: self.config.max_pending,
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = EventRecord::new(seq, kind, tenant_id, payload);
        self.write_locked(&mut state, &record).await?;
        state.entries.insert(record.id, record.clone());
        state.pending += 1;
        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        debug!(id = %record.id, seq, kind = %kind, "WAL append");
        Ok(record)
    }

    /// Advance an entry's status. Transitions are monotone; marking a
    /// terminal entry with its current status is an idempotent no-op.
    pub async fn mark(
        &self,
        id: Uuid,
        status: EventStatus,
        error_message: Option<String>,
    ) -> WalResult<()> {
        let mut state = self.state.lock().await;
        let current = state
            .entries
            .get(&id)
            .ok_or(WalError::EntryNotFound(id))?
            .clone();

        if current.status == status {
            return Ok(());
        }
        if !current.status.can_transition_to(status) {
            return Err(WalError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let mut updated = current;
        let was_pending = updated.status == EventStatus::Pending;
        updated.status = status;
        updated.attempts += 1;
        updated.last_attempt = Some(Utc::now());
        updated.error = error_message;

        self.write_locked(&mut state, &updated).await?;
        if was_pending && status.is_terminal() {
            state.pending = state.pending.saturating_sub(1);
        }
        state.entries.insert(id, updated);
        self.counters.marked.fetch_add(1, Ordering::Relaxed);
        match status {
            EventStatus::Replayed => {
                self.counters.replayed.fetch_add(1, Ordering::Relaxed);
            }
            EventStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-deliver every pending entry, in sequence order, to `handler`.
    /// Handler success marks the entry replayed; handler failure marks it
    /// failed with the error message and replay moves on.
    pub async fn replay<H: ReplayHandler + ?Sized>(&self, handler: &H) -> WalResult<ReplaySummary> {
        let mut pending: Vec<EventRecord> = {
            let state = self.state.lock().await;
            state
                .entries
                .values()
                .filter(|r| r.status == EventStatus::Pending)
                .cloned()
                .collect()
        };
        pending.sort_by_key(|r| r.seq);

        let mut summary = ReplaySummary::default();
        for record in pending {
            match handler.handle(&record).await {
                Ok(()) => {
                    self.mark(record.id, EventStatus::Replayed, None).await?;
                    summary.replayed += 1;
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "replay handler failed");
                    self.mark(record.id, EventStatus::Failed, Some(e.to_string()))
                        .await?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Delete every closed segment whose referenced entries are all
    /// terminal. Best-effort and idempotent: a segment that cannot be
    /// removed stays for the next pass.
    pub async fn compact(&self) -> WalResult<CompactionSummary> {
        let mut state = self.state.lock().await;
        let mut summary = CompactionSummary::default();

        let segments = std::mem::take(&mut state.segments);
        let mut kept = Vec::new();
        for segment in segments {
            let all_terminal = segment.ids.iter().all(|id| {
                state
                    .entries
                    .get(id)
                    .map(|r| r.status.is_terminal())
                    // An id without an index entry was already compacted away.
                    .unwrap_or(true)
            });
            if !all_terminal {
                kept.push(segment);
                continue;
            }
            match tokio::fs::remove_file(&segment.path).await {
                Ok(()) => {
                    debug!(segment = %segment.path.display(), "compacted WAL segment");
                    summary.segments_removed += 1;
                }
                Err(e) => {
                    error!(segment = %segment.path.display(), error = %e, "compaction failed");
                    kept.push(segment);
                }
            }
        }
        state.segments = kept;

        // Evict index entries no longer referenced by any segment on disk.
        let mut referenced: HashSet<Uuid> = state.writer.ids().clone();
        for segment in &state.segments {
            referenced.extend(segment.ids.iter().copied());
        }
        let before = state.entries.len();
        state.entries.retain(|id, _| referenced.contains(id));
        summary.entries_dropped = before - state.entries.len();
        Ok(summary)
    }

    /// Flush the active segment to disk.
    pub async fn sync(&self) -> WalResult<()> {
        self.state.lock().await.writer.sync().await
    }

    /// Spawn the periodic fsync task. Exits when `shutdown` flips true,
    /// flushing once more on the way out.
    pub fn spawn_sync_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let wal = self.clone();
        let interval = wal.config.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = wal.sync().await {
                            error!(error = %e, "periodic WAL fsync failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = wal.sync().await;
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Look up the latest state of an entry.
    pub async fn entry(&self, id: Uuid) -> Option<EventRecord> {
        self.state.lock().await.entries.get(&id).cloned()
    }

    /// Current statistics.
    pub async fn metrics(&self) -> WalMetrics {
        let state = self.state.lock().await;
        WalMetrics {
            appended: self.counters.appended.load(Ordering::Relaxed),
            marked: self.counters.marked.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            corrupt_lines: self.counters.corrupt_lines.load(Ordering::Relaxed),
            pending: state.pending,
            closed_segments: state.segments.len(),
            active_segment_bytes: state.writer.bytes(),
        }
    }

    /// The sequence number most recently assigned.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Write a record through the active segment, rotating afterwards if
    /// the segment crossed the size threshold.
    async fn write_locked(&self, state: &mut WalState, record: &EventRecord) -> WalResult<()> {
        let bytes = state
            .writer
            .write_record(record, self.config.sync_on_append)
            .await?;
        if bytes >= self.config.max_segment_bytes {
            let closed = state.writer.rotate().await?;
            info!(segment = %closed.path.display(), bytes, "WAL segment rotated");
            state.segments.push(closed);
        }
        Ok(())
    }
}
