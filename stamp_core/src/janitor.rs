//! Storage janitor
//!
//! A recurring sweep over the three working directories: first an age
//! pass deleting files past the max age, then a quota pass deleting
//! least-recently-accessed files until total usage is back under the
//! limit. The lifecycle tracker's refcount is the sole authority on
//! "file is busy"; wall-clock recency never protects a file by itself.
//!
//! Every per-file error is logged and skipped. The sweep never kills
//! the timer loop.

use crate::lifecycle::{self, LifecycleTracker};
use crate::working_dirs::WorkingDirectories;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, UNIX_EPOCH};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Time between scheduled sweeps.
    pub interval: Duration,
    /// Files older than this are eligible for the age sweep.
    pub max_age: Duration,
    /// Total bytes across all three directories before the quota sweep
    /// starts deleting.
    pub max_total_bytes: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            max_total_bytes: 100 * 1024 * 1024,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted_expired: usize,
    pub deleted_for_quota: usize,
    pub skipped_in_use: usize,
    pub bytes_freed: u64,
    /// True when the sweep was a no-op because another was in flight.
    pub already_running: bool,
}

#[derive(Debug)]
struct CandidateFile {
    path: PathBuf,
    size: u64,
    created_at: i64,
    last_accessed: i64,
}

pub struct Janitor {
    dirs: WorkingDirectories,
    tracker: Arc<LifecycleTracker>,
    config: JanitorConfig,
    sweeping: AtomicBool,
}

impl Janitor {
    pub fn new(
        dirs: WorkingDirectories,
        tracker: Arc<LifecycleTracker>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            dirs,
            tracker,
            config,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Run one sweep now. An overlapping trigger is collapsed into a
    /// no-op via the busy flag.
    pub fn sweep(&self) -> SweepReport {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sweep already in progress, skipping");
            return SweepReport {
                already_running: true,
                ..SweepReport::default()
            };
        }

        let mut report = SweepReport::default();
        self.age_sweep(&mut report);
        self.quota_sweep(&mut report);

        self.sweeping.store(false, Ordering::SeqCst);

        tracing::info!(
            examined = report.examined,
            expired = report.deleted_expired,
            quota = report.deleted_for_quota,
            skipped = report.skipped_in_use,
            bytes_freed = report.bytes_freed,
            "Sweep complete"
        );
        report
    }

    fn age_sweep(&self, report: &mut SweepReport) {
        let now = lifecycle::epoch_ms();
        let max_age_ms = self.config.max_age.as_millis() as i64;

        for candidate in self.collect_candidates() {
            report.examined += 1;
            let age = now - candidate.created_at;
            if age <= max_age_ms {
                continue;
            }
            if self.tracker.is_in_use(&candidate.path) {
                report.skipped_in_use += 1;
                tracing::debug!(path = %candidate.path.display(), "Expired file in use, skipped");
                continue;
            }
            if self.delete(&candidate) {
                report.deleted_expired += 1;
                report.bytes_freed += candidate.size;
                tracing::info!(
                    path = %candidate.path.display(),
                    age_ms = age,
                    "Expired file deleted"
                );
            }
        }
    }

    fn quota_sweep(&self, report: &mut SweepReport) {
        let mut candidates = self.collect_candidates();
        let mut total: u64 = candidates.iter().map(|c| c.size).sum();
        if total <= self.config.max_total_bytes {
            return;
        }

        tracing::warn!(
            total_bytes = total,
            limit = self.config.max_total_bytes,
            "Storage over quota, deleting least-recently-accessed files"
        );

        candidates.sort_by_key(|c| c.last_accessed);

        for candidate in candidates {
            if total <= self.config.max_total_bytes {
                break;
            }
            if self.tracker.is_in_use(&candidate.path) {
                report.skipped_in_use += 1;
                continue;
            }
            if self.delete(&candidate) {
                report.deleted_for_quota += 1;
                report.bytes_freed += candidate.size;
                total = total.saturating_sub(candidate.size);
            }
        }
    }

    /// All regular files directly inside the three directories, with
    /// timestamps from sidecars or the filesystem as fallback.
    fn collect_candidates(&self) -> Vec<CandidateFile> {
        let mut candidates = Vec::new();

        for (dir, _category) in self.dirs.all() {
            let entries = WalkDir::new(&dir)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| match e {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        tracing::warn!(dir = %dir.display(), error = %err, "Failed to read entry");
                        None
                    }
                })
                .filter(|e| e.file_type().is_file())
                .filter(|e| !lifecycle::is_sidecar(e.path()));

            for entry in entries {
                let path = entry.path().to_path_buf();
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to stat file");
                        continue;
                    }
                };

                let (created_at, last_accessed) = match lifecycle::load_sidecar(&path) {
                    Some(record) => (record.created_at, record.last_accessed),
                    None => {
                        let fallback = fs_time_ms(&metadata);
                        (fallback, 0)
                    }
                };

                candidates.push(CandidateFile {
                    path,
                    size: metadata.len(),
                    created_at,
                    last_accessed,
                });
            }
        }

        candidates
    }

    fn delete(&self, candidate: &CandidateFile) -> bool {
        match std::fs::remove_file(&candidate.path) {
            Ok(()) => {
                lifecycle::remove_sidecar(&candidate.path);
                true
            }
            Err(e) => {
                tracing::warn!(
                    path = %candidate.path.display(),
                    error = %e,
                    "Failed to delete file, continuing sweep"
                );
                false
            }
        }
    }
}

/// Creation time (or modification time where birth time is unavailable)
/// in epoch milliseconds.
fn fs_time_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Owns the scheduler thread. Dropping the handle shuts the loop down.
pub struct JanitorHandle {
    shutdown_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    pub fn shutdown(mut self) {
        self.signal_and_join();
    }

    fn signal_and_join(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Janitor thread panicked");
            }
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}

/// Start the recurring sweep: once immediately, then every interval
/// until shutdown.
pub fn spawn(janitor: Arc<Janitor>) -> JanitorHandle {
    let (shutdown_tx, shutdown_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
    let interval = janitor.config.interval;

    let thread = std::thread::Builder::new()
        .name("storage-janitor".to_string())
        .spawn(move || {
            tracing::info!(interval_secs = interval.as_secs(), "Janitor started");
            janitor.sweep();

            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        janitor.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::info!("Janitor stopped");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn janitor thread");

    JanitorHandle {
        shutdown_tx,
        thread: Some(thread),
    }
}
