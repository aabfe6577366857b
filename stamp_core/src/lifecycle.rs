//! File lifecycle tracking
//!
//! Every file placed in a working directory gets a reference count in
//! memory and a small JSON sidecar (`<path>.meta`) on disk. The refcount
//! is the single synchronization point between the handlers and the
//! janitor: a file with refcount > 0 is never swept, no matter how old.
//! Sidecars carry created/last-accessed timestamps (epoch milliseconds)
//! so age-based cleanup survives process restarts.

use crate::working_dirs::{FileCategory, WorkingDirectories, SIDECAR_EXTENSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// On-disk sidecar record, one per tracked file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarRecord {
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "lastAccessed")]
    pub last_accessed: i64,
    #[serde(rename = "type")]
    pub category: FileCategory,
}

/// In-memory state for one file currently referenced by a handler.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub created_at: i64,
    pub last_accessed: i64,
    pub category: FileCategory,
    pub ref_count: u32,
}

/// Storage usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub images_bytes: u64,
    pub processed_bytes: u64,
    pub temp_bytes: u64,
    pub active_files: usize,
}

impl TrackerStats {
    pub fn total_bytes(&self) -> u64 {
        self.images_bytes + self.processed_bytes + self.temp_bytes
    }
}

/// Tracks per-file reference counts and sidecar records.
///
/// Sole writer of `TrackedFile` state; other components only call
/// `register`/`unregister` around their critical sections.
pub struct LifecycleTracker {
    dirs: WorkingDirectories,
    files: Mutex<HashMap<PathBuf, TrackedFile>>,
}

impl LifecycleTracker {
    pub fn new(dirs: WorkingDirectories) -> Self {
        Self {
            dirs,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a file as in use: refcount + 1, fresh sidecar timestamps.
    pub fn register(&self, path: &Path) {
        let now = epoch_ms();
        let category = self.dirs.category_of(path).unwrap_or(FileCategory::Temp);

        let mut files = self.lock();
        let entry = files
            .entry(path.to_path_buf())
            .or_insert_with(|| TrackedFile {
                path: path.to_path_buf(),
                created_at: now,
                last_accessed: now,
                category,
                ref_count: 0,
            });
        entry.ref_count += 1;
        entry.last_accessed = now;
        let record = SidecarRecord {
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            category: entry.category,
        };
        drop(files);

        write_sidecar(path, &record);
        tracing::debug!(path = %path.display(), "File registered");
    }

    /// Release one reference. At zero the in-memory entry is dropped but
    /// the sidecar stays, with a refreshed last-accessed timestamp, so
    /// the janitor can still score the file by age.
    pub fn unregister(&self, path: &Path) {
        let mut files = self.lock();
        let Some(entry) = files.get_mut(path) else {
            return;
        };
        if entry.ref_count <= 1 {
            files.remove(path);
        } else {
            entry.ref_count -= 1;
        }
        drop(files);

        if let Some(mut record) = load_sidecar(path) {
            record.last_accessed = epoch_ms();
            write_sidecar(path, &record);
        }
        tracing::debug!(path = %path.display(), "File unregistered");
    }

    /// Whether any handler currently holds a reference.
    pub fn is_in_use(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    /// Files with at least one live reference.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Bytes per category plus the active file count.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            images_bytes: self.dirs.dir_size(FileCategory::Image),
            processed_bytes: self.dirs.dir_size(FileCategory::Processed),
            temp_bytes: self.dirs.dir_size(FileCategory::Temp),
            active_files: self.active_count(),
        }
    }

    /// Drop in-memory entries for files under the given directories.
    /// Used by reset, which deletes the files themselves.
    pub fn forget_under(&self, roots: &[PathBuf]) {
        let mut files = self.lock();
        files.retain(|path, _| !roots.iter().any(|root| path.starts_with(root)));
    }

    /// Delete `path` (and its sidecar) after `delay`, unless the file has
    /// been re-registered in the meantime. Lets a download finish before
    /// its archive disappears.
    pub fn schedule_deletion(self: &Arc<Self>, path: PathBuf, delay: Duration) {
        let tracker = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if tracker.is_in_use(&path) {
                tracing::debug!(path = %path.display(), "Scheduled deletion skipped, file re-registered");
                return;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    remove_sidecar(&path);
                    tracing::info!(path = %path.display(), "Scheduled deletion completed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Scheduled deletion failed");
                }
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackedFile>> {
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Lifecycle tracker lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Current time in epoch milliseconds, the unit sidecars store.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Path of the sidecar record for a tracked file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(SIDECAR_EXTENSION);
    PathBuf::from(os)
}

/// Whether a path is itself a sidecar record.
pub fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .map(|e| e == SIDECAR_EXTENSION)
        .unwrap_or(false)
}

pub fn load_sidecar(path: &Path) -> Option<SidecarRecord> {
    let content = std::fs::read_to_string(sidecar_path(path)).ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt sidecar record ignored");
            None
        }
    }
}

fn write_sidecar(path: &Path, record: &SidecarRecord) {
    let json = match serde_json::to_string(record) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to serialize sidecar");
            return;
        }
    };
    if let Err(e) = std::fs::write(sidecar_path(path), json) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write sidecar");
    }
}

pub fn remove_sidecar(path: &Path) {
    let meta = sidecar_path(path);
    if let Err(e) = std::fs::remove_file(&meta) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %meta.display(), error = %e, "Failed to remove sidecar");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tracker_fixture() -> (TempDir, Arc<LifecycleTracker>) {
        let temp = TempDir::new().unwrap();
        let dirs = WorkingDirectories::resolve(temp.path());
        dirs.ensure_all().unwrap();
        let tracker = Arc::new(LifecycleTracker::new(dirs));
        (temp, tracker)
    }

    #[test]
    fn test_register_creates_sidecar() {
        let (temp, tracker) = tracker_fixture();
        let path = temp.path().join("images/a.jpg");
        fs::write(&path, b"img").unwrap();

        tracker.register(&path);

        assert!(tracker.is_in_use(&path));
        let record = load_sidecar(&path).unwrap();
        assert_eq!(record.category, FileCategory::Image);
        assert!(record.created_at > 0);
        assert_eq!(record.created_at, record.last_accessed);
    }

    #[test]
    fn test_refcount_nesting() {
        let (temp, tracker) = tracker_fixture();
        let path = temp.path().join("temp/batch.zip");
        fs::write(&path, b"zip").unwrap();

        tracker.register(&path);
        tracker.register(&path);
        tracker.unregister(&path);
        assert!(tracker.is_in_use(&path));

        tracker.unregister(&path);
        assert!(!tracker.is_in_use(&path));
        // Sidecar survives for age scoring
        assert!(sidecar_path(&path).exists());
    }

    #[test]
    fn test_unregister_unknown_path_is_noop() {
        let (temp, tracker) = tracker_fixture();
        tracker.unregister(&temp.path().join("images/never-seen.jpg"));
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_unregister_refreshes_last_accessed() {
        let (temp, tracker) = tracker_fixture();
        let path = temp.path().join("processed/a.jpg");
        fs::write(&path, b"img").unwrap();

        tracker.register(&path);
        let before = load_sidecar(&path).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        tracker.unregister(&path);
        let after = load_sidecar(&path).unwrap();

        assert!(after.last_accessed > before.last_accessed);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn test_stats_report_per_category_bytes() {
        let (temp, tracker) = tracker_fixture();
        fs::write(temp.path().join("images/a.jpg"), vec![0u8; 100]).unwrap();
        fs::write(temp.path().join("processed/b.jpg"), vec![0u8; 40]).unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.images_bytes, 100);
        assert_eq!(stats.processed_bytes, 40);
        assert_eq!(stats.temp_bytes, 0);
        assert_eq!(stats.total_bytes(), 140);
        assert_eq!(stats.active_files, 0);
    }

    #[test]
    fn test_sidecar_json_shape() {
        let record = SidecarRecord {
            created_at: 1700000000000,
            last_accessed: 1700000001000,
            category: FileCategory::Processed,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"createdAt\":1700000000000"));
        assert!(json.contains("\"lastAccessed\":1700000001000"));
        assert!(json.contains("\"type\":\"processed\""));
    }

    #[test]
    fn test_corrupt_sidecar_ignored() {
        let (temp, _tracker) = tracker_fixture();
        let path = temp.path().join("temp/x.zip");
        fs::write(&path, b"zip").unwrap();
        fs::write(sidecar_path(&path), b"{not json").unwrap();

        assert!(load_sidecar(&path).is_none());
    }

    #[test]
    fn test_scheduled_deletion_removes_idle_file() {
        let (temp, tracker) = tracker_fixture();
        let path = temp.path().join("temp/old.zip");
        fs::write(&path, b"zip").unwrap();
        tracker.register(&path);
        tracker.unregister(&path);

        tracker.schedule_deletion(path.clone(), Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(200));

        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
    }

    #[test]
    fn test_scheduled_deletion_skips_re_registered_file() {
        let (temp, tracker) = tracker_fixture();
        let path = temp.path().join("temp/busy.zip");
        fs::write(&path, b"zip").unwrap();

        tracker.schedule_deletion(path.clone(), Duration::from_millis(30));
        tracker.register(&path);
        std::thread::sleep(Duration::from_millis(200));

        assert!(path.exists());
        tracker.unregister(&path);
    }

    #[test]
    fn test_forget_under_clears_tracked_entries() {
        let (temp, tracker) = tracker_fixture();
        let imaged = temp.path().join("images/a.jpg");
        let zipped = temp.path().join("temp/b.zip");
        fs::write(&imaged, b"1").unwrap();
        fs::write(&zipped, b"2").unwrap();
        tracker.register(&imaged);
        tracker.register(&zipped);

        tracker.forget_under(&[temp.path().join("images")]);

        assert!(!tracker.is_in_use(&imaged));
        assert!(tracker.is_in_use(&zipped));
    }

    #[test]
    fn test_is_sidecar() {
        assert!(is_sidecar(Path::new("/work/images/a.jpg.meta")));
        assert!(!is_sidecar(Path::new("/work/images/a.jpg")));
    }
}
