//! Batch orchestration
//!
//! Walks the validated manifest, matches each record to an uploaded
//! image by case-insensitive filename, delegates to the record writer,
//! and accumulates per-record outcomes. One bad record never aborts the
//! batch. Outcomes are reported in manifest order even when writes are
//! dispatched through the worker pool, and a per-filename lock keeps
//! two writes to the same name from ever overlapping.

use crate::app_error::{Result, StampError};
use crate::archive;
use crate::lifecycle::LifecycleTracker;
use crate::manifest::{ManifestParse, ManifestRecord};
use crate::tag_writer::TagWriter;
use crate::worker_pool::WorkerPool;
use crate::working_dirs::WorkingDirectories;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

/// Result for one manifest record.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub filename: String,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
}

/// Aggregate result of one batch, returned to the caller.
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub archive_path: Option<PathBuf>,
    /// Per-record outcomes in manifest order.
    pub outcomes: Vec<ProcessOutcome>,
    /// Human-readable failure lines in manifest order.
    pub failures: Vec<String>,
}

impl BatchSummary {
    fn push(&mut self, outcome: ProcessOutcome) {
        self.total += 1;
        match outcome.status {
            OutcomeStatus::Succeeded => self.succeeded += 1,
            OutcomeStatus::Failed => {
                self.failed += 1;
                if let Some(detail) = &outcome.detail {
                    self.failures.push(detail.clone());
                }
            }
        }
        self.outcomes.push(outcome);
    }

    /// Filenames of successfully processed records, in manifest order.
    pub fn succeeded_filenames(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Succeeded)
            .map(|o| o.filename.clone())
            .collect()
    }
}

/// Seam between the orchestrator and the tag-writing machinery.
pub trait RecordWriter: Send + Sync {
    fn write_record(
        &self,
        image_path: &Path,
        processed_path: &Path,
        record: &ManifestRecord,
    ) -> Result<()>;
}

impl RecordWriter for TagWriter {
    fn write_record(
        &self,
        image_path: &Path,
        processed_path: &Path,
        record: &ManifestRecord,
    ) -> Result<()> {
        self.write(image_path, processed_path, record)
    }
}

pub struct BatchOrchestrator {
    dirs: WorkingDirectories,
    writer: Arc<dyn RecordWriter>,
    tracker: Arc<LifecycleTracker>,
    pool: Option<Arc<WorkerPool>>,
    write_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl BatchOrchestrator {
    pub fn new(
        dirs: WorkingDirectories,
        writer: Arc<dyn RecordWriter>,
        tracker: Arc<LifecycleTracker>,
    ) -> Self {
        Self {
            dirs,
            writer,
            tracker,
            pool: None,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Dispatch record writes through a worker pool instead of running
    /// them inline.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Process one parsed manifest against the uploaded-image index
    /// (lower-cased filename → path in the images directory).
    ///
    /// Rejected rows count as failures. When at least one record
    /// succeeds the batch archive is built; an archive failure
    /// downgrades to a summary without an archive path (the writes
    /// already happened).
    pub fn run(
        &self,
        parse: &ManifestParse,
        image_index: &HashMap<String, PathBuf>,
    ) -> BatchSummary {
        let mut slots: Vec<(usize, ProcessOutcome)> = Vec::with_capacity(parse.total_rows());

        for rejected in &parse.rejected {
            slots.push((
                rejected.row,
                ProcessOutcome {
                    filename: String::new(),
                    status: OutcomeStatus::Failed,
                    detail: Some(rejected.detail()),
                },
            ));
        }

        let (matched, unmatched) = self.match_records(parse, image_index);
        for (row, outcome) in unmatched {
            slots.push((row, outcome));
        }

        let written = match &self.pool {
            Some(pool) => self.write_pooled(pool, matched),
            None => self.write_sequential(matched),
        };
        slots.extend(written);

        slots.sort_by_key(|(row, _)| *row);

        let mut summary = BatchSummary::default();
        for (_, outcome) in slots {
            summary.push(outcome);
        }

        if summary.succeeded > 0 {
            match archive::build_archive(&self.dirs, &summary.succeeded_filenames(), &self.tracker)
            {
                Ok(path) => summary.archive_path = Some(path),
                Err(e) => {
                    tracing::error!(error = %e, "Batch archive failed, summary kept");
                    summary.failures.push(e.user_message());
                }
            }
        }

        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch complete"
        );
        summary
    }

    /// Split valid rows into matched write jobs and immediate failures.
    #[allow(clippy::type_complexity)]
    fn match_records(
        &self,
        parse: &ManifestParse,
        image_index: &HashMap<String, PathBuf>,
    ) -> (
        Vec<(usize, ManifestRecord, PathBuf)>,
        Vec<(usize, ProcessOutcome)>,
    ) {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();

        for valid in &parse.records {
            let lower = valid.record.filename.trim().to_lowercase();
            match image_index.get(&lower) {
                Some(image_path) => {
                    matched.push((valid.row, valid.record.clone(), image_path.clone()));
                }
                None => {
                    let mut available: Vec<String> = image_index.keys().cloned().collect();
                    available.sort();
                    let error = StampError::ImageNotFound {
                        filename: valid.record.filename.clone(),
                        available,
                    };
                    tracing::warn!(row = valid.row, file = %valid.record.filename, "No uploaded image matches record");
                    unmatched.push((
                        valid.row,
                        ProcessOutcome {
                            filename: valid.record.filename.clone(),
                            status: OutcomeStatus::Failed,
                            detail: Some(error.to_string()),
                        },
                    ));
                }
            }
        }

        (matched, unmatched)
    }

    fn write_sequential(
        &self,
        jobs: Vec<(usize, ManifestRecord, PathBuf)>,
    ) -> Vec<(usize, ProcessOutcome)> {
        jobs.into_iter()
            .map(|(row, record, image_path)| {
                let outcome = write_one(
                    &self.dirs,
                    &self.writer,
                    &self.tracker,
                    &self.write_locks,
                    &record,
                    &image_path,
                );
                (row, outcome)
            })
            .collect()
    }

    fn write_pooled(
        &self,
        pool: &Arc<WorkerPool>,
        jobs: Vec<(usize, ManifestRecord, PathBuf)>,
    ) -> Vec<(usize, ProcessOutcome)> {
        let (tx, rx) = mpsc::channel();
        let job_count = jobs.len();

        for (row, record, image_path) in jobs {
            let tx = tx.clone();
            let dirs = self.dirs.clone();
            let writer = Arc::clone(&self.writer);
            let tracker = Arc::clone(&self.tracker);
            let locks = Arc::clone(&self.write_locks);

            pool.submit(move || {
                let outcome = write_one(&dirs, &writer, &tracker, &locks, &record, &image_path);
                // Receiver only goes away if the orchestrator bailed
                let _ = tx.send((row, outcome));
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(job_count);
        while let Ok(entry) = rx.recv() {
            results.push(entry);
        }
        results
    }
}

/// Write one record under its per-filename lock, bracketing the
/// processed path with register/unregister so the janitor cannot take
/// the file mid-write.
fn write_one(
    dirs: &WorkingDirectories,
    writer: &Arc<dyn RecordWriter>,
    tracker: &Arc<LifecycleTracker>,
    locks: &Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    record: &ManifestRecord,
    image_path: &Path,
) -> ProcessOutcome {
    let lock = lock_for(locks, &record.filename.trim().to_lowercase());
    let _guard = match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let processed_path = dirs.processed_dir.join(record.filename.trim());
    tracker.register(&processed_path);
    let result = writer.write_record(image_path, &processed_path, record);
    tracker.unregister(&processed_path);

    match result {
        Ok(()) => ProcessOutcome {
            filename: record.filename.clone(),
            status: OutcomeStatus::Succeeded,
            detail: None,
        },
        Err(e) => ProcessOutcome {
            filename: record.filename.clone(),
            status: OutcomeStatus::Failed,
            detail: Some(format!("Error processing {}: {}", record.filename, e)),
        },
    }
}

fn lock_for(
    locks: &Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    name: &str,
) -> Arc<Mutex<()>> {
    let mut map = match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    Arc::clone(map.entry(name.to_string()).or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Copies the image like the real writer but skips exiftool, so the
    /// orchestrator can be exercised without the external tool.
    struct MockWriter {
        fail_on: HashSet<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockWriter {
        fn new() -> Self {
            Self {
                fail_on: HashSet::new(),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn failing_on(names: &[&str]) -> Self {
            let mut writer = Self::new();
            writer.fail_on = names.iter().map(|n| n.to_string()).collect();
            writer
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl RecordWriter for MockWriter {
        fn write_record(
            &self,
            image_path: &Path,
            processed_path: &Path,
            record: &ManifestRecord,
        ) -> Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }

            let result = if self.fail_on.contains(&record.filename) {
                Err(StampError::TagWriteFailed {
                    path: processed_path.to_path_buf(),
                    detail: "mock failure".to_string(),
                    exit_code: Some(1),
                })
            } else {
                fs::copy(image_path, processed_path)?;
                Ok(())
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Fixture {
        _temp: TempDir,
        dirs: WorkingDirectories,
        tracker: Arc<LifecycleTracker>,
        image_index: HashMap<String, PathBuf>,
    }

    fn fixture(image_names: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let dirs = WorkingDirectories::resolve(temp.path());
        dirs.ensure_all().unwrap();
        let tracker = Arc::new(LifecycleTracker::new(dirs.clone()));

        let mut image_index = HashMap::new();
        for name in image_names {
            let path = dirs.images_dir.join(name);
            fs::write(&path, format!("image:{}", name)).unwrap();
            image_index.insert(name.to_lowercase(), path);
        }

        Fixture {
            _temp: temp,
            dirs,
            tracker,
            image_index,
        }
    }

    fn orchestrator(fixture: &Fixture, writer: Arc<dyn RecordWriter>) -> BatchOrchestrator {
        BatchOrchestrator::new(
            fixture.dirs.clone(),
            writer,
            Arc::clone(&fixture.tracker),
        )
    }

    #[test]
    fn test_scenario_single_record_batch() {
        let fixture = fixture(&["test.jpg"]);
        let csv = "FileName,Title,Description,Keywords\n\
                   test.jpg,Test Title,Test Description,keyword1,keyword2,keyword3";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.archive_path.is_some());
        assert!(fixture.dirs.processed_dir.join("test.jpg").exists());
    }

    #[test]
    fn test_counts_add_up_with_mixed_outcomes() {
        let fixture = fixture(&["a.jpg", "b.jpg"]);
        let csv = "FileName,Title,Description,Keywords\n\
                   a.jpg,T,D,k1\n\
                   missing.jpg,T,D,k1\n\
                   b.jpg,T,D,k1\n\
                   ,T,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded + summary.failed, summary.total);
        assert_eq!(summary.failures.len(), 2);
    }

    #[test]
    fn test_missing_image_identifies_filename_and_spares_others() {
        let fixture = fixture(&["real.jpg"]);
        let csv = "FileName,Title,Description,Keywords\n\
                   ghost.jpg,T,D,k1\n\
                   real.jpg,T,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let failed = &summary.outcomes[0];
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert!(failed.detail.as_ref().unwrap().contains("ghost.jpg"));
        assert!(failed.detail.as_ref().unwrap().contains("real.jpg"));
        assert_eq!(summary.outcomes[1].status, OutcomeStatus::Succeeded);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let fixture = fixture(&["photo.jpg"]);
        let csv = "FileName,Title,Description,Keywords\nPHOTO.JPG,T,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn test_write_failure_isolated_to_its_record() {
        let fixture = fixture(&["good.jpg", "bad.jpg"]);
        let csv = "FileName,Title,Description,Keywords\n\
                   bad.jpg,T,D,k1\n\
                   good.jpg,T,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::failing_on(&["bad.jpg"])));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].contains("bad.jpg"));
        assert!(summary.archive_path.is_some());
    }

    #[test]
    fn test_no_archive_when_nothing_succeeds() {
        let fixture = fixture(&[]);
        let csv = "FileName,Title,Description,Keywords\nghost.jpg,T,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.succeeded, 0);
        assert!(summary.archive_path.is_none());
    }

    #[test]
    fn test_outcomes_in_manifest_order_with_pool() {
        let names: Vec<String> = (0..8).map(|i| format!("img{}.jpg", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let fixture = fixture(&name_refs);

        let mut csv = String::from("FileName,Title,Description,Keywords\n");
        for name in &names {
            csv.push_str(&format!("{},T,D,k1\n", name));
        }
        let parse = parse_manifest(&csv).unwrap();

        let writer = Arc::new(MockWriter::new().with_delay(Duration::from_millis(10)));
        let pool = Arc::new(WorkerPool::new(4));
        let orch = orchestrator(&fixture, writer).with_pool(pool);
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.succeeded, 8);
        let reported: Vec<&str> = summary
            .outcomes
            .iter()
            .map(|o| o.filename.as_str())
            .collect();
        assert_eq!(reported, name_refs);
    }

    #[test]
    fn test_same_filename_writes_never_overlap() {
        let fixture = fixture(&["dup.jpg"]);
        let csv = "FileName,Title,Description,Keywords\n\
                   dup.jpg,First,D,k1\n\
                   dup.jpg,Second,D,k1\n\
                   dup.jpg,Third,D,k1";
        let parse = parse_manifest(csv).unwrap();

        let writer = Arc::new(MockWriter::new().with_delay(Duration::from_millis(20)));
        let pool = Arc::new(WorkerPool::new(4));
        let orch = orchestrator(&fixture, Arc::clone(&writer) as Arc<dyn RecordWriter>)
            .with_pool(pool);
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.succeeded, 3);
        // The per-filename lock serializes same-name writes
        assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejected_rows_surface_in_failures() {
        let fixture = fixture(&["a.jpg"]);
        let title_101 = "x".repeat(101);
        let csv = format!(
            "FileName,Title,Description,Keywords\nbad.jpg,{},D,k1\na.jpg,T,D,k1",
            title_101
        );
        let parse = parse_manifest(&csv).unwrap();

        let orch = orchestrator(&fixture, Arc::new(MockWriter::new()));
        let summary = orch.run(&parse, &fixture.image_index);

        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].starts_with("Row 1:"));
        assert!(summary.failures[0].contains("maximum length of 100"));
    }
}
