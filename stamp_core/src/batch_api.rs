//! Pipeline facade
//!
//! Ties the subsystems together behind the operations a caller (the CLI
//! today) actually performs: upload-and-process a batch, stream an
//! archive out, inspect storage, reset directories, and run or schedule
//! janitor sweeps. All paths stay inside the configured working root.

use crate::app_error::{Result, StampError};
use crate::batch::{BatchOrchestrator, BatchSummary, RecordWriter};
use crate::janitor::{self, Janitor, JanitorConfig, JanitorHandle, SweepReport};
use crate::lifecycle::LifecycleTracker;
use crate::manifest::parse_manifest;
use crate::tag_writer::{TagWriter, TagWriterConfig};
use crate::worker_pool::WorkerPool;
use crate::working_dirs::{
    self, validate_directory, FileCategory, WorkingDirectories,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long a downloaded archive lingers before its scheduled deletion.
const DOWNLOAD_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root under which `images/`, `processed/` and `temp/` live.
    pub root: PathBuf,
    pub writer: TagWriterConfig,
    /// `None` runs record writes inline on the calling thread.
    pub workers: Option<usize>,
    pub download_grace: Duration,
}

impl PipelineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writer: TagWriterConfig::default(),
            workers: None,
            download_grace: DOWNLOAD_GRACE,
        }
    }
}

/// Metadata for serving a downloaded archive.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadInfo {
    pub file_name: String,
    pub content_type: String,
    pub content_disposition: String,
    pub bytes: u64,
}

/// Storage snapshot across the three working directories.
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub images_bytes: u64,
    pub processed_bytes: u64,
    pub temp_bytes: u64,
    pub total_bytes: u64,
    pub active_files: usize,
    pub image_count: usize,
}

/// Health check for an arbitrary directory.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryReport {
    pub is_valid: bool,
    pub total_files: usize,
    pub image_files: usize,
    pub error: Option<String>,
}

pub struct Pipeline {
    dirs: WorkingDirectories,
    tracker: Arc<LifecycleTracker>,
    writer: Arc<dyn RecordWriter>,
    pool: Option<Arc<WorkerPool>>,
    download_grace: Duration,
}

impl Pipeline {
    /// Resolve and create the working directories under the configured
    /// root.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let dirs = WorkingDirectories::resolve(&config.root);
        dirs.ensure_all()?;
        let tracker = Arc::new(LifecycleTracker::new(dirs.clone()));
        let pool = config.workers.map(|n| Arc::new(WorkerPool::new(n)));

        Ok(Self {
            dirs,
            tracker,
            writer: Arc::new(TagWriter::new(config.writer)),
            pool,
            download_grace: config.download_grace,
        })
    }

    /// Swap the record writer. Exists for callers that stub out the
    /// external tag tool.
    pub fn with_writer(mut self, writer: Arc<dyn RecordWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn dirs(&self) -> &WorkingDirectories {
        &self.dirs
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    /// Run one batch: parse the manifest, stage the images into the
    /// incoming directory, process every record, and archive the
    /// successes.
    ///
    /// Structural manifest errors abort before any image is staged.
    pub fn upload_batch(&self, csv_text: &str, images: &[PathBuf]) -> Result<BatchSummary> {
        let parse = parse_manifest(csv_text)?;
        let image_index = self.stage_images(images)?;

        tracing::info!(
            rows = parse.total_rows(),
            images = image_index.len(),
            "Starting batch"
        );

        let mut orchestrator = BatchOrchestrator::new(
            self.dirs.clone(),
            Arc::clone(&self.writer),
            Arc::clone(&self.tracker),
        );
        if let Some(pool) = &self.pool {
            orchestrator = orchestrator.with_pool(Arc::clone(pool));
        }
        Ok(orchestrator.run(&parse, &image_index))
    }

    /// Copy uploads into the incoming directory and index them by
    /// lower-cased filename. Each copy is bracketed with the tracker so
    /// a sweep cannot race the staging.
    fn stage_images(&self, images: &[PathBuf]) -> Result<HashMap<String, PathBuf>> {
        let mut index = HashMap::new();

        for source in images {
            if !source.is_file() {
                return Err(StampError::SourceNotFound {
                    path: source.clone(),
                });
            }
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| StampError::SourceNotFound {
                    path: source.clone(),
                })?;

            let staged = self.dirs.images_dir.join(name);
            self.tracker.register(&staged);
            let copied = std::fs::copy(source, &staged);
            self.tracker.unregister(&staged);
            copied?;

            index.insert(name.to_lowercase(), staged);
        }

        Ok(index)
    }

    /// Stream a named archive out of the temp directory.
    ///
    /// The archive stays registered for the duration of the copy, then
    /// its deletion is scheduled after a grace period so retries within
    /// the window still succeed.
    pub fn download_archive(&self, name: &str, sink: &mut dyn Write) -> Result<DownloadInfo> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(StampError::SourceNotFound {
                path: PathBuf::from(name),
            });
        }

        let archive_path = self.dirs.temp_dir.join(name);
        if !archive_path.is_file() {
            return Err(StampError::SourceNotFound { path: archive_path });
        }

        self.tracker.register(&archive_path);
        let streamed = (|| -> Result<u64> {
            let mut file = std::fs::File::open(&archive_path)?;
            Ok(std::io::copy(&mut file, sink)?)
        })();
        self.tracker.unregister(&archive_path);
        let bytes = streamed?;

        self.tracker
            .schedule_deletion(archive_path, self.download_grace);
        tracing::info!(archive = name, bytes, "Archive downloaded");

        Ok(DownloadInfo {
            file_name: name.to_string(),
            content_type: "application/zip".to_string(),
            content_disposition: format!("attachment; filename=\"{}\"", name),
            bytes,
        })
    }

    /// Clear the named categories (all three when empty) and drop any
    /// tracker state under them. Directories themselves stay in place.
    pub fn reset(&self, categories: &[FileCategory]) -> Result<()> {
        let categories = if categories.is_empty() {
            &FileCategory::ALL[..]
        } else {
            categories
        };

        self.dirs.reset(categories)?;
        let roots: Vec<PathBuf> = categories
            .iter()
            .map(|c| self.dirs.dir_for(*c).to_path_buf())
            .collect();
        self.tracker.forget_under(&roots);

        tracing::info!(?categories, "Working directories reset");
        Ok(())
    }

    pub fn stats(&self) -> StorageReport {
        let tracker_stats = self.tracker.stats();
        let image_count = working_dirs::image_file_count(&self.dirs.images_dir).unwrap_or(0);

        StorageReport {
            images_bytes: tracker_stats.images_bytes,
            processed_bytes: tracker_stats.processed_bytes,
            temp_bytes: tracker_stats.temp_bytes,
            total_bytes: tracker_stats.total_bytes(),
            active_files: tracker_stats.active_files,
            image_count,
        }
    }

    /// Run one janitor sweep now with the given policy.
    pub fn sweep(&self, config: JanitorConfig) -> SweepReport {
        Janitor::new(self.dirs.clone(), Arc::clone(&self.tracker), config).sweep()
    }

    /// Start the background janitor. The handle stops it on drop.
    pub fn start_janitor(&self, config: JanitorConfig) -> JanitorHandle {
        let janitor = Arc::new(Janitor::new(
            self.dirs.clone(),
            Arc::clone(&self.tracker),
            config,
        ));
        janitor::spawn(janitor)
    }
}

/// Inspect an arbitrary directory: existence, readability, file and
/// image counts. Never returns an error; problems land in the report.
pub fn directory_stats(path: &Path) -> DirectoryReport {
    if let Err(e) = validate_directory(path) {
        return DirectoryReport {
            is_valid: false,
            total_files: 0,
            image_files: 0,
            error: Some(e.user_message()),
        };
    }

    let mut total_files = 0;
    let mut image_files = 0;
    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if entry_path.is_file() {
                    total_files += 1;
                    if working_dirs::is_image_file(&entry_path) {
                        image_files += 1;
                    }
                }
            }
        }
        Err(e) => {
            return DirectoryReport {
                is_valid: false,
                total_files: 0,
                image_files: 0,
                error: Some(e.to_string()),
            };
        }
    }

    DirectoryReport {
        is_valid: true,
        total_files,
        image_files,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestRecord;
    use std::fs;
    use tempfile::TempDir;

    struct CopyWriter;

    impl RecordWriter for CopyWriter {
        fn write_record(
            &self,
            image_path: &Path,
            processed_path: &Path,
            _record: &ManifestRecord,
        ) -> Result<()> {
            fs::copy(image_path, processed_path)?;
            Ok(())
        }
    }

    fn pipeline(temp: &TempDir) -> Pipeline {
        Pipeline::new(PipelineConfig::new(temp.path().join("work")))
            .unwrap()
            .with_writer(Arc::new(CopyWriter))
    }

    fn plant_upload(temp: &TempDir, name: &str) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, format!("image:{}", name)).unwrap();
        path
    }

    #[test]
    fn test_upload_batch_end_to_end() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        let upload = plant_upload(&temp, "test.jpg");

        let csv = "FileName,Title,Description,Keywords\n\
                   test.jpg,Test Title,Test Description,keyword1,keyword2,keyword3";
        let summary = pipeline.upload_batch(csv, &[upload]).unwrap();

        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert!(pipeline.dirs().images_dir.join("test.jpg").exists());
        assert!(pipeline.dirs().processed_dir.join("test.jpg").exists());

        let archive = summary.archive_path.unwrap();
        assert!(archive.starts_with(&pipeline.dirs().temp_dir));
        assert!(archive.exists());
    }

    #[test]
    fn test_structural_manifest_error_stages_nothing() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        let upload = plant_upload(&temp, "test.jpg");

        let result = pipeline.upload_batch("Wrong,Headers\nx,y", &[upload]);
        assert!(matches!(result, Err(StampError::HeaderMismatch { .. })));
        assert!(!pipeline.dirs().images_dir.join("test.jpg").exists());
    }

    #[test]
    fn test_missing_upload_source_aborts() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);

        let result = pipeline.upload_batch(
            "FileName,Title,Description,Keywords\na.jpg,T,D,k",
            &[temp.path().join("ghost.jpg")],
        );
        assert!(matches!(result, Err(StampError::SourceNotFound { .. })));
    }

    #[test]
    fn test_download_streams_archive_bytes() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        let name = "processed_images_test.zip";
        fs::write(pipeline.dirs().temp_dir.join(name), b"zip-bytes").unwrap();

        let mut sink = Vec::new();
        let info = pipeline.download_archive(name, &mut sink).unwrap();

        assert_eq!(sink, b"zip-bytes");
        assert_eq!(info.bytes, 9);
        assert_eq!(info.content_type, "application/zip");
        assert!(info.content_disposition.contains(name));
    }

    #[test]
    fn test_download_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);

        let mut sink = Vec::new();
        for name in ["../escape.zip", "a/b.zip", "..\\evil.zip"] {
            let result = pipeline.download_archive(name, &mut sink);
            assert!(matches!(result, Err(StampError::SourceNotFound { .. })));
        }
    }

    #[test]
    fn test_download_schedules_deletion_after_grace() {
        let temp = TempDir::new().unwrap();
        let mut config = PipelineConfig::new(temp.path().join("work"));
        config.download_grace = Duration::from_millis(50);
        let pipeline = Pipeline::new(config)
            .unwrap()
            .with_writer(Arc::new(CopyWriter));

        let name = "processed_images_test.zip";
        let archive_path = pipeline.dirs().temp_dir.join(name);
        fs::write(&archive_path, b"zip").unwrap();

        let mut sink = Vec::new();
        pipeline.download_archive(name, &mut sink).unwrap();
        assert!(archive_path.exists());

        std::thread::sleep(Duration::from_millis(300));
        assert!(!archive_path.exists());
    }

    #[test]
    fn test_reset_clears_files_and_tracker() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        let staged = pipeline.dirs().images_dir.join("a.jpg");
        fs::write(&staged, b"x").unwrap();
        pipeline.tracker().register(&staged);

        pipeline.reset(&[]).unwrap();

        assert!(pipeline.dirs().images_dir.exists());
        assert!(!staged.exists());
        assert_eq!(pipeline.tracker().active_count(), 0);
    }

    #[test]
    fn test_reset_single_category_spares_others() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        fs::write(pipeline.dirs().images_dir.join("a.jpg"), b"x").unwrap();
        fs::write(pipeline.dirs().processed_dir.join("b.jpg"), b"y").unwrap();

        pipeline.reset(&[FileCategory::Processed]).unwrap();

        assert!(pipeline.dirs().images_dir.join("a.jpg").exists());
        assert!(!pipeline.dirs().processed_dir.join("b.jpg").exists());
    }

    #[test]
    fn test_stats_reflect_directory_contents() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        fs::write(pipeline.dirs().images_dir.join("a.jpg"), vec![0u8; 100]).unwrap();
        fs::write(pipeline.dirs().images_dir.join("notes.txt"), vec![0u8; 10]).unwrap();
        fs::write(pipeline.dirs().temp_dir.join("t.zip"), vec![0u8; 50]).unwrap();

        let report = pipeline.stats();
        assert_eq!(report.images_bytes, 110);
        assert_eq!(report.temp_bytes, 50);
        assert_eq!(report.total_bytes, 160);
        assert_eq!(report.image_count, 1);
    }

    #[test]
    fn test_sweep_runs_with_custom_policy() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp);
        fs::write(pipeline.dirs().temp_dir.join("t.zip"), vec![0u8; 100]).unwrap();

        // Quota of zero forces the quota sweep to take everything
        let report = pipeline.sweep(JanitorConfig {
            interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            max_total_bytes: 0,
        });
        assert_eq!(report.deleted_for_quota, 1);
        assert!(!pipeline.dirs().temp_dir.join("t.zip").exists());
    }

    #[test]
    fn test_directory_stats_counts_images() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.jpg"), b"x").unwrap();
        fs::write(temp.path().join("b.png"), b"y").unwrap();
        fs::write(temp.path().join("c.txt"), b"z").unwrap();

        let report = directory_stats(temp.path());
        assert!(report.is_valid);
        assert_eq!(report.total_files, 3);
        assert_eq!(report.image_files, 2);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_directory_stats_on_missing_path() {
        let report = directory_stats(Path::new("/nonexistent/metastamp-test"));
        assert!(!report.is_valid);
        assert_eq!(report.total_files, 0);
        assert!(report.error.is_some());
    }
}
