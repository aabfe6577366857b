//! Core library for the Metastamp batch metadata pipeline
//!
//! This crate provides everything the CLI (and any other caller) needs to
//! bulk-apply textual metadata from a CSV manifest to a batch of images:
//! - Working-directory management (incoming / processed / temp)
//! - CSV manifest parsing and per-row validation
//! - Tag writing through exiftool (IPTC + XMP-dc + IFD0, UTF-8 forced)
//! - Batch orchestration with per-record outcome tracking
//! - Zip archive packaging of processed images
//! - File lifecycle tracking (refcounts + sidecar records)
//! - Background storage janitor (age + quota sweeps)
//! - AI-assisted tag suggestion via a vision model

pub mod app_error;
pub mod archive;
pub mod assist;
pub mod batch;
pub mod batch_api;
pub mod janitor;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod tag_writer;
pub mod worker_pool;
pub mod working_dirs;

pub use app_error::{ErrorCategory, Result, StampError};
pub use archive::build_archive;
pub use assist::{SuggestedTags, TagAssistClient};
pub use batch::{BatchOrchestrator, BatchSummary, OutcomeStatus, ProcessOutcome, RecordWriter};
pub use batch_api::{directory_stats, DirectoryReport, DownloadInfo, Pipeline, PipelineConfig, StorageReport};
pub use janitor::{Janitor, JanitorConfig, JanitorHandle, SweepReport};
pub use lifecycle::{LifecycleTracker, SidecarRecord, TrackerStats};
pub use logging::{init_logging, LogConfig};
pub use manifest::{parse_manifest, ManifestParse, ManifestRecord, RejectedRow, ValidRow};
pub use tag_writer::{exiftool_available, TagWriter, TagWriterConfig};
pub use worker_pool::{default_worker_count, WorkerPool};
pub use working_dirs::{validate_directory, FileCategory, WorkingDirectories, IMAGE_EXTENSIONS};
