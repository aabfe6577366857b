//! Archive packaging
//!
//! Bundles the successfully processed images of one batch into a single
//! zip in the temp directory, under one top-level `processed_images/`
//! folder. The archive is registered with the lifecycle tracker for the
//! duration of creation so a sweep cannot take it mid-write.

use crate::app_error::{Result, StampError};
use crate::lifecycle::LifecycleTracker;
use crate::working_dirs::WorkingDirectories;
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const ARCHIVE_FOLDER: &str = "processed_images";

/// Timestamp-derived archive name, unique per invocation.
fn archive_file_name() -> String {
    let stamp = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}_{}.zip", ARCHIVE_FOLDER, stamp)
}

/// Build the batch archive from named files in the processed directory.
///
/// Returns the archive path in the temp directory. Any I/O or zip error
/// maps to [`StampError::ArchiveCreationFailed`]; a partial archive is
/// removed.
pub fn build_archive(
    dirs: &WorkingDirectories,
    filenames: &[String],
    tracker: &Arc<LifecycleTracker>,
) -> Result<PathBuf> {
    let archive_path = dirs.temp_dir.join(archive_file_name());

    tracker.register(&archive_path);
    let result = write_archive(dirs, filenames, &archive_path);
    tracker.unregister(&archive_path);

    if let Err(e) = &result {
        tracing::error!(archive = %archive_path.display(), error = %e, "Archive creation failed");
        if archive_path.exists() {
            if let Err(cleanup) = std::fs::remove_file(&archive_path) {
                tracing::warn!(
                    archive = %archive_path.display(),
                    error = %cleanup,
                    "Failed to remove partial archive"
                );
            }
        }
    }
    result?;

    tracing::info!(
        archive = %archive_path.display(),
        files = filenames.len(),
        "Archive created"
    );
    Ok(archive_path)
}

fn write_archive(
    dirs: &WorkingDirectories,
    filenames: &[String],
    archive_path: &PathBuf,
) -> Result<()> {
    let failed = |detail: String| StampError::ArchiveCreationFailed { detail };

    let file = std::fs::File::create(archive_path)
        .map_err(|e| failed(format!("cannot create {}: {}", archive_path.display(), e)))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for filename in filenames {
        let source = dirs.processed_dir.join(filename);
        let content = std::fs::read(&source)
            .map_err(|e| failed(format!("cannot read {}: {}", source.display(), e)))?;

        writer
            .start_file(format!("{}/{}", ARCHIVE_FOLDER, filename), options)
            .map_err(|e| failed(format!("cannot add {}: {}", filename, e)))?;
        writer
            .write_all(&content)
            .map_err(|e| failed(format!("cannot write {}: {}", filename, e)))?;
    }

    writer
        .finish()
        .map_err(|e| failed(format!("cannot finalize archive: {}", e)))?;
    Ok(())
}
