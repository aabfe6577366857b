//! Working directory management
//!
//! The pipeline owns three directories under one root: incoming images,
//! processed images, and temporary archives. Every component receives an
//! explicit `WorkingDirectories` at construction instead of re-deriving
//! paths from process state.

use crate::app_error::{Result, StampError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Image extensions counted by directory stats and uploads.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Extension of the sidecar record kept next to every tracked file.
pub const SIDECAR_EXTENSION: &str = "meta";

/// Which of the three managed directories a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Processed,
    Temp,
}

impl FileCategory {
    pub const ALL: [FileCategory; 3] = [
        FileCategory::Image,
        FileCategory::Processed,
        FileCategory::Temp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Image => "image",
            FileCategory::Processed => "processed",
            FileCategory::Temp => "temp",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three managed storage locations, resolved from one root.
#[derive(Debug, Clone)]
pub struct WorkingDirectories {
    pub root: PathBuf,
    pub images_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl WorkingDirectories {
    /// Resolve the directory layout under `root` without touching the
    /// filesystem. Call [`ensure_all`](Self::ensure_all) before use.
    pub fn resolve<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            images_dir: root.join("images"),
            processed_dir: root.join("processed"),
            temp_dir: root.join("temp"),
            root,
        }
    }

    /// Create any missing working directories.
    pub fn ensure_all(&self) -> Result<()> {
        for (dir, _) in self.all() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn dir_for(&self, category: FileCategory) -> &Path {
        match category {
            FileCategory::Image => &self.images_dir,
            FileCategory::Processed => &self.processed_dir,
            FileCategory::Temp => &self.temp_dir,
        }
    }

    /// All managed directories with their categories.
    pub fn all(&self) -> [(PathBuf, FileCategory); 3] {
        [
            (self.images_dir.clone(), FileCategory::Image),
            (self.processed_dir.clone(), FileCategory::Processed),
            (self.temp_dir.clone(), FileCategory::Temp),
        ]
    }

    /// Which managed directory a path belongs to, if any.
    pub fn category_of(&self, path: &Path) -> Option<FileCategory> {
        if path.starts_with(&self.temp_dir) {
            Some(FileCategory::Temp)
        } else if path.starts_with(&self.processed_dir) {
            Some(FileCategory::Processed)
        } else if path.starts_with(&self.images_dir) {
            Some(FileCategory::Image)
        } else {
            None
        }
    }

    /// Recursively empty the named directories and recreate them.
    ///
    /// Per-entry removal errors are logged and skipped so one stubborn
    /// file does not leave the reset half-done.
    pub fn reset(&self, categories: &[FileCategory]) -> Result<()> {
        for category in categories {
            let dir = self.dir_for(*category);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Failed to remove directory during reset, clearing entries individually"
                    );
                    clear_directory_entries(dir);
                }
            }
            std::fs::create_dir_all(dir)?;
            tracing::info!(category = %category, dir = %dir.display(), "Directory reset");
        }
        Ok(())
    }

    /// Total bytes of regular files directly inside one managed directory.
    pub fn dir_size(&self, category: FileCategory) -> u64 {
        directory_size(self.dir_for(category))
    }
}

fn clear_directory_entries(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove entry during reset");
        }
    }
}

/// Sum of file sizes directly under `dir` (non-recursive, sidecars included).
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| std::fs::metadata(e.path()).ok())
        .map(|m| m.len())
        .sum()
}

/// Check that `path` is a readable directory.
pub fn validate_directory(path: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StampError::DirectoryNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(StampError::DirectoryAccessDenied {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        return Err(StampError::DirectoryNotFound {
            path: path.to_path_buf(),
        });
    }

    // Readability probe: listing is what every consumer does next.
    match std::fs::read_dir(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(StampError::DirectoryAccessDenied {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether a filename carries one of the recognized image extensions.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Count image files directly inside a directory.
pub fn image_file_count(dir: &Path) -> Result<usize> {
    validate_directory(dir)?;
    let count = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_image_file(e.path()))
        .count();
    Ok(count)
}
