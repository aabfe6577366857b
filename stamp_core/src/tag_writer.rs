//! Metadata tag writing through exiftool
//!
//! One exiftool invocation per record writes the title, description and
//! keywords into the legacy (IPTC) and modern (XMP-dc) tag families plus
//! the EXIF IFD0 mirrors, all in the same argument list. UTF-8 is forced
//! through both `-codedcharacterset` and the IPTC charset flag; skipping
//! either silently corrupts non-ASCII text.
//!
//! The incoming copy is never mutated: the source is copied into the
//! processed directory first and the tags are written to the copy.

use crate::app_error::{Result, StampError};
use crate::logging::execute_external_command;
use crate::manifest::ManifestRecord;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const TOOL_NAME: &str = "exiftool";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

static EXIFTOOL_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Locate exiftool on PATH and confirm it runs, probed once per
/// process. A binary that is present but cannot execute `-ver` counts
/// as missing.
pub fn exiftool_path() -> Result<&'static Path> {
    EXIFTOOL_PATH
        .get_or_init(|| {
            let path = match which::which(TOOL_NAME) {
                Ok(path) => path,
                Err(_) => {
                    tracing::warn!("exiftool not found in PATH");
                    return None;
                }
            };
            match probe_version(&path) {
                Some(version) => {
                    tracing::info!(path = %path.display(), version = %version, "exiftool found");
                    Some(path)
                }
                None => {
                    tracing::warn!(path = %path.display(), "exiftool present but failed -ver check");
                    None
                }
            }
        })
        .as_deref()
        .ok_or(StampError::TagToolMissing)
}

/// Run `<tool> -ver` and return the reported version on success.
fn probe_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("-ver").output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether exiftool is available. Tests use this to self-skip.
pub fn exiftool_available() -> bool {
    exiftool_path().is_ok()
}

#[derive(Debug, Clone)]
pub struct TagWriterConfig {
    /// Kill the tag tool and fail the record after this long.
    pub timeout: Duration,
    /// Read tags back after writing and log mismatches (advisory only).
    pub verify: bool,
}

impl Default for TagWriterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            verify: true,
        }
    }
}

/// Writes one record's tags to one image.
pub struct TagWriter {
    config: TagWriterConfig,
}

/// Tags read back from a processed image, both families.
#[derive(Debug, Default)]
pub struct TagReadback {
    pub iptc_title: Option<String>,
    pub iptc_description: Option<String>,
    pub iptc_keywords: Vec<String>,
    pub xmp_title: Option<String>,
    pub xmp_description: Option<String>,
    pub xmp_keywords: Vec<String>,
}

impl TagWriter {
    pub fn new(config: TagWriterConfig) -> Self {
        Self { config }
    }

    /// Copy `image_path` to `processed_path` and write the record's tags
    /// to the copy.
    ///
    /// The source is checked before anything destructive happens. A
    /// non-zero tool exit fails with the most meaningful stderr line; a
    /// hang is bounded by the configured timeout.
    pub fn write(
        &self,
        image_path: &Path,
        processed_path: &Path,
        record: &ManifestRecord,
    ) -> Result<()> {
        if !image_path.is_file() {
            return Err(StampError::SourceNotFound {
                path: image_path.to_path_buf(),
            });
        }

        let tool = exiftool_path()?;

        std::fs::copy(image_path, processed_path)?;

        let args = build_tag_args(record, processed_path);
        let outcome = self.run_with_timeout(tool, &args, processed_path);

        if let Err(e) = &outcome {
            // Don't leave a half-tagged copy behind for the archive step.
            if let Err(cleanup) = std::fs::remove_file(processed_path) {
                tracing::warn!(
                    path = %processed_path.display(),
                    error = %cleanup,
                    "Failed to remove processed copy after write error"
                );
            }
            tracing::error!(
                file = %record.filename,
                error = %e,
                "Tag write failed"
            );
        }
        outcome?;

        if self.config.verify {
            match read_tags_back(processed_path) {
                Ok(readback) => {
                    let mismatches = compare_tags(record, &readback);
                    if !mismatches.is_empty() {
                        tracing::warn!(
                            file = %record.filename,
                            mismatches = ?mismatches,
                            "Post-write verification mismatch (advisory)"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        file = %record.filename,
                        error = %e,
                        "Post-write verification read failed (advisory)"
                    );
                }
            }
        }

        tracing::info!(
            file = %record.filename,
            processed = %processed_path.display(),
            keywords = record.keywords.len(),
            "Tags written"
        );
        Ok(())
    }

    /// Spawn the tag tool and poll it against the configured timeout.
    ///
    /// stderr is consumed on a separate thread so a chatty run cannot
    /// fill the pipe buffer and deadlock the child.
    fn run_with_timeout(&self, tool: &Path, args: &[String], target: &Path) -> Result<()> {
        let command_str = format!("{} {}", TOOL_NAME, args.join(" "));
        tracing::debug!(command = %command_str, "Executing tag write");

        let start = Instant::now();
        let mut child = Command::new(tool)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take();
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if start.elapsed() >= self.config.timeout {
                        if let Err(e) = child.kill() {
                            tracing::warn!(error = %e, "Failed to kill timed-out tag tool");
                        }
                        let _ = child.wait();
                        let _ = stderr_thread.join();
                        return Err(StampError::TagWriteTimeout {
                            path: target.to_path_buf(),
                            seconds: self.config.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let stderr_output = stderr_thread.join().unwrap_or_default();
        let duration = start.elapsed();

        if status.success() {
            tracing::debug!(
                duration_secs = duration.as_secs_f64(),
                "Tag write completed"
            );
            if !stderr_output.trim().is_empty() {
                // exiftool emits minor warnings on stderr even on success
                tracing::debug!(stderr = %stderr_output.trim(), "Tag tool warnings");
            }
            Ok(())
        } else {
            Err(StampError::TagWriteFailed {
                path: target.to_path_buf(),
                detail: stderr_digest(&stderr_output),
                exit_code: status.code(),
            })
        }
    }
}

impl Default for TagWriter {
    fn default() -> Self {
        Self::new(TagWriterConfig::default())
    }
}

/// Build the single batched argument list for one write.
///
/// Each keyword becomes its own repeated tag instance in both families.
/// One OS argument per tag, never through a shell, so values containing
/// `=`, spaces or non-ASCII survive untouched.
pub fn build_tag_args(record: &ManifestRecord, target: &Path) -> Vec<String> {
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-codedcharacterset=UTF8".to_string(),
        "-charset".to_string(),
        "iptc=UTF8".to_string(),
        "-m".to_string(),
        format!("-IPTC:ObjectName={}", record.title),
        format!("-IPTC:Caption-Abstract={}", record.description),
    ];
    for keyword in &record.keywords {
        args.push(format!("-IPTC:Keywords={}", keyword));
    }
    args.push(format!("-XMP-dc:Title={}", record.title));
    args.push(format!("-XMP-dc:Description={}", record.description));
    for keyword in &record.keywords {
        args.push(format!("-XMP-dc:Subject={}", keyword));
    }
    args.push(format!("-IFD0:ImageDescription={}", record.description));
    args.push(format!("-IFD0:DocumentName={}", record.title));
    args.push(target.to_string_lossy().to_string());
    args
}

/// Read both tag families back from a file as JSON.
pub fn read_tags_back(path: &Path) -> Result<TagReadback> {
    exiftool_path()?;

    let path_str = path.to_string_lossy().to_string();
    let args = [
        "-j",
        "-charset",
        "iptc=UTF8",
        "-IPTC:ObjectName",
        "-IPTC:Caption-Abstract",
        "-IPTC:Keywords",
        "-XMP-dc:Title",
        "-XMP-dc:Description",
        "-XMP-dc:Subject",
        path_str.as_str(),
    ];

    let result = execute_external_command(TOOL_NAME, &args)?;
    if result.exit_code != Some(0) {
        return Err(StampError::TagWriteFailed {
            path: path.to_path_buf(),
            detail: stderr_digest(&result.stderr),
            exit_code: result.exit_code,
        });
    }

    let parsed: serde_json::Value = serde_json::from_str(&result.stdout)?;
    let entry = parsed
        .as_array()
        .and_then(|arr| arr.first())
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    Ok(TagReadback {
        iptc_title: string_tag(&entry, "ObjectName"),
        iptc_description: string_tag(&entry, "Caption-Abstract"),
        iptc_keywords: list_tag(&entry, "Keywords"),
        xmp_title: string_tag(&entry, "Title"),
        xmp_description: string_tag(&entry, "Description"),
        xmp_keywords: list_tag(&entry, "Subject"),
    })
}

fn string_tag(entry: &serde_json::Value, name: &str) -> Option<String> {
    match entry.get(name) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Multi-valued tags come back as an array, or a bare string when there
/// is a single instance.
fn list_tag(entry: &serde_json::Value, name: &str) -> Vec<String> {
    match entry.get(name) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Compare read-back tags against the record, order-insensitive for
/// keywords. Returns one line per mismatch.
pub fn compare_tags(record: &ManifestRecord, readback: &TagReadback) -> Vec<String> {
    let mut mismatches = Vec::new();

    let expect_string = |found: &Option<String>, tag: &str, expected: &str| {
        if found.as_deref() != Some(expected) {
            Some(format!("{} mismatch", tag))
        } else {
            None
        }
    };

    mismatches.extend(expect_string(
        &readback.iptc_title,
        "IPTC:ObjectName",
        &record.title,
    ));
    mismatches.extend(expect_string(
        &readback.iptc_description,
        "IPTC:Caption-Abstract",
        &record.description,
    ));
    mismatches.extend(expect_string(
        &readback.xmp_title,
        "XMP-dc:Title",
        &record.title,
    ));
    mismatches.extend(expect_string(
        &readback.xmp_description,
        "XMP-dc:Description",
        &record.description,
    ));

    if !keyword_sets_equal(&record.keywords, &readback.iptc_keywords) {
        mismatches.push("IPTC:Keywords mismatch".to_string());
    }
    if !keyword_sets_equal(&record.keywords, &readback.xmp_keywords) {
        mismatches.push("XMP-dc:Subject mismatch".to_string());
    }

    mismatches
}

fn keyword_sets_equal(expected: &[String], found: &[String]) -> bool {
    let mut expected: Vec<&str> = expected.iter().map(String::as_str).collect();
    let mut found: Vec<&str> = found.iter().map(String::as_str).collect();
    expected.sort_unstable();
    expected.dedup();
    found.sort_unstable();
    found.dedup();
    expected == found
}

/// Pick the most meaningful stderr line for an error message.
fn stderr_digest(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .find(|l| l.starts_with("Error"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "tag tool reported no detail".to_string())
}
