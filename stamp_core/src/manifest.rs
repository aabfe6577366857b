//! CSV manifest parsing and validation
//!
//! The manifest maps image filenames to the title/description/keywords to
//! write. Headers are matched case-insensitively; rows failing a field rule
//! are rejected individually without aborting the batch. Rows carrying more
//! cells than headers (the common case of unquoted commas in a trailing
//! keywords column) fold the overflow back into the final field.

use crate::app_error::{Result, StampError};
use std::collections::HashMap;

pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_KEYWORDS: usize = 50;

const EXPECTED_HEADERS: [&str; 4] = ["filename", "title", "description", "keywords"];

/// One validated manifest row, ready for tag writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub filename: String,
    pub title: String,
    pub description: String,
    /// Ordered keyword list; each entry becomes its own tag instance.
    pub keywords: Vec<String>,
}

impl ManifestRecord {
    /// Display form of the keyword list.
    pub fn keywords_display(&self) -> String {
        self.keywords.join(", ")
    }
}

/// A valid record together with its 1-based manifest row number.
#[derive(Debug, Clone)]
pub struct ValidRow {
    pub row: usize,
    pub record: ManifestRecord,
}

/// A row excluded from the batch, with the reasons it failed.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    pub row: usize,
    pub reasons: Vec<String>,
}

impl RejectedRow {
    pub fn detail(&self) -> String {
        format!("Row {}: {}", self.row, self.reasons.join("; "))
    }
}

/// Outcome of parsing one manifest: valid records plus rejected rows.
#[derive(Debug, Default)]
pub struct ManifestParse {
    pub records: Vec<ValidRow>,
    pub rejected: Vec<RejectedRow>,
}

impl ManifestParse {
    pub fn total_rows(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

/// Split a raw keyword cell on commas and semicolons, trimming each entry
/// and dropping empties. Order is preserved.
pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse and validate a CSV manifest.
///
/// A missing required header aborts with [`StampError::HeaderMismatch`]
/// before any row is considered. Row failures are collected as
/// [`RejectedRow`]s; valid rows keep processing.
pub fn parse_manifest(csv_text: &str) -> Result<ManifestParse> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let missing: Vec<String> = EXPECTED_HEADERS
        .iter()
        .filter(|h| !headers.iter().any(|found| found == *h))
        .map(|h| h.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(StampError::HeaderMismatch { missing });
    }

    let mut parse = ManifestParse::default();
    let mut row = 0usize;

    for record in reader.records() {
        let record = record?;
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        row += 1;

        let fields = normalize_row(&headers, &record);
        match validate_row(&fields) {
            Ok(record) => parse.records.push(ValidRow { row, record }),
            Err(reasons) => {
                tracing::warn!(row, reasons = ?reasons, "Manifest row rejected");
                parse.rejected.push(RejectedRow { row, reasons });
            }
        }
    }

    tracing::info!(
        valid = parse.records.len(),
        rejected = parse.rejected.len(),
        "Manifest parsed"
    );

    Ok(parse)
}

/// Rebuild one row keyed by recognized (lower-cased) headers.
///
/// Cells beyond the header count are overflow from unquoted separators;
/// they are folded back into the final header's value with the comma
/// restored so keyword splitting recovers them.
fn normalize_row(headers: &[String], record: &csv::StringRecord) -> HashMap<String, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let last_header = headers.last();

    for (col, cell) in record.iter().enumerate() {
        let header = if col < headers.len() {
            &headers[col]
        } else if let Some(last) = last_header {
            last
        } else {
            continue;
        };

        if !EXPECTED_HEADERS.contains(&header.as_str()) {
            continue;
        }

        match fields.get_mut(header) {
            Some(existing) if col >= headers.len() => {
                existing.push(',');
                existing.push_str(cell);
            }
            _ => {
                fields.insert(header.clone(), cell.to_string());
            }
        }
    }

    fields
}

fn validate_row(
    fields: &HashMap<String, String>,
) -> std::result::Result<ManifestRecord, Vec<String>> {
    let mut reasons = Vec::new();

    let filename = fields.get("filename").map(|s| s.trim()).unwrap_or("");
    let title = fields.get("title").map(|s| s.trim()).unwrap_or("");
    let description = fields.get("description").map(|s| s.trim()).unwrap_or("");
    let raw_keywords = fields.get("keywords").map(|s| s.trim()).unwrap_or("");

    if filename.is_empty() {
        reasons.push("FileName is required".to_string());
    }

    if title.is_empty() {
        reasons.push("Title is required".to_string());
    } else if title.chars().count() > MAX_TITLE_LEN {
        reasons.push(format!(
            "Title exceeds maximum length of {} characters",
            MAX_TITLE_LEN
        ));
    }

    if description.is_empty() {
        reasons.push("Description is required".to_string());
    } else if description.chars().count() > MAX_DESCRIPTION_LEN {
        reasons.push(format!(
            "Description exceeds maximum length of {} characters",
            MAX_DESCRIPTION_LEN
        ));
    }

    let keywords = split_keywords(raw_keywords);
    if raw_keywords.is_empty() {
        reasons.push("Keywords are required".to_string());
    } else if keywords.is_empty() {
        reasons.push("At least one keyword is required".to_string());
    } else if keywords.len() > MAX_KEYWORDS {
        reasons.push(format!("Maximum {} keywords allowed", MAX_KEYWORDS));
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }

    Ok(ManifestRecord {
        filename: filename.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        keywords,
    })
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn valid_single_row_always_accepted(
            title in "[A-Za-z0-9 ]{1,100}",
            description in "[A-Za-z0-9 ]{1,200}",
            keyword in "[a-z]{1,20}"
        ) {
            let title = title.trim().to_string();
            let description = description.trim().to_string();
            prop_assume!(!title.is_empty() && !description.is_empty());

            let csv = format!(
                "FileName,Title,Description,Keywords\nimg.jpg,\"{}\",\"{}\",{}",
                title, description, keyword
            );
            let parse = parse_manifest(&csv).unwrap();
            prop_assert_eq!(parse.records.len(), 1);
            prop_assert!(parse.rejected.is_empty());
        }

        #[test]
        fn split_keywords_never_yields_empty_entries(raw in "[a-z,; ]{0,80}") {
            for keyword in split_keywords(&raw) {
                prop_assert!(!keyword.is_empty());
                prop_assert_eq!(keyword.trim().len(), keyword.len());
            }
        }

        #[test]
        fn total_rows_is_records_plus_rejected(valid in 0usize..5, invalid in 0usize..5) {
            let mut csv = String::from("FileName,Title,Description,Keywords\n");
            for i in 0..valid {
                csv.push_str(&format!("v{}.jpg,T,D,k1\n", i));
            }
            for _ in 0..invalid {
                csv.push_str(",T,D,k1\n");
            }
            let parse = parse_manifest(&csv).unwrap();
            prop_assert_eq!(parse.records.len(), valid);
            prop_assert_eq!(parse.rejected.len(), invalid);
            prop_assert_eq!(parse.total_rows(), valid + invalid);
        }
    }
}
