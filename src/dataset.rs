//! Local dataset loader.
//!
//! Reads the newline-delimited JSON dataset into an id-sorted map of
//! [`Record`]s. Bad lines are data-integrity problems local to that line:
//! they are logged, counted, and skipped. The SHA-256 of the file bytes is
//! computed while reading so the ledger manifest can name the exact dataset
//! it was detected from.
//!
//! A skipped line whose id can still be read is remembered: detection must
//! not turn a malformed local record into a remote deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use vector_sync_core::error::IntegrityError;
use vector_sync_core::models::{Record, RecordSchema};

/// The authoritative local records for one run. Read-only once loaded.
#[derive(Debug, Default)]
pub struct Dataset {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file bytes.
    pub digest: String,
    records: BTreeMap<String, Record>,
    rejected: usize,
    skipped_ids: BTreeSet<String>,
}

impl Dataset {
    /// Build a dataset from already-parsed records (first occurrence wins).
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut map = BTreeMap::new();
        let mut rejected = 0;
        for record in records {
            if map.contains_key(&record.id) {
                rejected += 1;
                continue;
            }
            map.insert(record.id.clone(), record);
        }
        Self {
            records: map,
            rejected,
            ..Self::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lines skipped as invalid or duplicate.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Whether `id` belongs to a line that was skipped as invalid.
    pub fn is_skipped(&self, id: &str) -> bool {
        self.skipped_ids.contains(id)
    }
}

/// Load an NDJSON dataset file.
pub fn load_dataset(path: &Path, schema: &RecordSchema) -> Result<Dataset> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut records = BTreeMap::new();
    let mut rejected = 0usize;
    let mut skipped_ids = BTreeSet::new();
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
        if n == 0 {
            break;
        }
        line_no += 1;
        hasher.update(line.as_bytes());

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_line(trimmed, schema) {
            Ok(record) => {
                if records.contains_key(&record.id) {
                    warn!(
                        line = line_no,
                        error = %IntegrityError::DuplicateId { id: record.id.clone() },
                        "skipping dataset record"
                    );
                    rejected += 1;
                    continue;
                }
                records.insert(record.id.clone(), record);
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping dataset record");
                rejected += 1;
                if let Some(id) = salvage_id(trimmed, schema) {
                    skipped_ids.insert(id);
                }
            }
        }
    }

    let digest = format!("{:x}", hasher.finalize());
    info!(
        path = %path.display(),
        records = records.len(),
        rejected,
        "loaded dataset"
    );

    Ok(Dataset {
        path: path.to_path_buf(),
        digest,
        records,
        rejected,
        skipped_ids,
    })
}

fn parse_line(line: &str, schema: &RecordSchema) -> Result<Record, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
    Record::from_value(&value, schema).map_err(|e| e.to_string())
}

/// The id of an otherwise unusable line, if one can be read.
fn salvage_id(line: &str, schema: &RecordSchema) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get(&schema.id_field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_dataset(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_records_sorted() {
        let f = write_dataset(concat!(
            r#"{"id": "B", "path": "p/b", "description": "b"}"#,
            "\n",
            r#"{"id": "A", "path": "p/a", "description": "a", "ctr": 0.5}"#,
            "\n",
        ));
        let ds = load_dataset(f.path(), &RecordSchema::default()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.ids().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(ds.get("A").unwrap().fields()["ctr"], "0.5");
        assert_eq!(ds.rejected(), 0);
        assert_eq!(ds.digest.len(), 64);
    }

    #[test]
    fn skips_bad_lines_and_duplicates() {
        let f = write_dataset(concat!(
            r#"{"id": "A", "path": "p", "description": "first"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"id": "B", "path": "p"}"#,
            "\n",
            r#"{"id": "A", "path": "p", "description": "second"}"#,
            "\n",
        ));
        let ds = load_dataset(f.path(), &RecordSchema::default()).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.rejected(), 3);
        assert!(ds.is_skipped("B"));
        assert!(!ds.is_skipped("A"));
        assert_eq!(
            ds.get("A").unwrap().canonical_text(),
            "Full Path: p, Description: first"
        );
    }

    #[test]
    fn digest_tracks_content() {
        let a = write_dataset("{\"id\":\"A\",\"path\":\"p\",\"description\":\"d\"}\n");
        let b = write_dataset("{\"id\":\"A\",\"path\":\"p\",\"description\":\"e\"}\n");
        let da = load_dataset(a.path(), &RecordSchema::default()).unwrap();
        let db = load_dataset(b.path(), &RecordSchema::default()).unwrap();
        assert_ne!(da.digest, db.digest);
    }

    #[test]
    fn missing_file_is_error() {
        let err = load_dataset(Path::new("/nonexistent/records.jsonl"), &RecordSchema::default())
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open dataset"));
    }
}
