//! The change ledger: the hand-off artifact between detection and application.
//!
//! # Format
//!
//! A CSV file with header `ID,Action` and one row per identifier:
//!
//! ```text
//! ID,Action
//! seg-101,add
//! seg-204,update
//! seg-977,delete
//! ```
//!
//! Actions are case-sensitive lowercase. Reading is tolerant per row: an
//! unknown action or a repeated id rejects that row only. A missing or wrong
//! header rejects the whole file.
//!
//! # Manifest
//!
//! Next to the CSV sits `<ledger>.manifest.json` ([`LedgerManifest`]), which
//! versions the schema and records where the ledger came from and whether it
//! is complete. The manifest is optional on read so that hand-written and
//! retry ledgers can be applied as-is.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IntegrityError, LedgerError};
use crate::models::{Action, ChangeEntry};

/// Current manifest schema version.
pub const SCHEMA_VERSION: u32 = 1;

const HEADER_ID: &str = "ID";
const HEADER_ACTION: &str = "Action";

/// Number of entries per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub add: u64,
    pub update: u64,
    pub delete: u64,
}

impl ActionCounts {
    pub fn record(&mut self, action: Action) {
        match action {
            Action::Add => self.add += 1,
            Action::Update => self.update += 1,
            Action::Delete => self.delete += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.add + self.update + self.delete
    }
}

impl<'a> FromIterator<&'a ChangeEntry> for ActionCounts {
    fn from_iter<I: IntoIterator<Item = &'a ChangeEntry>>(iter: I) -> Self {
        let mut counts = ActionCounts::default();
        for entry in iter {
            counts.record(entry.action);
        }
        counts
    }
}

/// Streaming ledger writer. The header is written on construction.
///
/// Entries are appended as they are produced, so the full ledger never has
/// to be held in memory. Uniqueness of ids is the producer's responsibility.
pub struct LedgerWriter<W: Write> {
    inner: csv::Writer<W>,
    counts: ActionCounts,
}

impl LedgerWriter<File> {
    /// Create (or truncate) a ledger file at `path`.
    pub fn create(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::new(File::create(path)?)
    }
}

impl<W: Write> LedgerWriter<W> {
    pub fn new(writer: W) -> Result<Self, LedgerError> {
        let mut inner = csv::Writer::from_writer(writer);
        inner.write_record([HEADER_ID, HEADER_ACTION])?;
        Ok(Self {
            inner,
            counts: ActionCounts::default(),
        })
    }

    pub fn append(&mut self, entry: &ChangeEntry) -> Result<(), LedgerError> {
        self.inner
            .write_record([entry.id.as_str(), entry.action.as_str()])?;
        self.counts.record(entry.action);
        Ok(())
    }

    pub fn append_all<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a ChangeEntry>,
    ) -> Result<(), LedgerError> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn counts(&self) -> ActionCounts {
        self.counts
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W, LedgerError> {
        self.inner
            .into_inner()
            .map_err(|e| LedgerError::Io(e.into_error()))
    }
}

/// Result of reading a ledger: the usable entries plus every rejected row.
#[derive(Debug, Default)]
pub struct LedgerRead {
    pub entries: Vec<ChangeEntry>,
    pub rejected: Vec<IntegrityError>,
}

/// Read a ledger from any reader.
///
/// Rows are numbered from 1 (the first row after the header). Surrounding
/// whitespace in cells is trimmed so `ID, Action` is accepted as a header.
pub fn read_ledger<R: Read>(reader: R) -> Result<LedgerRead, LedgerError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    if headers.len() != 2 || &headers[0] != HEADER_ID || &headers[1] != HEADER_ACTION {
        return Err(LedgerError::BadHeader(
            headers.iter().collect::<Vec<_>>().join(","),
        ));
    }

    let mut out = LedgerRead::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (i, row) in rdr.records().enumerate() {
        let row_no = i + 1;
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                out.rejected.push(IntegrityError::MalformedRow {
                    row: row_no,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        if row.len() != 2 || row[0].is_empty() {
            out.rejected.push(IntegrityError::MalformedRow {
                row: row_no,
                detail: format!("expected 2 non-empty cells, found {}", row.len()),
            });
            continue;
        }

        let id = row[0].to_string();
        let action = match row[1].parse::<Action>() {
            Ok(a) => a,
            Err(action) => {
                out.rejected.push(IntegrityError::UnknownAction {
                    row: row_no,
                    id,
                    action,
                });
                continue;
            }
        };

        if !seen.insert(id.clone()) {
            out.rejected.push(IntegrityError::DuplicateId { id });
            continue;
        }

        out.entries.push(ChangeEntry { id, action });
    }

    Ok(out)
}

/// Read a ledger file from disk.
pub fn read_ledger_file(path: &Path) -> Result<LedgerRead, LedgerError> {
    read_ledger(File::open(path)?)
}

/// Whether detection saw everything it needed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Complete,
    Partial,
}

/// How the remote ids were enumerated for this ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationInfo {
    pub strategy: String,
    pub seen: u64,
    pub total: Option<u64>,
    pub complete: bool,
}

/// Sidecar describing a ledger file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub dataset_path: String,
    /// Lowercase hex SHA-256 of the dataset file bytes.
    pub dataset_digest: String,
    pub status: LedgerStatus,
    pub counts: ActionCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<EnumerationInfo>,
}

/// `changes.csv` → `changes.csv.manifest.json`.
pub fn manifest_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

impl LedgerManifest {
    /// Write the manifest next to `ledger_path`.
    pub fn write(&self, ledger_path: &Path) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(manifest_path(ledger_path), json)?;
        Ok(())
    }

    /// Load the manifest for `ledger_path`, or `None` if there is none.
    pub fn load(ledger_path: &Path) -> Result<Option<Self>, LedgerError> {
        let path = manifest_path(ledger_path);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let manifest: LedgerManifest = serde_json::from_str(&content)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(LedgerError::UnsupportedSchema(manifest.schema_version));
        }
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(entries: &[ChangeEntry]) -> String {
        let mut w = LedgerWriter::new(Vec::new()).unwrap();
        w.append_all(entries).unwrap();
        String::from_utf8(w.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn writes_header_and_rows() {
        let out = written(&[
            ChangeEntry::new("A", Action::Add),
            ChangeEntry::new("B", Action::Delete),
        ]);
        assert_eq!(out, "ID,Action\nA,add\nB,delete\n");
    }

    #[test]
    fn empty_ledger_is_header_only() {
        assert_eq!(written(&[]), "ID,Action\n");
        let read = read_ledger("ID,Action\n".as_bytes()).unwrap();
        assert!(read.entries.is_empty());
        assert!(read.rejected.is_empty());
    }

    #[test]
    fn writer_counts_actions() {
        let mut w = LedgerWriter::new(Vec::new()).unwrap();
        w.append(&ChangeEntry::new("A", Action::Add)).unwrap();
        w.append(&ChangeEntry::new("B", Action::Update)).unwrap();
        w.append(&ChangeEntry::new("C", Action::Update)).unwrap();
        let c = w.counts();
        assert_eq!((c.add, c.update, c.delete, c.total()), (1, 2, 0, 3));
    }

    #[test]
    fn reads_in_order() {
        let read = read_ledger("ID,Action\nA,add\nB,update\nC,delete\n".as_bytes()).unwrap();
        assert_eq!(
            read.entries,
            vec![
                ChangeEntry::new("A", Action::Add),
                ChangeEntry::new("B", Action::Update),
                ChangeEntry::new("C", Action::Delete),
            ]
        );
    }

    #[test]
    fn accepts_spaced_header() {
        let read = read_ledger("ID, Action\nA, add\n".as_bytes()).unwrap();
        assert_eq!(read.entries, vec![ChangeEntry::new("A", Action::Add)]);
    }

    #[test]
    fn rejects_bad_header() {
        let err = read_ledger("Id,Action\nA,add\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LedgerError::BadHeader(_)));
    }

    #[test]
    fn unknown_action_skips_row_only() {
        let read = read_ledger("ID,Action\nA,Add\nB,delete\nC,purge\n".as_bytes()).unwrap();
        assert_eq!(read.entries, vec![ChangeEntry::new("B", Action::Delete)]);
        assert_eq!(read.rejected.len(), 2);
        assert!(matches!(
            &read.rejected[0],
            IntegrityError::UnknownAction { row: 1, action, .. } if action == "Add"
        ));
    }

    #[test]
    fn duplicate_id_keeps_first() {
        let read = read_ledger("ID,Action\nA,add\nA,delete\n".as_bytes()).unwrap();
        assert_eq!(read.entries, vec![ChangeEntry::new("A", Action::Add)]);
        assert_eq!(
            read.rejected,
            vec![IntegrityError::DuplicateId { id: "A".into() }]
        );
    }

    #[test]
    fn short_row_is_malformed() {
        let read = read_ledger("ID,Action\nA\nB,add\n".as_bytes()).unwrap();
        assert_eq!(read.entries, vec![ChangeEntry::new("B", Action::Add)]);
        assert!(matches!(
            read.rejected[0],
            IntegrityError::MalformedRow { row: 1, .. }
        ));
    }

    #[test]
    fn ids_with_commas_are_quoted() {
        let entries = vec![ChangeEntry::new("a,b", Action::Update)];
        let out = written(&entries);
        assert_eq!(out, "ID,Action\n\"a,b\",update\n");
        assert_eq!(read_ledger(out.as_bytes()).unwrap().entries, entries);
    }

    #[test]
    fn manifest_path_appends_suffix() {
        assert_eq!(
            manifest_path(Path::new("data/changes.csv")),
            PathBuf::from("data/changes.csv.manifest.json")
        );
    }

    #[test]
    fn counts_from_entries() {
        let entries = [
            ChangeEntry::new("A", Action::Add),
            ChangeEntry::new("B", Action::Delete),
            ChangeEntry::new("C", Action::Delete),
        ];
        let counts: ActionCounts = entries.iter().collect();
        assert_eq!((counts.add, counts.update, counts.delete), (1, 0, 2));
    }
}
