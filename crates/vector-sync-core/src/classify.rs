//! Per-record change classification.
//!
//! Compares one local [`Record`] against what the remote index holds for the
//! same id. Canonical text is checked first because it is both the strongest
//! signal of a content change and the input to the embedding.

use std::collections::HashMap;

use crate::models::{Action, ChangeEntry, Record, RemoteItem};

/// Decide what the applier must do for `record`.
///
/// - No remote item → [`Action::Add`].
/// - Canonical text differs from the stored `raw_string` → [`Action::Update`].
/// - Any field missing from, or different in, the remote metadata →
///   [`Action::Update`].
/// - Otherwise `None`.
///
/// Extra keys present only on the remote side do not trigger an update.
pub fn classify(record: &Record, remote: Option<&RemoteItem>) -> Option<Action> {
    let remote = match remote {
        Some(r) => r,
        None => return Some(Action::Add),
    };

    if record.canonical_text() != remote.raw_string() {
        return Some(Action::Update);
    }

    let drifted = record
        .fields()
        .iter()
        .any(|(key, value)| remote.metadata.get(key) != Some(value));

    drifted.then_some(Action::Update)
}

/// Classify a page of records against one fetch response.
pub fn classify_page<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    fetched: &HashMap<String, RemoteItem>,
) -> Vec<ChangeEntry> {
    records
        .into_iter()
        .filter_map(|record| {
            classify(record, fetched.get(&record.id)).map(|a| ChangeEntry::new(&record.id, a))
        })
        .collect()
}
