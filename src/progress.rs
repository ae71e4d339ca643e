//! Detect and apply progress reporting.
//!
//! Reports observable progress during `vsync detect` and `vsync apply` so
//! operators see how far enumeration, comparison, and application have got.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Remote ids collected so far; `total` is known for query enumeration.
    Enumerating {
        strategy: String,
        seen: u64,
        total: Option<u64>,
    },
    /// Detection: pages compared out of total.
    Comparing { n: u64, total: u64 },
    /// Application: batches finished out of total.
    Applying { n: u64, total: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "detect  comparing  12 / 40 pages".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Enumerating {
                strategy,
                seen,
                total,
            } => match total {
                Some(t) => format!(
                    "detect  enumerating ({})  {} / {} ids\n",
                    strategy,
                    format_number(*seen),
                    format_number(*t)
                ),
                None => format!(
                    "detect  enumerating ({})  {} ids\n",
                    strategy,
                    format_number(*seen)
                ),
            },
            SyncProgressEvent::Comparing { n, total } => format!(
                "detect  comparing  {} / {} pages\n",
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Applying { n, total } => format!(
                "apply  {} / {} batches\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Enumerating {
                strategy,
                seen,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "enumerating",
                "strategy": strategy,
                "n": seen,
                "total": total
            }),
            SyncProgressEvent::Comparing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "comparing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Applying { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "applying",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
