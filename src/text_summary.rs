//! Text builders for CLI output.
//!
//! Pure formatting of registry entries and run records into display lines.

use crate::model::{Registry, RunRecord};
use std::path::Path;
use std::time::Duration;

/// One line per registry entry, numbered from 1, after a header naming the shared location.
pub(crate) fn registry_lines(registry: &Registry, shared_doc_dir: &Path) -> Vec<String> {
    let mut lines = vec![format!("Shared documents: {}", shared_doc_dir.display())];
    if registry.programs.is_empty() {
        lines.push("No programs registered. Add one with `docswap add`.".to_string());
        return lines;
    }
    for (i, entry) in registry.programs.iter().enumerate() {
        lines.push(format!(
            "{:>3}. {}  [{}]  docs: {}",
            i + 1,
            entry.name,
            entry.executable_path.display(),
            entry.private_doc_path.display()
        ));
    }
    lines
}

/// One line per run record, plus an indented warning line where the swap-out failed.
pub(crate) fn history_lines(records: &[RunRecord]) -> Vec<String> {
    let mut lines = Vec::with_capacity(records.len());
    for r in records {
        lines.push(format!(
            "{}  {}  {}  ({})",
            r.timestamp_utc,
            r.name,
            humantime::format_duration(whole_seconds(r.duration)),
            r.exit
        ));
        if let Some(w) = r.warning.as_deref() {
            lines.push(format!("      warning: {w}"));
        }
    }
    lines
}

fn whole_seconds(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
