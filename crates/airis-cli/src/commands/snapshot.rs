//! Export and import of the whole library

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use airis_core::store::Snapshot;
use airis_core::Store;

use crate::output::Output;

/// Write a JSON snapshot to `path`, or stdout when no path is given
pub fn export(store: &Store, path: Option<PathBuf>, output: &Output) -> Result<()> {
    let snapshot = store.export_snapshot()?;
    let json = serde_json::to_string_pretty(&snapshot).context("Failed to encode snapshot")?;

    match path {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            output.success(&format!(
                "Exported {} book(s), {} note(s) to {}",
                snapshot.books.len(),
                snapshot.notes.len(),
                path.display()
            ));
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn import(store: &mut Store, path: PathBuf, output: &Output) -> Result<()> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Invalid snapshot file: {}", path.display()))?;

    if snapshot.version > Snapshot::VERSION {
        bail!(
            "Snapshot version {} is newer than supported version {}",
            snapshot.version,
            Snapshot::VERSION
        );
    }

    let report = store.import_snapshot(snapshot).context("Import failed")?;
    if output.is_json() {
        output.json(&report);
    } else {
        output.success(&format!(
            "Imported {} book(s), {} note(s), {} position(s)",
            report.books, report.notes, report.positions
        ));
    }
    Ok(())
}
