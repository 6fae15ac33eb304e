//! Export artifact writer
//!
//! Writes the exportable dataset as pretty-printed UTF-8 JSON into a
//! timestamped file (`zhihu-mcn-data-YYYY-MM-DD-HH-MM-SS.json`).

use chrono::{DateTime, Utc};
use mcn_common::{time, Dataset, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const EXPORT_PREFIX: &str = "zhihu-mcn-data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Written { path: PathBuf, entries: usize },
    /// Nothing to export; no file written
    Empty,
}

/// File name for an export taken at `at`
pub fn export_file_name(at: DateTime<Utc>) -> String {
    format!("{}-{}.json", EXPORT_PREFIX, time::file_stamp(at))
}

/// Write `data` into `dir`, creating the directory if needed
pub fn write_export(data: &Dataset, dir: &Path, at: DateTime<Utc>) -> Result<ExportOutcome> {
    if data.is_empty() {
        info!("No MCN data found to export");
        return Ok(ExportOutcome::Empty);
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(export_file_name(at));
    let json = serde_json::to_string_pretty(data)?;
    std::fs::write(&path, json)?;

    info!(path = %path.display(), entries = data.len(), "Exported MCN data");
    Ok(ExportOutcome::Written {
        path,
        entries: data.len(),
    })
}
