//! Read side of the archive: enumerate saved prints and stream them back.
//!
//! Both operations are pure reads and safe to run while the writer is
//! appending to the same file: records are whole lines, and an incomplete
//! trailing line (a write in flight, or a crash artifact) is discarded.

use super::{validate_component, ArchiveError, RECORDS_EXT};
use crate::frame::Packet;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::warn;

/// One saved print, as listed by [`list_archives`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    /// Date directory, `YYYY-MM-DD`.
    pub date: String,
    /// Print name (file stem, without the `.records` extension).
    pub filename: String,
    pub size_bytes: u64,
    pub modified_ms: i64,
}

/// Enumerate saved prints under `root`, sorted by `(date, filename)`.
///
/// Entries beginning with `.` are excluded. A missing root yields an empty
/// list (nothing has been archived yet).
pub fn list_archives(root: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut entries = Vec::new();
    let dates = match fs::read_dir(root) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };

    for date_entry in dates {
        let date_entry = date_entry?;
        let date = date_entry.file_name().to_string_lossy().into_owned();
        if date.starts_with('.') || !date_entry.file_type()?.is_dir() {
            continue;
        }
        for file_entry in fs::read_dir(date_entry.path())? {
            let file_entry = file_entry?;
            let name = file_entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", RECORDS_EXT)) else {
                continue;
            };
            let meta = file_entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            entries.push(ArchiveEntry {
                date: date.clone(),
                filename: stem.to_owned(),
                size_bytes: meta.len(),
                modified_ms,
            });
        }
    }

    entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.filename.cmp(&b.filename)));
    Ok(entries)
}

/// Read one saved print back as the sequence of enriched packets that were
/// written to it.
///
/// Malformed lines are skipped with a warning; an incomplete trailing line
/// (no terminating newline) is discarded.
pub fn read_archive(root: &Path, date: &str, filename: &str) -> Result<Vec<Packet>, ArchiveError> {
    validate_component(date)?;
    validate_component(filename)?;

    let path = root.join(date).join(format!("{}.{}", filename, RECORDS_EXT));
    let text = fs::read_to_string(&path)?;

    // Every complete record ends with '\n'; anything after the last newline
    // is a partial write and is dropped.
    let complete = match text.rfind('\n') {
        Some(last) => {
            if last + 1 < text.len() {
                warn!(path = %path.display(), "discarding incomplete trailing record");
            }
            &text[..last + 1]
        }
        None => {
            if !text.is_empty() {
                warn!(path = %path.display(), "discarding incomplete trailing record");
            }
            ""
        }
    };

    let mut packets = Vec::new();
    for (lineno, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Packet>(line) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed record");
            }
        }
    }
    Ok(packets)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
