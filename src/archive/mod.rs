//! Per-print archives on disk.
//!
//! Layout: `<root>/<YYYY-MM-DD>/<sanitized_filename>.records`, one JSON
//! record per line, append-only. The writer owns all appends; readers open
//! files independently and tolerate a truncated trailing line.

pub mod reader;
pub mod writer;

use std::path::Path;

/// Extension of per-print record files.
pub const RECORDS_EXT: &str = "records";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid archive name: {0}")]
    InvalidName(String),
}

/// Sanitize a print filename for use as an archive file stem: trim, map
/// characters outside `[A-Za-z0-9 _.\-]` to `_`, collapse whitespace runs
/// to a single `_`.
pub fn sanitize_filename(name: &str) -> String {
    let mapped: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut out = String::with_capacity(mapped.len());
    let mut in_whitespace = false;
    for c in mapped.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
        } else {
            out.push(c);
            in_whitespace = false;
        }
    }
    out
}

/// Reject path components that could escape the archive root.
pub(crate) fn validate_component(component: &str) -> Result<(), ArchiveError> {
    if component.is_empty()
        || component == ".."
        || component == "."
        || component.contains('/')
        || component.contains('\\')
        || Path::new(component).is_absolute()
    {
        return Err(ArchiveError::InvalidName(component.to_owned()));
    }
    Ok(())
}
