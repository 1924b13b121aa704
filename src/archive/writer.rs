//! The archive writer: per-sender active-print state and append-only
//! persistence.
//!
//! A single writer task owns the ActivePrint table and all file appends, so
//! records land in hub-publish order per print file. Failed appends are
//! logged and not retried; the state machine is unaffected so the next
//! packet can succeed.

use super::{sanitize_filename, ArchiveError, RECORDS_EXT};
use crate::frame::{MetricPayload, Packet, Scalar};
use crate::queue;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Idle time after which a sender's active print expires.
pub const PRINT_END_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Metric name that carries the print filename.
const FILENAME_METRIC: &str = "print_filename";

/// The print currently associated with one sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePrint {
    pub filename: String,
    pub last_seen: DateTime<Utc>,
}

/// Per-sender archival state machine plus the append side of the archive.
pub struct ArchiveWriter {
    root: PathBuf,
    print_end_timeout: ChronoDuration,
    /// Policy knob: the source of record syncs neither per record nor per
    /// idle window, so the default is off.
    fsync_per_record: bool,
    active: HashMap<String, ActivePrint>,
}

impl ArchiveWriter {
    pub fn new(root: impl Into<PathBuf>, print_end_timeout: Duration) -> ArchiveWriter {
        ArchiveWriter {
            root: root.into(),
            print_end_timeout: ChronoDuration::from_std(print_end_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(600)),
            fsync_per_record: false,
            active: HashMap::new(),
        }
    }

    pub fn with_fsync_per_record(mut self, enabled: bool) -> ArchiveWriter {
        self.fsync_per_record = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The active print for a sender, if any.
    pub fn active_print(&self, sender: &str) -> Option<&ActivePrint> {
        self.active.get(sender)
    }

    /// Drain the writer's hub subscription until the hub closes.
    pub async fn run(mut self, mut rx: queue::Receiver<Arc<Packet>>) {
        while let Some(packet) = rx.recv().await {
            if packet.error.is_some() {
                continue;
            }
            match self.handle_packet(&packet) {
                Ok(Some(path)) => debug!(path = %path.display(), "record appended"),
                Ok(None) => {}
                Err(e) => warn!(sender = %packet.sender, error = %e, "archive append failed"),
            }
        }
        debug!("archive writer stopped");
    }

    /// Run the state machine for one packet and persist it if the machine
    /// says so. Returns the path written, or `None` when the packet was
    /// dropped.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Option<PathBuf>, ArchiveError> {
        let filename = extract_print_filename(packet);
        match self.transition(&packet.sender, filename, packet.received_at) {
            Some(f) => self.append_record(&f, packet).map(Some),
            None => Ok(None),
        }
    }

    /// Apply one packet to the per-sender state machine; returns the
    /// filename to persist under, or `None` to drop the packet.
    fn transition(
        &mut self,
        sender: &str,
        filename: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        // A filename begins a new active print or supersedes the current
        // one; a repeated filename just refreshes last_seen.
        if let Some(f) = filename {
            self.active.insert(
                sender.to_owned(),
                ActivePrint {
                    filename: f.clone(),
                    last_seen: now,
                },
            );
            return Some(f);
        }

        // No filename: sticky within the timeout, expired after.
        let expired = match self.active.get(sender) {
            None => return None,
            Some(ap) => now.signed_duration_since(ap.last_seen) > self.print_end_timeout,
        };
        if expired {
            self.active.remove(sender);
            return None;
        }
        let ap = self.active.get_mut(sender)?;
        ap.last_seen = now;
        Some(ap.filename.clone())
    }

    /// Append one record under `<root>/<YYYY-MM-DD>/<sanitized>.records`.
    ///
    /// The file is opened in append mode per write and closed afterwards,
    /// so concurrent readers always see whole records plus at most one
    /// partial trailing line.
    fn append_record(&self, filename: &str, packet: &Packet) -> Result<PathBuf, ArchiveError> {
        let date = packet
            .received_at
            .with_timezone(&Local)
            .format("%Y-%m-%d")
            .to_string();
        let dir = self.root.join(&date);
        fs::create_dir_all(&dir)?;

        let stem = sanitize_filename(filename);
        if stem.is_empty() {
            return Err(ArchiveError::InvalidName(filename.to_owned()));
        }
        let path = dir.join(format!("{}.{}", stem, RECORDS_EXT));

        let mut line = serde_json::to_string(packet)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        if self.fsync_per_record {
            file.sync_data()?;
        }
        Ok(path)
    }
}

/// Scan a packet for a `print_filename` metric and extract its value.
///
/// Numeric values render directly; structured payloads yield the first
/// text-valued field, falling back to the first field rendered. Quotes are
/// stripped and whitespace trimmed; an empty result counts as absent.
pub fn extract_print_filename(packet: &Packet) -> Option<String> {
    let metric = packet.metrics.iter().find(|m| m.name == FILENAME_METRIC)?;
    let value = match &metric.payload {
        MetricPayload::Numeric { value } => scalar_to_string(value),
        MetricPayload::Structured { fields } => fields
            .iter()
            .find_map(|(_, v)| match v {
                Scalar::Text(s) => Some(s.clone()),
                _ => None,
            })
            .or_else(|| fields.iter().next().map(|(_, v)| scalar_to_string(v)))?,
        MetricPayload::Error { .. } | MetricPayload::Unknown { .. } => return None,
    };
    let cleaned = crate::frame::strip_quotes(&value).trim().to_owned();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn scalar_to_string(value: &Scalar) -> String {
    match value {
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s.clone(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
