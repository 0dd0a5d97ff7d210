//! Append-only JSONL provenance event log.

use crate::core::error::{Error, Result};
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Handle on an `events.jsonl` file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, timestamped now.
    pub fn append(&self, event: ProvenanceEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let te = TimestampedEvent {
            ts: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&te)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        writeln!(file, "{}", json).map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Append, logging instead of failing. Provenance never aborts an install.
    pub fn record(&self, event: ProvenanceEvent) {
        if let Err(e) = self.append(event) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot write event log");
        }
    }

    /// Read every event back, skipping lines that do not parse.
    pub fn read_all(&self) -> Result<Vec<TimestampedEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// Record through an optional log.
pub fn record(log: Option<&EventLog>, event: ProvenanceEvent) {
    if let Some(log) = log {
        log.record(event);
    }
}
