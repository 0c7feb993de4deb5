//! Append-only, date-partitioned event log.
//!
//! One file per day (`events-YYYY-MM-DD.jsonl`), one JSON event per line.
//! The log is the source of the global sequence counter: `next_seq` is
//! recovered by scanning partitions, never cached across processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use super::{BusError, Event};

const PARTITION_PREFIX: &str = "events-";
const PARTITION_SUFFIX: &str = ".jsonl";

/// Append-only event log living in a directory of date partitions.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Partition filenames, sorted ascending (dates sort lexicographically).
    fn partitions(&self) -> Vec<PathBuf> {
        let mut names: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(PARTITION_PREFIX) && n.ends_with(PARTITION_SUFFIX))
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn current_partition(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.dir
            .join(format!("{}{}{}", PARTITION_PREFIX, date, PARTITION_SUFFIX))
    }

    /// Next global sequence number: scan partitions newest-first, take the
    /// last valid line of each, return `max(seq) + 1`. Malformed lines are
    /// skipped; an unreadable or empty log yields 1.
    pub fn next_seq(&self) -> u64 {
        let mut max_seq = 0u64;
        for path in self.partitions().iter().rev() {
            if let Some(seq) = last_valid_seq(path) {
                max_seq = max_seq.max(seq);
            }
        }
        max_seq + 1
    }

    /// Assign the next sequence number and append the event as one line to
    /// the current partition. Never blocks on consumers.
    pub fn append(&self, mut event: Event) -> Result<Event, BusError> {
        fs::create_dir_all(&self.dir)?;
        event.seq = self.next_seq();

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_partition())?;
        writeln!(file, "{}", line)?;

        debug!(seq = event.seq, target = %event.target, "appended event");
        Ok(event)
    }

    /// All events across all partitions, oldest-first. Malformed lines are
    /// skipped, never fatal.
    pub fn scan(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for path in self.partitions() {
            let contents = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable partition");
                    continue;
                }
            };
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => events.push(event),
                    Err(_) => debug!(path = %path.display(), "skipping malformed log line"),
                }
            }
        }
        events
    }
}

/// Seq of the last parseable line in a partition, if any.
fn last_valid_seq(path: &Path) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<Event>(line.trim()).ok())
        .map(|event| event.seq)
}
