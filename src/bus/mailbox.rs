//! Per-subscriber durable mailboxes and the lock-free drain protocol.
//!
//! A mailbox is one append-only `.jsonl` file. Draining claims the whole
//! file by renaming it to a uniquely named processing file (pid + millis in
//! the name, so concurrent drainers can never collide); losing the rename
//! race is indistinguishable from an empty mailbox and both return no
//! events. Atomic rename is the only synchronization primitive; there is no
//! lock file and no blocking wait.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::{BusError, Event};
use crate::config::sanitize_component;

/// Age after which an abandoned processing file (drainer died between
/// rename and delete) is rolled back into the mailbox.
const ORPHAN_AGE_MS: i64 = 10_000;

/// Per-subscriber durable queue files plus the pull-cursor offsets.
#[derive(Debug, Clone)]
pub struct MailboxStore {
    dir: PathBuf,
    offsets_path: PathBuf,
}

impl MailboxStore {
    pub fn new(dir: impl Into<PathBuf>, offsets_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            offsets_path: offsets_path.into(),
        }
    }

    fn mailbox_path(&self, subscriber_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", sanitize_component(subscriber_id)))
    }

    /// Append an event to a subscriber's mailbox, unless its seq is already
    /// covered by that subscriber's pull cursor. Returns whether the event
    /// was enqueued.
    pub fn enqueue(&self, subscriber_id: &str, event: &Event) -> Result<bool, BusError> {
        if event.seq <= self.offset(subscriber_id) {
            debug!(
                subscriber = subscriber_id,
                seq = event.seq,
                "skipping enqueue, seq behind pull cursor"
            );
            return Ok(false);
        }

        fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.mailbox_path(subscriber_id))?;
        writeln!(file, "{}", line)?;
        Ok(true)
    }

    /// Exclusively claim and remove the mailbox contents.
    ///
    /// Returns empty both when the mailbox is empty and when another drainer
    /// won the claim race this cycle; callers retry on their next poll tick
    /// either way. If reading fails after a successful claim, the processing
    /// file is renamed back so nothing is lost.
    pub fn drain(&self, subscriber_id: &str) -> Vec<Event> {
        let mailbox = self.mailbox_path(subscriber_id);
        self.recover_orphans(subscriber_id, &mailbox);

        let claim = self.dir.join(format!(
            "{}.{}.{}.processing",
            sanitize_component(subscriber_id),
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
        ));

        if fs::rename(&mailbox, &claim).is_err() {
            // Nothing to drain, or another process claimed it first.
            return Vec::new();
        }

        let contents = match fs::read_to_string(&claim) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(
                    subscriber = subscriber_id,
                    error = %e,
                    "drain read failed, rolling claim back"
                );
                let _ = fs::rename(&claim, &mailbox);
                return Vec::new();
            }
        };
        let _ = fs::remove_file(&claim);

        parse_lines(&contents)
    }

    /// Roll abandoned processing files back into the mailbox. A claim whose
    /// embedded timestamp is older than the orphan age belongs to a drainer
    /// that died between rename and delete.
    fn recover_orphans(&self, subscriber_id: &str, mailbox: &PathBuf) {
        let prefix = format!("{}.", sanitize_component(subscriber_id));
        let now_ms = chrono::Utc::now().timestamp_millis();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".processing") {
                continue;
            }
            let Some(claimed_ms) = claim_millis(name) else {
                continue;
            };
            if now_ms - claimed_ms < ORPHAN_AGE_MS {
                continue;
            }

            let orphan = entry.path();
            if mailbox.exists() {
                // Mailbox has grown again since the crash; fold the orphan
                // back in by appending.
                if let Ok(contents) = fs::read_to_string(&orphan) {
                    if let Ok(mut file) =
                        OpenOptions::new().create(true).append(true).open(mailbox)
                    {
                        if file.write_all(contents.as_bytes()).is_ok() {
                            let _ = fs::remove_file(&orphan);
                        }
                    }
                }
            } else if fs::rename(&orphan, mailbox).is_ok() {
                warn!(subscriber = subscriber_id, "recovered orphaned drain claim");
            }
        }
    }

    /// Read the mailbox without consuming it.
    pub fn peek(&self, subscriber_id: &str) -> Vec<Event> {
        match fs::read_to_string(self.mailbox_path(subscriber_id)) {
            Ok(contents) => parse_lines(&contents),
            Err(_) => Vec::new(),
        }
    }

    /// Unconditionally truncate the mailbox. Returns the count of entries
    /// cleared. Independent of the pull cursor.
    pub fn ack(&self, subscriber_id: &str) -> Result<usize, BusError> {
        let path = self.mailbox_path(subscriber_id);
        let count = match fs::read_to_string(&path) {
            Ok(contents) => parse_lines(&contents).len(),
            Err(_) => return Ok(0),
        };
        fs::write(&path, "")?;
        Ok(count)
    }

    /// Pull cursor for a subscriber, 0 if never advanced.
    pub fn offset(&self, subscriber_id: &str) -> u64 {
        self.load_offsets()
            .get(subscriber_id)
            .copied()
            .unwrap_or(0)
    }

    /// Persist a subscriber's pull cursor.
    pub fn set_offset(&self, subscriber_id: &str, seq: u64) -> Result<(), BusError> {
        let mut offsets = self.load_offsets();
        offsets.insert(subscriber_id.to_string(), seq);
        if let Some(parent) = self.offsets_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.offsets_path, serde_json::to_string_pretty(&offsets)?)?;
        Ok(())
    }

    fn load_offsets(&self) -> HashMap<String, u64> {
        match fs::read_to_string(&self.offsets_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }
}

/// Millis component of `{id}.{pid}.{millis}.processing`.
fn claim_millis(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".processing")?;
    let (_, millis) = stem.rsplit_once('.')?;
    millis.parse().ok()
}

fn parse_lines(contents: &str) -> Vec<Event> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Event>(line.trim()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in_temp() -> (TempDir, MailboxStore) {
        let temp = TempDir::new().unwrap();
        let store = MailboxStore::new(
            temp.path().join("mailboxes"),
            temp.path().join("offsets.json"),
        );
        (temp, store)
    }

    fn event_with_seq(seq: u64, text: &str) -> Event {
        Event {
            seq,
            ..Event::message("codex:pub1", "codex:abc1", text)
        }
    }

    #[test]
    fn test_enqueue_and_drain() {
        let (_temp, store) = store_in_temp();
        assert!(store.enqueue("codex:abc1", &event_with_seq(1, "hello")).unwrap());

        let drained = store.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["message"], "hello");

        // Mailbox is gone after a drain.
        assert!(store.drain("codex:abc1").is_empty());
    }

    #[test]
    fn test_enqueue_respects_pull_cursor() {
        let (_temp, store) = store_in_temp();
        store.set_offset("codex:abc1", 5).unwrap();

        assert!(!store.enqueue("codex:abc1", &event_with_seq(4, "old")).unwrap());
        assert!(!store.enqueue("codex:abc1", &event_with_seq(5, "edge")).unwrap());
        assert!(store.enqueue("codex:abc1", &event_with_seq(6, "new")).unwrap());

        let drained = store.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].seq, 6);
    }

    #[test]
    fn test_drain_empty_mailbox() {
        let (_temp, store) = store_in_temp();
        assert!(store.drain("codex:abc1").is_empty());
    }

    #[test]
    fn test_drain_exclusivity_between_two_stores() {
        // Two independent store handles over the same directory stand in for
        // two processes; only one sees each event.
        let (temp, store_a) = store_in_temp();
        let store_b = MailboxStore::new(
            temp.path().join("mailboxes"),
            temp.path().join("offsets.json"),
        );
        store_a
            .enqueue("codex:abc1", &event_with_seq(1, "only-once"))
            .unwrap();

        let a = store_a.drain("codex:abc1");
        let b = store_b.drain("codex:abc1");
        assert_eq!(a.len() + b.len(), 1);
    }

    #[test]
    fn test_orphaned_claim_recovered_on_retry() {
        let (_temp, store) = store_in_temp();
        store
            .enqueue("codex:abc1", &event_with_seq(1, "survives"))
            .unwrap();

        // Simulate a drainer that died after rename but before delete: the
        // claim timestamp in the name is well past the orphan age.
        let mailbox = store.mailbox_path("codex:abc1");
        let stale_claim = store
            .dir
            .join("codex_abc1.99999.1000.processing");
        fs::rename(&mailbox, &stale_claim).unwrap();

        let drained = store.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["message"], "survives");
    }

    #[test]
    fn test_orphan_recovery_scoped_to_exact_subscriber() {
        let (_temp, store) = store_in_temp();
        store
            .enqueue("agent.a.b", &event_with_seq(1, "for a.b"))
            .unwrap();

        // A dead drainer's stale claim for "agent.a.b". Sanitization maps
        // the dots away, so no other subscriber's prefix scan can match it.
        let mailbox = store.mailbox_path("agent.a.b");
        let stale = store.dir.join("agent_a_b.99999.1000.processing");
        fs::rename(&mailbox, &stale).unwrap();

        assert!(store.drain("agent.a").is_empty());
        assert!(stale.exists());

        let drained = store.drain("agent.a.b");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["message"], "for a.b");
    }

    #[test]
    fn test_fresh_claim_not_stolen() {
        let (_temp, store) = store_in_temp();
        store
            .enqueue("codex:abc1", &event_with_seq(1, "in-flight"))
            .unwrap();

        // Another drainer claimed moments ago; its claim must be left alone.
        let mailbox = store.mailbox_path("codex:abc1");
        let fresh_claim = store.dir.join(format!(
            "codex_abc1.99999.{}.processing",
            chrono::Utc::now().timestamp_millis()
        ));
        fs::rename(&mailbox, &fresh_claim).unwrap();

        assert!(store.drain("codex:abc1").is_empty());
        assert!(fresh_claim.exists());
    }

    #[test]
    fn test_ack_is_idempotent() {
        let (_temp, store) = store_in_temp();
        store.enqueue("codex:abc1", &event_with_seq(1, "a")).unwrap();
        store.enqueue("codex:abc1", &event_with_seq(2, "b")).unwrap();

        assert_eq!(store.ack("codex:abc1").unwrap(), 2);
        assert_eq!(store.ack("codex:abc1").unwrap(), 0);
        assert!(store.peek("codex:abc1").is_empty());
    }

    #[test]
    fn test_ack_missing_mailbox() {
        let (_temp, store) = store_in_temp();
        assert_eq!(store.ack("codex:never").unwrap(), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (_temp, store) = store_in_temp();
        store.enqueue("codex:abc1", &event_with_seq(1, "still-there")).unwrap();

        assert_eq!(store.peek("codex:abc1").len(), 1);
        assert_eq!(store.peek("codex:abc1").len(), 1);
        assert_eq!(store.drain("codex:abc1").len(), 1);
    }

    #[test]
    fn test_offsets_persist() {
        let (temp, store) = store_in_temp();
        store.set_offset("codex:abc1", 17).unwrap();

        let reopened = MailboxStore::new(
            temp.path().join("mailboxes"),
            temp.path().join("offsets.json"),
        );
        assert_eq!(reopened.offset("codex:abc1"), 17);
        assert_eq!(reopened.offset("codex:other"), 0);
    }

    #[test]
    fn test_malformed_mailbox_lines_skipped() {
        let (_temp, store) = store_in_temp();
        store.enqueue("codex:abc1", &event_with_seq(1, "good")).unwrap();
        let path = store.mailbox_path("codex:abc1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{broken").unwrap();

        let drained = store.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
    }
}
