//! Configuration for the bus and the PTY turn protocol.
//!
//! All timings live in [`RelayConfig`] so tests can shrink them; the on-disk
//! layout lives in [`BusPaths`].

use std::path::PathBuf;
use std::time::Duration;

/// What to do when a turn's watchdog ceiling expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutRecovery {
    /// Kill and respawn the PTY session.
    Restart,
    /// Hand the session over to the headless execution path.
    Fallback,
}

/// Tunables for mailbox polling, turn-taking, and session supervision.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cadence of the mailbox drain poll.
    pub poll_interval: Duration,
    /// No-output window after spawn before a session counts as ready.
    pub quiet_window: Duration,
    /// Delay between writing prompt text and sending Escape.
    pub settle_delay: Duration,
    /// Delay between Escape and Return.
    pub escape_delay: Duration,
    /// Ceiling on waiting for the prompt's own echo of the marker.
    pub echo_fallback: Duration,
    /// Debounce before flushing buffered output as a delta.
    pub flush_debounce: Duration,
    /// Maximum characters per streamed delta chunk.
    pub flush_chunk_chars: usize,
    /// No-output window that ends a turn with reason `idle`.
    pub idle_timeout: Duration,
    /// Hard ceiling on a single turn, armed once at turn start.
    pub watchdog_timeout: Duration,
    /// Recovery action when the watchdog fires.
    pub timeout_recovery: TimeoutRecovery,
    /// Restart attempts before giving up on PTY mode.
    pub max_restarts: u32,
    /// Base delay for linear restart backoff (attempt * base).
    pub restart_base_delay: Duration,
    /// Cap on any single restart delay.
    pub restart_max_delay: Duration,
    /// Run length after which the restart counter resets.
    pub stability_threshold: Duration,
    /// Bounded FIFO of not-yet-submitted turns; oldest dropped when full.
    pub turn_queue_capacity: usize,
    /// Capacity of the per-session raw output ring buffer.
    pub ring_buffer_capacity: usize,
    /// Cadence of subscriber liveness heartbeats.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a sweep marks a subscriber inactive.
    pub heartbeat_misses: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            quiet_window: Duration::from_secs(3),
            settle_delay: Duration::from_millis(200),
            escape_delay: Duration::from_millis(100),
            echo_fallback: Duration::from_millis(1500),
            flush_debounce: Duration::from_millis(120),
            flush_chunk_chars: 2000,
            idle_timeout: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(120),
            timeout_recovery: TimeoutRecovery::Restart,
            max_restarts: 3,
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(10),
            stability_threshold: Duration::from_secs(30),
            turn_queue_capacity: 200,
            ring_buffer_capacity: 512 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_misses: 3,
        }
    }
}

impl RelayConfig {
    /// Backoff delay before restart attempt `attempt` (1-based), linear and
    /// capped.
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let delay = self.restart_base_delay.saturating_mul(attempt.max(1));
        delay.min(self.restart_max_delay)
    }

    /// Time after which a heartbeat counts as stale.
    pub fn heartbeat_stale_after(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_misses.max(1))
    }
}

/// On-disk layout of the bus: event log partitions, mailboxes, registry and
/// offset files, per-session control sockets.
#[derive(Debug, Clone)]
pub struct BusPaths {
    /// Root data directory.
    pub root: PathBuf,
}

impl BusPaths {
    /// Resolve against `$XDG_DATA_HOME/switchyard` (or `~/.local/share`).
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join("switchyard");
        Self { root }
    }

    /// Place the whole layout under an explicit root (tests, embedders).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the date-partitioned event log.
    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    /// Directory holding per-subscriber mailbox files.
    pub fn mailboxes_dir(&self) -> PathBuf {
        self.root.join("mailboxes")
    }

    /// Subscriber registry file.
    pub fn subscribers_file(&self) -> PathBuf {
        self.root.join("subscribers.json")
    }

    /// Pull-cursor offsets file.
    pub fn offsets_file(&self) -> PathBuf {
        self.root.join("offsets.json")
    }

    /// Control socket path for one session.
    pub fn socket_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join("sockets")
            .join(format!("{}.sock", sanitize_component(session_id)))
    }

    /// Create every directory the layout needs.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.events_dir(),
            self.mailboxes_dir(),
            self.root.join("sockets"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for BusPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Make an arbitrary id safe to use as a single filename component. Dots
/// are rewritten too: `.` is reserved as the field separator in drain claim
/// filenames and must never appear inside a sanitized id.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
