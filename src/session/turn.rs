//! Marker-based request/reply turn protocol.
//!
//! [`TurnEngine`] is a pure state machine: callers feed it output chunks and
//! clock ticks, and it returns the actions to perform (PTY writes, delta
//! emissions, turn completions). All timing is expressed as `Instant`
//! deadlines so tests drive the clock directly.
//!
//! Protocol per turn: write the composed prompt (message + print-the-marker
//! instruction), wait for the line editor to settle, send Escape to dismiss
//! any suggestion overlay, then Return to submit. Output is withheld until
//! the first marker occurrence (the prompt's own echo) has been discarded;
//! the second occurrence marks genuine completion.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::hygiene::{collapse_cr_overwrites, OutputHygiene};
use crate::config::RelayConfig;

/// Prefix shared by all completion markers; also blacklisted from replies.
pub const MARKER_PREFIX: &str = "SWYD";

/// Marker token unique per turn: wall-clock millis plus a random suffix,
/// never plausibly occurring in organic output.
pub fn generate_marker() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        MARKER_PREFIX,
        chrono::Utc::now().timestamp_millis(),
        &uuid[..8]
    )
}

/// One queued request for the wrapped agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Correlates deltas and the final reply.
    pub turn_id: String,
    /// Subscriber id the reply is routed back to.
    pub requester: String,
    /// The user-visible message for the agent.
    pub message: String,
}

impl TurnRequest {
    pub fn new(requester: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            requester: requester.into(),
            message: message.into(),
        }
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnReason {
    /// Completion marker observed.
    Marker,
    /// No output for the idle window.
    Idle,
    /// Watchdog ceiling expired.
    Timeout,
    /// The PTY child died mid-turn.
    Crash,
}

/// Actions the engine asks its driver to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Write composed prompt text to the PTY (no submit).
    WriteText(String),
    /// Send an Escape keystroke.
    SendEscape,
    /// Send a Return keystroke.
    SendReturn,
    /// Stream an incremental output delta to the requester.
    EmitDelta {
        requester: String,
        turn_id: String,
        text: String,
    },
    /// The turn is over; deliver the full body with its reason.
    CompleteTurn {
        requester: String,
        turn_id: String,
        body: String,
        reason: TurnReason,
    },
}

struct ActiveTurn {
    request: TurnRequest,
    marker: String,
    /// Full ANSI-stripped transcript since suppression exit. Kept whole so
    /// CR overwrites split across chunks still collapse correctly when the
    /// final body is rendered.
    buffer: String,
    /// Prefix of `buffer` already streamed as deltas.
    delivered_len: usize,
    /// Echo of the submitted prompt not yet discarded.
    suppressing: bool,
}

/// The per-session turn state machine. One turn in flight; extra requests
/// wait in a bounded FIFO that drops its oldest entry when full.
pub struct TurnEngine {
    config: RelayConfig,
    hygiene: OutputHygiene,
    queue: VecDeque<TurnRequest>,
    current: Option<ActiveTurn>,
    settle_deadline: Option<Instant>,
    return_deadline: Option<Instant>,
    suppress_deadline: Option<Instant>,
    flush_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    watchdog_deadline: Option<Instant>,
}

impl TurnEngine {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            hygiene: OutputHygiene::new(MARKER_PREFIX),
            queue: VecDeque::new(),
            current: None,
            settle_deadline: None,
            return_deadline: None,
            suppress_deadline: None,
            flush_deadline: None,
            idle_deadline: None,
            watchdog_deadline: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Earliest pending deadline, if any; the driver sleeps until it.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.settle_deadline,
            self.return_deadline,
            self.suppress_deadline,
            self.flush_deadline,
            self.idle_deadline,
            self.watchdog_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Submit a request: starts it immediately when idle, otherwise queues
    /// it (dropping the oldest queued turn when the FIFO is full).
    pub fn submit(&mut self, request: TurnRequest, now: Instant) -> Vec<EngineAction> {
        if self.current.is_some() {
            self.enqueue(request);
            return Vec::new();
        }
        self.start_turn(request, now)
    }

    /// Queue a request without starting it, even when idle. Used while the
    /// session is not ready to run turns; `resume` starts it later.
    pub fn enqueue(&mut self, request: TurnRequest) {
        if self.queue.len() >= self.config.turn_queue_capacity {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(turn_id = %dropped.turn_id, "turn queue full, dropping oldest");
            }
        }
        self.queue.push_back(request);
    }

    fn start_turn(&mut self, request: TurnRequest, now: Instant) -> Vec<EngineAction> {
        let marker = generate_marker();
        let composed = format!(
            "{}\n\nWhen you have completely finished this request, print exactly {} alone on its own line.",
            request.message, marker
        );

        debug!(turn_id = %request.turn_id, requester = %request.requester, "starting turn");
        self.current = Some(ActiveTurn {
            request,
            marker,
            buffer: String::new(),
            delivered_len: 0,
            suppressing: true,
        });
        self.settle_deadline = Some(now + self.config.settle_delay);
        self.return_deadline = None;
        self.suppress_deadline = Some(now + self.config.echo_fallback);
        self.flush_deadline = None;
        // Idle arms on the first output chunk; only the watchdog bounds a
        // turn that never produces output.
        self.idle_deadline = None;
        self.watchdog_deadline = Some(now + self.config.watchdog_timeout);

        vec![EngineAction::WriteText(composed)]
    }

    /// Feed one raw PTY output chunk.
    pub fn on_output(&mut self, bytes: &[u8], now: Instant) -> Vec<EngineAction> {
        let cleaned = self.hygiene.clean_chunk(bytes);
        let Some(turn) = self.current.as_mut() else {
            // No turn in flight: organic output is the distributor's
            // concern, not ours.
            return Vec::new();
        };

        turn.buffer.push_str(&cleaned);
        self.idle_deadline = Some(now + self.config.idle_timeout);

        if turn.suppressing {
            if let Some(idx) = turn.buffer.find(&turn.marker) {
                // First occurrence is the prompt's own echo.
                let after = idx + turn.marker.len();
                let rest = turn.buffer.split_off(after);
                turn.buffer = strip_leading_blank_lines(&rest).to_string();
                turn.suppressing = false;
                self.suppress_deadline = None;
            }
        }

        let Some(turn) = self.current.as_ref() else {
            return Vec::new();
        };
        if turn.suppressing {
            return Vec::new();
        }

        if self.marker_present() {
            return self.finish_turn(TurnReason::Marker, now);
        }
        if !self.pending_is_empty() && self.flush_deadline.is_none() {
            self.flush_deadline = Some(now + self.config.flush_debounce);
        }
        Vec::new()
    }

    fn pending_is_empty(&self) -> bool {
        self.current
            .as_ref()
            .map(|t| t.buffer.len() <= t.delivered_len)
            .unwrap_or(true)
    }

    fn marker_present(&self) -> bool {
        self.current
            .as_ref()
            .map(|t| t.buffer.contains(&t.marker))
            .unwrap_or(false)
    }

    /// Advance timers. Call whenever `next_deadline()` elapses.
    pub fn poll(&mut self, now: Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if fired(self.settle_deadline, now) {
            self.settle_deadline = None;
            self.return_deadline = Some(now + self.config.escape_delay);
            actions.push(EngineAction::SendEscape);
        }
        if fired(self.return_deadline, now) {
            self.return_deadline = None;
            actions.push(EngineAction::SendReturn);
        }

        if fired(self.suppress_deadline, now) {
            self.suppress_deadline = None;
            let mut exited = false;
            if let Some(turn) = self.current.as_mut() {
                if turn.suppressing {
                    // Echo never observed; resume processing rather than
                    // stalling the turn forever.
                    warn!(turn_id = %turn.request.turn_id, "echo marker not observed before fallback");
                    turn.suppressing = false;
                    exited = true;
                }
            }
            if exited {
                if self.marker_present() {
                    actions.extend(self.finish_turn(TurnReason::Marker, now));
                    return actions;
                }
                if !self.pending_is_empty() {
                    self.flush_deadline = Some(now + self.config.flush_debounce);
                }
            }
        }

        if fired(self.flush_deadline, now) {
            self.flush_deadline = None;
            actions.extend(self.flush_pending());
        }

        if fired(self.idle_deadline, now) && self.current.is_some() {
            actions.extend(self.finish_turn(TurnReason::Idle, now));
            return actions;
        }

        if fired(self.watchdog_deadline, now) && self.current.is_some() {
            warn!("watchdog ceiling expired mid-turn");
            actions.extend(self.finish_turn(TurnReason::Timeout, now));
            return actions;
        }

        actions
    }

    /// Stream the not-yet-delivered tail of the transcript as size-bounded
    /// deltas. The transcript itself stays whole for the final render.
    fn flush_pending(&mut self) -> Vec<EngineAction> {
        let Some(turn) = self.current.as_mut() else {
            return Vec::new();
        };
        if turn.suppressing || turn.buffer.len() <= turn.delivered_len {
            return Vec::new();
        }

        let pending = collapse_cr_overwrites(&turn.buffer[turn.delivered_len..]);
        turn.delivered_len = turn.buffer.len();
        let text = self.hygiene.filter_lines(&pending);

        let mut actions = Vec::new();
        for chunk in chunk_chars(&text, self.config.flush_chunk_chars) {
            actions.push(EngineAction::EmitDelta {
                requester: turn.request.requester.clone(),
                turn_id: turn.request.turn_id.clone(),
                text: chunk,
            });
        }
        actions
    }

    /// End the current turn and, when the session will stay up, start the
    /// next queued one.
    fn finish_turn(&mut self, reason: TurnReason, now: Instant) -> Vec<EngineAction> {
        let Some(turn) = self.current.take() else {
            return Vec::new();
        };
        self.clear_deadlines();

        // The full transcript up to the marker, collapsed as a terminal
        // would render it.
        let remainder = match turn.buffer.find(&turn.marker) {
            Some(idx) => &turn.buffer[..idx],
            None => turn.buffer.as_str(),
        };
        let body = self.hygiene.filter_lines(&collapse_cr_overwrites(remainder));

        let mut actions = vec![EngineAction::CompleteTurn {
            requester: turn.request.requester.clone(),
            turn_id: turn.request.turn_id.clone(),
            body: body.trim_end().to_string(),
            reason,
        }];

        // A crash waits for the respawn, and a timeout is about to kill the
        // child; either way the queue must not be typed into a PTY that is
        // going away. `resume` picks it up once the session is ready again.
        if !matches!(reason, TurnReason::Crash | TurnReason::Timeout) {
            if let Some(next) = self.queue.pop_front() {
                actions.extend(self.start_turn(next, now));
            }
        }
        actions
    }

    /// Start the next queued turn if nothing is in flight. Called when the
    /// session becomes ready again after a respawn.
    pub fn resume(&mut self, now: Instant) -> Vec<EngineAction> {
        if self.current.is_some() {
            return Vec::new();
        }
        match self.queue.pop_front() {
            Some(next) => self.start_turn(next, now),
            None => Vec::new(),
        }
    }

    /// The PTY child exited. A turn in flight ends with reason `crash`; the
    /// queue is kept for after the respawn.
    pub fn on_process_exit(&mut self, now: Instant) -> Vec<EngineAction> {
        if self.current.is_some() {
            self.finish_turn(TurnReason::Crash, now)
        } else {
            Vec::new()
        }
    }

    /// Hand every pending turn over for fallback execution: the in-flight
    /// turn (if any) first, then the queue in order.
    pub fn drain_for_fallback(&mut self) -> Vec<TurnRequest> {
        self.clear_deadlines();
        let mut pending = Vec::new();
        if let Some(turn) = self.current.take() {
            pending.push(turn.request);
        }
        pending.extend(self.queue.drain(..));
        pending
    }

    fn clear_deadlines(&mut self) {
        self.settle_deadline = None;
        self.return_deadline = None;
        self.suppress_deadline = None;
        self.flush_deadline = None;
        self.idle_deadline = None;
        self.watchdog_deadline = None;
    }
}

fn fired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map(|d| now >= d).unwrap_or(false)
}

/// Split text into chunks of at most `max_chars` characters.
fn chunk_chars(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count >= max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Drop a leading run of blank lines.
fn strip_leading_blank_lines(text: &str) -> &str {
    let mut rest = text;
    while let Some((first, tail)) = rest.split_once('\n') {
        if first.trim().is_empty() {
            rest = tail;
        } else {
            break;
        }
    }
    rest
}
