//! PTY session lifecycle: spawn, warmup, restart backoff, fallback.
//!
//! Like the turn engine this is a clock-injected state machine; the runner
//! performs the [`ControlAction`]s it returns.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;

/// Lifecycle states of one supervised PTY session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Deliberately stopped; terminal.
    Stopped,
    /// Spawn requested, child not yet confirmed.
    Starting,
    /// Child running, startup noise being discarded.
    Warmup,
    /// Ready for a turn.
    ReadyIdle,
    /// A turn is in flight.
    Busy,
    /// Crashed; respawn scheduled.
    Restarting,
    /// Restart budget exhausted; headless execution only. Terminal for
    /// PTY mode.
    Fallback,
}

/// Actions the controller asks its driver to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Spawn a fresh PTY child (the new generation).
    Spawn,
    /// Kill the current child.
    Kill,
    /// Hand pending turns to the headless executor; no more PTY spawns.
    EngageFallback,
}

/// Per-session lifecycle state machine.
pub struct PtySessionController {
    config: RelayConfig,
    state: SessionState,
    /// Bumped on every spawn; exit events from older generations are stale.
    generation: u64,
    restart_count: u32,
    last_spawn: Option<Instant>,
    warmup_deadline: Option<Instant>,
    respawn_deadline: Option<Instant>,
}

impl PtySessionController {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: SessionState::Stopped,
            generation: 0,
            restart_count: 0,
            last_spawn: None,
            warmup_deadline: None,
            respawn_deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation tag to attach to the next spawned child's exit event.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Warmup output is startup noise and never delivered.
    pub fn in_warmup(&self) -> bool {
        self.state == SessionState::Warmup
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.warmup_deadline, self.respawn_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Begin a session from Stopped.
    pub fn start(&mut self) -> Vec<ControlAction> {
        if self.state != SessionState::Stopped {
            return Vec::new();
        }
        self.generation += 1;
        self.state = SessionState::Starting;
        vec![ControlAction::Spawn]
    }

    /// The driver confirmed the child is up; warmup begins.
    pub fn on_spawned(&mut self, now: Instant) {
        self.state = SessionState::Warmup;
        self.last_spawn = Some(now);
        self.warmup_deadline = Some(now + self.config.quiet_window);
        debug!(generation = self.generation, "PTY child spawned, warming up");
    }

    /// Output arrived. During warmup this pushes the quiet window out.
    pub fn on_output(&mut self, now: Instant) {
        if self.state == SessionState::Warmup {
            self.warmup_deadline = Some(now + self.config.quiet_window);
        }
    }

    /// The turn engine went busy or idle.
    pub fn set_busy(&mut self, busy: bool) {
        match (self.state, busy) {
            (SessionState::ReadyIdle, true) => self.state = SessionState::Busy,
            (SessionState::Busy, false) => self.state = SessionState::ReadyIdle,
            _ => {}
        }
    }

    /// Advance timers: end of warmup, scheduled respawns.
    pub fn poll(&mut self, now: Instant) -> Vec<ControlAction> {
        let mut actions = Vec::new();

        if let Some(deadline) = self.warmup_deadline {
            if now >= deadline && self.state == SessionState::Warmup {
                self.warmup_deadline = None;
                self.state = SessionState::ReadyIdle;
                info!(generation = self.generation, "session ready");
            }
        }

        if let Some(deadline) = self.respawn_deadline {
            if now >= deadline && self.state == SessionState::Restarting {
                self.respawn_deadline = None;
                self.generation += 1;
                self.state = SessionState::Starting;
                actions.push(ControlAction::Spawn);
            }
        }

        actions
    }

    /// A child exited. Stale generations (superseded by a manual restart)
    /// and deliberate stops take no action; crashes schedule a respawn with
    /// linear backoff until the budget runs out.
    pub fn on_exit(&mut self, generation: u64, now: Instant) -> Vec<ControlAction> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "ignoring stale exit");
            return Vec::new();
        }
        if self.state == SessionState::Stopped || self.state == SessionState::Fallback {
            return Vec::new();
        }

        let run_duration = self.last_spawn.map(|t| now.duration_since(t));
        let stable = run_duration
            .map(|d| d > self.config.stability_threshold)
            .unwrap_or(false);
        if stable {
            self.restart_count = 1;
        } else {
            self.restart_count += 1;
        }

        if self.restart_count > self.config.max_restarts {
            error!(
                restarts = self.restart_count - 1,
                "restart budget exhausted, switching to fallback execution"
            );
            self.state = SessionState::Fallback;
            self.warmup_deadline = None;
            self.respawn_deadline = None;
            return vec![ControlAction::EngageFallback];
        }

        let delay = self.config.restart_delay(self.restart_count);
        warn!(
            attempt = self.restart_count,
            delay_ms = delay.as_millis() as u64,
            "PTY child exited unexpectedly, scheduling respawn"
        );
        self.state = SessionState::Restarting;
        self.warmup_deadline = None;
        self.respawn_deadline = Some(now + delay);
        Vec::new()
    }

    /// Abandon PTY mode immediately, regardless of the restart budget.
    pub fn force_fallback(&mut self) -> Vec<ControlAction> {
        if self.state == SessionState::Stopped || self.state == SessionState::Fallback {
            return Vec::new();
        }
        self.generation += 1;
        self.state = SessionState::Fallback;
        self.warmup_deadline = None;
        self.respawn_deadline = None;
        vec![ControlAction::Kill, ControlAction::EngageFallback]
    }

    /// Restart on purpose. The generation bumps before the kill so the old
    /// child's exit event is recognized as stale and takes no action.
    pub fn manual_restart(&mut self) -> Vec<ControlAction> {
        if self.state == SessionState::Stopped || self.state == SessionState::Fallback {
            return Vec::new();
        }
        self.generation += 1;
        self.state = SessionState::Starting;
        self.warmup_deadline = None;
        self.respawn_deadline = None;
        vec![ControlAction::Kill, ControlAction::Spawn]
    }

    /// Deliberate stop; terminal.
    pub fn stop(&mut self) -> Vec<ControlAction> {
        if self.state == SessionState::Stopped {
            return Vec::new();
        }
        self.generation += 1;
        self.state = SessionState::Stopped;
        self.warmup_deadline = None;
        self.respawn_deadline = None;
        vec![ControlAction::Kill]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> PtySessionController {
        PtySessionController::new(RelayConfig::default())
    }

    fn spawn_and_warm(ctl: &mut PtySessionController, now: Instant) -> Instant {
        assert_eq!(ctl.start(), vec![ControlAction::Spawn]);
        ctl.on_spawned(now);
        let ready_at = now + RelayConfig::default().quiet_window;
        ctl.poll(ready_at);
        assert_eq!(ctl.state(), SessionState::ReadyIdle);
        ready_at
    }

    #[test]
    fn test_warmup_waits_for_quiet_window() {
        let mut ctl = controller();
        let now = Instant::now();
        ctl.start();
        ctl.on_spawned(now);
        assert_eq!(ctl.state(), SessionState::Warmup);

        // Output during warmup pushes readiness out.
        let later = now + Duration::from_secs(2);
        ctl.on_output(later);
        ctl.poll(now + Duration::from_secs(3));
        assert_eq!(ctl.state(), SessionState::Warmup);

        ctl.poll(later + Duration::from_secs(3));
        assert_eq!(ctl.state(), SessionState::ReadyIdle);
    }

    #[test]
    fn test_restart_backoff_is_linear() {
        let mut ctl = controller();
        let config = RelayConfig::default();
        let mut now = Instant::now();
        ctl.start();
        ctl.on_spawned(now);

        for attempt in 1..=3u32 {
            now += Duration::from_secs(2); // well inside the stability window
            let actions = ctl.on_exit(ctl.generation(), now);
            assert!(actions.is_empty());
            assert_eq!(ctl.state(), SessionState::Restarting);
            assert_eq!(ctl.restart_count(), attempt);
            assert_eq!(
                ctl.next_deadline().unwrap(),
                now + config.restart_base_delay * attempt
            );

            now += config.restart_base_delay * attempt;
            assert_eq!(ctl.poll(now), vec![ControlAction::Spawn]);
            ctl.on_spawned(now);
        }
    }

    #[test]
    fn test_fourth_crash_engages_fallback() {
        let mut ctl = controller();
        let mut now = Instant::now();
        ctl.start();
        ctl.on_spawned(now);

        for _ in 0..3 {
            now += Duration::from_secs(1);
            ctl.on_exit(ctl.generation(), now);
            now += Duration::from_secs(5);
            ctl.poll(now);
            ctl.on_spawned(now);
        }

        now += Duration::from_secs(1);
        let actions = ctl.on_exit(ctl.generation(), now);
        assert_eq!(actions, vec![ControlAction::EngageFallback]);
        assert_eq!(ctl.state(), SessionState::Fallback);
        // No respawn ever gets scheduled again.
        assert!(ctl.next_deadline().is_none());
        assert!(ctl.on_exit(ctl.generation(), now).is_empty());
    }

    #[test]
    fn test_stable_run_resets_restart_counter() {
        let mut ctl = controller();
        let mut now = Instant::now();
        ctl.start();
        ctl.on_spawned(now);

        // Two quick crashes.
        for _ in 0..2 {
            now += Duration::from_secs(1);
            ctl.on_exit(ctl.generation(), now);
            now += Duration::from_secs(5);
            ctl.poll(now);
            ctl.on_spawned(now);
        }
        assert_eq!(ctl.restart_count(), 2);

        // A long stable run, then a crash: counter resets to 1.
        now += Duration::from_secs(60);
        ctl.on_exit(ctl.generation(), now);
        assert_eq!(ctl.restart_count(), 1);
        assert_eq!(ctl.state(), SessionState::Restarting);
    }

    #[test]
    fn test_manual_restart_stales_old_exit() {
        let mut ctl = controller();
        let now = Instant::now();
        spawn_and_warm(&mut ctl, now);

        let old_generation = ctl.generation();
        let actions = ctl.manual_restart();
        assert_eq!(actions, vec![ControlAction::Kill, ControlAction::Spawn]);

        // The killed child's exit arrives late and is ignored.
        let actions = ctl.on_exit(old_generation, now + Duration::from_secs(1));
        assert!(actions.is_empty());
        assert_eq!(ctl.state(), SessionState::Starting);
        assert_eq!(ctl.restart_count(), 0);
    }

    #[test]
    fn test_deliberate_stop_is_terminal() {
        let mut ctl = controller();
        let now = Instant::now();
        spawn_and_warm(&mut ctl, now);

        let old_generation = ctl.generation();
        assert_eq!(ctl.stop(), vec![ControlAction::Kill]);
        assert_eq!(ctl.state(), SessionState::Stopped);

        assert!(ctl.on_exit(old_generation, now).is_empty());
        assert_eq!(ctl.state(), SessionState::Stopped);
    }

    #[test]
    fn test_busy_transitions() {
        let mut ctl = controller();
        let now = Instant::now();
        spawn_and_warm(&mut ctl, now);

        ctl.set_busy(true);
        assert_eq!(ctl.state(), SessionState::Busy);
        ctl.set_busy(false);
        assert_eq!(ctl.state(), SessionState::ReadyIdle);

        // Busy flags are ignored outside ReadyIdle/Busy.
        ctl.stop();
        ctl.set_busy(true);
        assert_eq!(ctl.state(), SessionState::Stopped);
    }
}
