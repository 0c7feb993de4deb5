//! Supervised PTY sessions: one task per wrapped agent, gluing the bus,
//! the turn engine, the lifecycle controller, and output distribution.

pub mod controller;
pub mod headless;
pub mod hygiene;
pub mod turn;

pub use controller::{ControlAction, PtySessionController, SessionState};
pub use headless::{CommandExecutor, HeadlessExecutor};
pub use turn::{TurnReason, TurnRequest};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Event, EventKind, JoinRequest, LaunchMode, MessageRouter};
use crate::config::{BusPaths, RelayConfig, TimeoutRecovery};
use crate::output::{AlacrittyScreen, Backfill, OutputDistributor, ScreenModel, SubscribeMode};
use crate::pty::{AgentPtyConfig, PtyEvent, PtyHandle, PtySpawner};
use hygiene::{contains_cursor_query, CURSOR_REPLY};
use turn::EngineAction;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session terminated")]
    Terminated,
}

/// Commands accepted by a running session task.
pub enum SessionCommand {
    /// Submit a turn on behalf of `requester`.
    Inject { requester: String, message: String },
    /// Write raw bytes (keystrokes) to the PTY.
    Raw(Vec<u8>),
    /// Resize the PTY and the screen model.
    Resize { cols: u16, rows: u16 },
    /// Attach a live output observer.
    Subscribe {
        mode: SubscribeMode,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<(u64, Backfill)>,
    },
    /// Detach an observer.
    Unsubscribe(u64),
    /// Serialize the screen model.
    Snapshot {
        mode: SubscribeMode,
        reply: oneshot::Sender<String>,
    },
    /// Kill and respawn the agent.
    Restart,
    /// Stop the session for good.
    Shutdown,
}

/// Cheap cloneable handle to a session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Terminated)
    }

    pub fn inject(&self, requester: &str, message: &str) -> Result<(), SessionError> {
        self.send(SessionCommand::Inject {
            requester: requester.to_string(),
            message: message.to_string(),
        })
    }

    pub fn write_raw(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.send(SessionCommand::Raw(bytes))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.send(SessionCommand::Resize { cols, rows })
    }

    pub async fn subscribe(
        &self,
        mode: SubscribeMode,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(u64, Backfill), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe { mode, tx, reply })?;
        rx.await.map_err(|_| SessionError::Terminated)
    }

    pub fn unsubscribe(&self, observer: u64) -> Result<(), SessionError> {
        self.send(SessionCommand::Unsubscribe(observer))
    }

    pub async fn snapshot(&self, mode: SubscribeMode) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { mode, reply })?;
        rx.await.map_err(|_| SessionError::Terminated)
    }

    pub fn restart(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Restart)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }
}

/// One supervised agent session. Built by [`SessionRegistry::launch`] (or
/// directly in tests) and consumed by [`PtySession::run`].
pub struct PtySession {
    id: String,
    config: RelayConfig,
    router: MessageRouter,
    spawner: Box<dyn PtySpawner>,
    headless: Arc<dyn HeadlessExecutor>,
    controller: PtySessionController,
    engine: turn::TurnEngine,
    distributor: OutputDistributor,
    handle: Option<Box<dyn PtyHandle>>,
    pty_events: Option<mpsc::UnboundedReceiver<PtyEvent>>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl PtySession {
    pub fn new(
        id: impl Into<String>,
        config: RelayConfig,
        router: MessageRouter,
        spawner: Box<dyn PtySpawner>,
        headless: Arc<dyn HeadlessExecutor>,
        screen: Box<dyn ScreenModel>,
    ) -> (Self, SessionHandle) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: id.clone(),
            commands: tx,
        };
        let session = Self {
            id,
            controller: PtySessionController::new(config.clone()),
            engine: turn::TurnEngine::new(config.clone()),
            distributor: OutputDistributor::new(config.ring_buffer_capacity, screen),
            config,
            router,
            spawner,
            headless,
            handle: None,
            pty_events: None,
            commands: rx,
        };
        (session, handle)
    }

    /// Drive the session until shutdown.
    pub async fn run(mut self) {
        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let actions = self.controller.start();
        self.apply_control(actions);

        loop {
            let wake = [self.engine.next_deadline(), self.controller.next_deadline()]
                .into_iter()
                .flatten()
                .min()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                event = next_pty_event(&mut self.pty_events) => {
                    self.handle_pty_event(event);
                }
                _ = poll_tick.tick() => self.poll_mailbox(),
                _ = heartbeat_tick.tick() => self.heartbeat(),
                _ = tokio::time::sleep_until(wake) => self.tick(),
            }
        }

        let actions = self.controller.stop();
        self.apply_control(actions);
        match self.router.registry().leave(&self.id) {
            Ok(()) => {
                if let Err(e) = self.router.record_lifecycle(
                    EventKind::Leave,
                    "subscriber.leave",
                    &self.id,
                    Value::Null,
                ) {
                    debug!(session = %self.id, error = %e, "leave event not recorded");
                }
            }
            Err(e) => debug!(session = %self.id, error = %e, "leave on shutdown failed"),
        }
        info!(session = %self.id, "session stopped");
    }

    /// Refresh registry liveness and log the heartbeat event.
    fn heartbeat(&mut self) {
        if let Err(e) = self.router.registry().heartbeat(&self.id) {
            debug!(session = %self.id, error = %e, "heartbeat failed");
            return;
        }
        if let Err(e) = self.router.record_lifecycle(
            EventKind::Heartbeat,
            "subscriber.heartbeat",
            &self.id,
            Value::Null,
        ) {
            debug!(session = %self.id, error = %e, "heartbeat event not recorded");
        }
    }

    /// Advance both state machines' timers.
    fn tick(&mut self) {
        let now = now();
        let engine_actions = self.engine.poll(now);
        self.apply_engine(engine_actions);

        let was_ready = matches!(
            self.controller.state(),
            SessionState::ReadyIdle | SessionState::Busy
        );
        let control = self.controller.poll(now);
        self.apply_control(control);

        if !was_ready && self.controller.state() == SessionState::ReadyIdle {
            let resumed = self.engine.resume(now);
            self.apply_engine(resumed);
        }
        self.controller.set_busy(self.engine.is_busy());
    }

    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Inject { requester, message } => {
                self.accept_request(TurnRequest::new(requester, message));
            }
            SessionCommand::Raw(bytes) => {
                if let Some(handle) = &self.handle {
                    handle.write(bytes);
                }
            }
            SessionCommand::Resize { cols, rows } => {
                if let Some(handle) = &self.handle {
                    handle.resize(cols, rows);
                }
                self.distributor.resize(cols, rows);
            }
            SessionCommand::Subscribe { mode, tx, reply } => {
                let _ = reply.send(self.distributor.subscribe(mode, tx));
            }
            SessionCommand::Unsubscribe(observer) => self.distributor.unsubscribe(observer),
            SessionCommand::Snapshot { mode, reply } => {
                let _ = reply.send(self.distributor.snapshot(mode));
            }
            SessionCommand::Restart => {
                info!(session = %self.id, "manual restart requested");
                let actions = self.controller.manual_restart();
                self.apply_control(actions);
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }

    fn handle_pty_event(&mut self, event: PtyEvent) {
        let now = now();
        match event {
            PtyEvent::Output(bytes) => {
                if contains_cursor_query(&bytes) {
                    if let Some(handle) = &self.handle {
                        handle.write(CURSOR_REPLY.to_vec());
                    }
                }
                self.distributor.feed(&bytes);
                self.controller.on_output(now);
                // Warmup output is startup noise; the turn engine never
                // sees it.
                if !self.controller.in_warmup() {
                    let actions = self.engine.on_output(&bytes, now);
                    self.apply_engine(actions);
                }
            }
            PtyEvent::Exit(code) => {
                info!(session = %self.id, code = ?code, "PTY child exited");
                self.handle = None;
                self.pty_events = None;
                let actions = self.engine.on_process_exit(now);
                self.apply_engine(actions);
                let control = self.controller.on_exit(self.controller.generation(), now);
                self.apply_control(control);
            }
            PtyEvent::Error(message) => {
                warn!(session = %self.id, error = %message, "PTY error");
            }
        }
        self.controller.set_busy(self.engine.is_busy());
    }

    /// Exclusively drain our mailbox and turn message events into turns.
    /// Skipped until the session can actually run them; events wait safely
    /// in the durable mailbox.
    fn poll_mailbox(&mut self) {
        let ready = matches!(
            self.controller.state(),
            SessionState::ReadyIdle | SessionState::Busy | SessionState::Fallback
        );
        if !ready {
            return;
        }
        for event in self.router.drain(&self.id) {
            if event.kind != EventKind::Message || event.publisher_id == self.id {
                continue;
            }
            let Some(message) = event.payload.get("message").and_then(|v| v.as_str()) else {
                continue;
            };
            self.accept_request(TurnRequest::new(event.publisher_id.clone(), message));
        }
    }

    fn accept_request(&mut self, request: TurnRequest) {
        match self.controller.state() {
            SessionState::Fallback => self.run_headless(request),
            SessionState::ReadyIdle | SessionState::Busy => {
                let actions = self.engine.submit(request, now());
                self.apply_engine(actions);
            }
            // Not ready yet; the turn starts once warmup (or a respawn)
            // completes.
            _ => self.engine.enqueue(request),
        }
    }

    fn apply_engine(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::WriteText(text) => {
                    if let Some(handle) = &self.handle {
                        handle.write_str(&text);
                    }
                }
                EngineAction::SendEscape => {
                    if let Some(handle) = &self.handle {
                        handle.write(b"\x1b".to_vec());
                    }
                }
                EngineAction::SendReturn => {
                    if let Some(handle) = &self.handle {
                        handle.write(b"\r".to_vec());
                    }
                }
                EngineAction::EmitDelta {
                    requester,
                    turn_id,
                    text,
                } => {
                    self.route_reply(
                        &requester,
                        "turn.delta",
                        json!({ "turn_id": turn_id, "message": text, "done": false }),
                    );
                }
                EngineAction::CompleteTurn {
                    requester,
                    turn_id,
                    body,
                    reason,
                } => {
                    self.route_reply(
                        &requester,
                        "turn.reply",
                        json!({ "turn_id": turn_id, "message": body, "done": true, "reason": reason }),
                    );
                    if reason == TurnReason::Timeout {
                        let recovery = match self.config.timeout_recovery {
                            TimeoutRecovery::Restart => self.controller.manual_restart(),
                            TimeoutRecovery::Fallback => self.controller.force_fallback(),
                        };
                        self.apply_control(recovery);
                    }
                }
            }
        }
        self.controller.set_busy(self.engine.is_busy());
    }

    fn apply_control(&mut self, actions: Vec<ControlAction>) {
        let mut pending: VecDeque<ControlAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                ControlAction::Spawn => match self.spawner.spawn() {
                    Ok(spawned) => {
                        self.handle = Some(spawned.handle);
                        self.pty_events = Some(spawned.events);
                        self.controller.on_spawned(now());
                    }
                    Err(e) => {
                        warn!(session = %self.id, error = %e, "PTY spawn failed");
                        pending.extend(
                            self.controller
                                .on_exit(self.controller.generation(), now()),
                        );
                    }
                },
                ControlAction::Kill => {
                    if let Some(handle) = self.handle.take() {
                        handle.kill();
                    }
                    self.pty_events = None;
                }
                ControlAction::EngageFallback => self.engage_fallback(),
            }
        }
    }

    /// Hand every pending turn to the headless executor and tell the
    /// requesters PTY mode is gone.
    fn engage_fallback(&mut self) {
        let pending = self.engine.drain_for_fallback();
        let requesters: BTreeSet<String> = pending.iter().map(|r| r.requester.clone()).collect();
        for requester in requesters {
            self.route_reply(
                &requester,
                "session.fallback",
                json!({ "session": self.id, "reason": "restart_exhausted" }),
            );
        }
        for request in pending {
            self.run_headless(request);
        }
    }

    fn run_headless(&self, request: TurnRequest) {
        let executor = Arc::clone(&self.headless);
        let router = self.router.clone();
        let session_id = self.id.clone();
        tokio::spawn(async move {
            let payload = match executor.execute(&request).await {
                Ok(body) => {
                    json!({ "turn_id": request.turn_id, "message": body, "done": true, "reason": "fallback" })
                }
                Err(e) => {
                    json!({ "turn_id": request.turn_id, "error": e.to_string(), "done": true, "reason": "fallback" })
                }
            };
            let event = Event::new(
                EventKind::Message,
                "turn.reply",
                session_id.as_str(),
                request.requester.as_str(),
                payload,
            );
            if let Err(e) = router.send_event(event) {
                warn!(error = %e, "failed to route headless reply");
            }
        });
    }

    fn route_reply(&self, requester: &str, event_name: &str, payload: serde_json::Value) {
        let event = Event::new(
            EventKind::Message,
            event_name,
            self.id.as_str(),
            requester,
            payload,
        );
        if let Err(e) = self.router.send_event(event) {
            warn!(session = %self.id, requester, error = %e, "failed to route reply");
        }
    }
}

/// Pending-forever when no PTY is attached; the select loop then waits on
/// its other branches.
async fn next_pty_event(events: &mut Option<mpsc::UnboundedReceiver<PtyEvent>>) -> PtyEvent {
    match events {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Owns every live session and the shared bus plumbing.
pub struct SessionRegistry {
    paths: BusPaths,
    config: RelayConfig,
    router: MessageRouter,
    sessions: parking_lot::Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(paths: BusPaths, config: RelayConfig) -> Result<Self, SessionError> {
        paths.ensure_dirs()?;
        let router = MessageRouter::new(&paths, &config);
        Ok(Self {
            paths,
            config,
            router,
            sessions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Join the bus and start a supervised PTY session plus its control
    /// socket. Must be called from within a tokio runtime.
    pub fn launch(
        &self,
        agent_type: &str,
        session_id: &str,
        pty_config: AgentPtyConfig,
        headless: Arc<dyn HeadlessExecutor>,
    ) -> Result<SessionHandle, SessionError> {
        let subscriber = self.router.registry().join(JoinRequest {
            agent_type: agent_type.to_string(),
            session_id: session_id.to_string(),
            nickname: None,
            launch_mode: LaunchMode::Pty,
            pid: None,
            tty_path: None,
        })?;
        self.router.record_lifecycle(
            EventKind::Join,
            "subscriber.join",
            &subscriber.id,
            json!({ "nickname": subscriber.nickname }),
        )?;

        let screen = Box::new(AlacrittyScreen::new(pty_config.cols, pty_config.rows));
        let (session, handle) = PtySession::new(
            subscriber.id.clone(),
            self.config.clone(),
            self.router.clone(),
            Box::new(pty_config),
            headless,
            screen,
        );
        tokio::spawn(session.run());
        crate::socket::spawn_socket_server(self.paths.socket_path(&subscriber.id), handle.clone());

        info!(session = %subscriber.id, nickname = %subscriber.nickname, "session launched");
        self.sessions
            .lock()
            .insert(subscriber.id.clone(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Stop a session and forget its handle.
    pub fn shutdown(&self, id: &str) -> bool {
        match self.sessions.lock().remove(id) {
            Some(handle) => handle.shutdown().is_ok(),
            None => false,
        }
    }

    /// Mark subscribers with stale heartbeats inactive.
    pub fn sweep(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.router.registry().sweep()?)
    }
}
