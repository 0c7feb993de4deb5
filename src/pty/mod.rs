//! Pseudo-terminal collaborator seam.
//!
//! Session code talks to a [`PtyHandle`] and a stream of [`PtyEvent`]s, so
//! the real portable-pty implementation and test doubles are
//! interchangeable.

mod spawn;

pub use spawn::{spawn_agent_pty, AgentPtyConfig};

use tokio::sync::mpsc;

/// Default agent terminal geometry.
pub const DEFAULT_COLS: u16 = 200;
pub const DEFAULT_ROWS: u16 = 50;

/// Events from a running PTY child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw output bytes.
    Output(Vec<u8>),
    /// Process exited with code.
    Exit(Option<i32>),
    /// I/O failure on the PTY.
    Error(String),
}

/// Write/resize/kill surface of a spawned PTY child.
pub trait PtyHandle: Send {
    fn write(&self, bytes: Vec<u8>);
    fn resize(&self, cols: u16, rows: u16);
    fn kill(&self);

    fn write_str(&self, s: &str) {
        self.write(s.as_bytes().to_vec());
    }
}

/// A freshly spawned PTY: the control handle plus its event stream.
pub struct SpawnedSession {
    pub handle: Box<dyn PtyHandle>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

/// Spawns fresh PTY children for a supervised session across restarts.
pub trait PtySpawner: Send {
    fn spawn(&self) -> Result<SpawnedSession, String>;
}

impl PtySpawner for AgentPtyConfig {
    fn spawn(&self) -> Result<SpawnedSession, String> {
        spawn_agent_pty(self.clone())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted PTY double for deterministic session tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records writes and resizes; output is fed in by the test.
    #[derive(Default)]
    pub struct ScriptedPtyState {
        pub writes: Mutex<Vec<Vec<u8>>>,
        pub resizes: Mutex<Vec<(u16, u16)>>,
        pub killed: AtomicBool,
    }

    #[derive(Clone)]
    pub struct ScriptedPty {
        pub state: Arc<ScriptedPtyState>,
    }

    impl ScriptedPty {
        pub fn new() -> (Self, Arc<ScriptedPtyState>) {
            let state = Arc::new(ScriptedPtyState::default());
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl PtyHandle for ScriptedPty {
        fn write(&self, bytes: Vec<u8>) {
            self.state.writes.lock().unwrap().push(bytes);
        }

        fn resize(&self, cols: u16, rows: u16) {
            self.state.resizes.lock().unwrap().push((cols, rows));
        }

        fn kill(&self) {
            self.state.killed.store(true, Ordering::SeqCst);
        }
    }

    impl ScriptedPtyState {
        /// All writes concatenated as UTF-8.
        pub fn written_text(&self) -> String {
            let writes = self.writes.lock().unwrap();
            writes
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }

        pub fn was_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }
    }
}
