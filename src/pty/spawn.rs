//! PTY spawning on portable-pty.
//!
//! Blocking reader/writer/waiter threads bridge the PTY to tokio channels;
//! the returned handle implements [`PtyHandle`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{PtyEvent, PtyHandle, SpawnedSession, DEFAULT_COLS, DEFAULT_ROWS};

/// Configuration for spawning an interactive agent in a PTY.
#[derive(Debug, Clone)]
pub struct AgentPtyConfig {
    /// Agent binary.
    pub program: String,
    /// Arguments passed through.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Terminal geometry.
    pub cols: u16,
    pub rows: u16,
    /// Environment overrides.
    pub env: HashMap<String, String>,
}

impl AgentPtyConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            env: interactive_env(),
        }
    }
}

/// Environment for interactive agent TUIs.
fn interactive_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    env
}

struct PortablePtyHandle {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    resize_tx: mpsc::UnboundedSender<PtySize>,
    killer: parking_lot::Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle for PortablePtyHandle {
    fn write(&self, bytes: Vec<u8>) {
        if self.writer_tx.send(bytes).is_err() {
            warn!("PTY writer channel closed");
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if self.resize_tx.send(size).is_err() {
            warn!("PTY resize channel closed");
        }
    }

    fn kill(&self) {
        if let Err(e) = self.killer.lock().kill() {
            warn!(error = %e, "failed to kill PTY child");
        }
    }
}

/// Spawn an interactive agent under a PTY with fixed geometry.
pub fn spawn_agent_pty(config: AgentPtyConfig) -> Result<SpawnedSession, String> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows: config.rows,
        cols: config.cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let pair = pty_system
        .openpty(size)
        .map_err(|e| format!("Failed to open PTY: {}", e))?;

    let mut cmd = CommandBuilder::new(&config.program);
    cmd.args(&config.args);
    let effective_cwd = config.cwd.clone().or_else(|| std::env::current_dir().ok());
    if let Some(cwd) = effective_cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| format!("Failed to spawn agent: {}", e))?;
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("Failed to clone PTY reader: {}", e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("Failed to take PTY writer: {}", e))?;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (output_tx, output_rx) = mpsc::unbounded_channel::<PtyEvent>();
    let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<PtySize>();

    let master = pair.master;

    let output_tx_read = output_tx.clone();
    thread::spawn(move || {
        read_pty_output(reader, output_tx_read);
    });

    thread::spawn(move || {
        write_to_pty(writer, writer_rx);
    });

    thread::spawn(move || {
        while let Some(new_size) = resize_rx.blocking_recv() {
            if let Err(e) = master.resize(new_size) {
                warn!("Failed to resize PTY: {}", e);
            }
        }
    });

    let output_tx_exit = output_tx;
    thread::spawn(move || match child.wait() {
        Ok(status) => {
            let code = status.exit_code();
            debug!("agent PTY exited with code: {:?}", code);
            let _ = output_tx_exit.send(PtyEvent::Exit(Some(code as i32)));
        }
        Err(e) => {
            error!("Failed to wait for PTY child: {}", e);
            let _ = output_tx_exit.send(PtyEvent::Error(format!("Wait failed: {}", e)));
        }
    });

    Ok(SpawnedSession {
        handle: Box::new(PortablePtyHandle {
            writer_tx,
            resize_tx,
            killer: parking_lot::Mutex::new(killer),
        }),
        events: output_rx,
    })
}

/// Read from PTY in a loop, sending output to the channel.
fn read_pty_output(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<PtyEvent>) {
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("PTY reader got EOF");
                break;
            }
            Ok(n) => {
                if tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                    debug!("PTY output channel closed");
                    break;
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    error!("PTY read error: {}", e);
                    let _ = tx.send(PtyEvent::Error(format!("Read error: {}", e)));
                    break;
                }
            }
        }
    }
}

/// Write to PTY from the channel.
fn write_to_pty(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data) {
            error!("PTY write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush() {
            warn!("PTY flush error: {}", e);
        }
    }
}
