//! Per-session Unix control socket.
//!
//! Newline-delimited JSON, one request per line. A malformed line gets an
//! error reply; the connection stays open. A connection may hold at most one
//! live output subscription, torn down when the peer disconnects.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::output::{Backfill, SubscribeMode};
use crate::session::SessionHandle;

/// Wire requests.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    /// Submit a turn.
    Inject { requester: String, message: String },
    /// Raw keystrokes, passed through untouched.
    Raw { data: String },
    Resize { cols: u16, rows: u16 },
    Subscribe { mode: SubscribeMode },
    Snapshot { mode: SubscribeMode },
    Restart,
}

/// Wire responses.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Response {
    Ok,
    /// Subscription accepted, no history to replay.
    Subscribed,
    /// Raw ring-buffer history for a new subscriber.
    Replay { data: String },
    /// Emulator-rendered text.
    Snapshot { data: String },
    /// A live output chunk.
    Output { data: String },
    Error { message: String },
}

/// Bind the session's control socket and serve connections until the task
/// is aborted. A stale socket file from a previous run is replaced.
pub fn spawn_socket_server(path: PathBuf, session: SessionHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _ = std::fs::remove_file(&path);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to bind control socket");
                return;
            }
        };
        info!(path = %path.display(), session = session.id(), "control socket listening");

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, session.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                }
            }
        }
    })
}

async fn handle_connection(stream: UnixStream, session: SessionHandle) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut observer: Option<u64> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = handle_line(&line, &session, &output_tx, &mut observer).await;
                    if write_response(&mut write_half, &response).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "control connection read failed");
                    break;
                }
            },
            Some(chunk) = output_rx.recv() => {
                let response = Response::Output {
                    data: String::from_utf8_lossy(&chunk).into_owned(),
                };
                if write_response(&mut write_half, &response).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(id) = observer {
        let _ = session.unsubscribe(id);
    }
}

async fn handle_line(
    line: &str,
    session: &SessionHandle,
    output_tx: &mpsc::UnboundedSender<Vec<u8>>,
    observer: &mut Option<u64>,
) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Response::Error {
                message: format!("malformed request: {}", e),
            }
        }
    };

    let result = match request {
        Request::Inject { requester, message } => {
            session.inject(&requester, &message).map(|_| Response::Ok)
        }
        Request::Raw { data } => session.write_raw(data.into_bytes()).map(|_| Response::Ok),
        Request::Resize { cols, rows } => session.resize(cols, rows).map(|_| Response::Ok),
        Request::Restart => session.restart().map(|_| Response::Ok),
        Request::Snapshot { mode } => session
            .snapshot(mode)
            .await
            .map(|data| Response::Snapshot { data }),
        Request::Subscribe { mode } => {
            // One subscription per connection; a repeat replaces it.
            if let Some(previous) = observer.take() {
                let _ = session.unsubscribe(previous);
            }
            match session.subscribe(mode, output_tx.clone()).await {
                Ok((id, backfill)) => {
                    *observer = Some(id);
                    Ok(match backfill {
                        Backfill::Replay(bytes) => Response::Replay {
                            data: String::from_utf8_lossy(&bytes).into_owned(),
                        },
                        Backfill::Snapshot(data) => Response::Snapshot { data },
                        Backfill::None => Response::Subscribed,
                    })
                }
                Err(e) => Err(e),
            }
        }
    };

    result.unwrap_or_else(|e| Response::Error {
        message: e.to_string(),
    })
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response).unwrap_or_default();
    line.push(b'\n');
    writer.write_all(&line).await
}
