//! Where worker wires come from.
//!
//! The session layer only needs three things: a way to send lines, a way
//! to receive lines, and a way to ask "is the other end still there".
//! [`WorkerTransport`] produces those three as [`WorkerWires`], and the
//! default implementation, [`ProcessTransport`], launches the worker as a
//! child process speaking newline-delimited JSON on stdin/stdout.
//!
//! Tests implement [`WorkerTransport`] over in-memory channels to script
//! worker behaviour (including abrupt disconnects) without a process.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::PageloomError;

/// Environment variable naming the shared spool directory for the worker.
pub const SPOOL_DIR_ENV: &str = "PAGELOOM_SPOOL_DIR";

/// Buffered lines per direction before backpressure kicks in.
const WIRE_DEPTH: usize = 64;

/// A live connection to a worker context.
pub struct WorkerWires {
    /// Lines to the worker. Dropping this closes the worker's stdin.
    pub outbound: mpsc::Sender<String>,
    /// Lines from the worker. `None` means the worker hung up.
    pub inbound: mpsc::Receiver<String>,
    /// Liveness and teardown handle for the context behind the wires.
    pub monitor: Arc<dyn WorkerMonitor>,
}

impl std::fmt::Debug for WorkerWires {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerWires")
            .field("outbound", &self.outbound)
            .field("inbound", &self.inbound)
            .finish_non_exhaustive()
    }
}

/// Existence check and teardown for a worker context.
#[async_trait]
pub trait WorkerMonitor: Send + Sync {
    /// Whether the context still exists. This is the pre-send check the
    /// gateway uses to distinguish "worker is busy" from "worker is gone".
    async fn is_alive(&self) -> bool;

    /// Tear the context down. Idempotent.
    async fn terminate(&self);
}

/// Produces wires to a (new) worker context.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn launch(&self) -> Result<WorkerWires, PageloomError>;
}

// ─── Default implementation: sidecar process ──────────────────────────────

/// Launches the worker command as a child process and bridges its stdio
/// to line channels.
pub struct ProcessTransport {
    command: Vec<String>,
    spool_dir: PathBuf,
}

impl ProcessTransport {
    /// `command` is the program followed by its arguments; `spool_dir` is
    /// exported to the child as [`SPOOL_DIR_ENV`] so both sides resolve
    /// spooled payload keys in the same place.
    pub fn new(command: Vec<String>, spool_dir: PathBuf) -> Self {
        ProcessTransport { command, spool_dir }
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn launch(&self) -> Result<WorkerWires, PageloomError> {
        let program = self.command.first().ok_or_else(|| PageloomError::WorkerSetup {
            detail: "empty worker command".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(&self.command[1..])
            .env(SPOOL_DIR_ENV, &self.spool_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PageloomError::WorkerSetup {
                detail: format!("spawn '{program}': {e}"),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| PageloomError::WorkerSetup {
            detail: "worker stdin not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PageloomError::WorkerSetup {
            detail: "worker stdout not piped".to_string(),
        })?;
        let stderr = child.stderr.take();

        debug!(command = ?self.command, "worker process launched");

        // outbound: channel -> child stdin, one line per message
        let (out_tx, mut out_rx) = mpsc::channel::<String>(WIRE_DEPTH);
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // inbound: child stdout -> channel; EOF closes the channel, which
        // is how the session learns the worker hung up
        let (in_tx, in_rx) = mpsc::channel::<String>(WIRE_DEPTH);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if in_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("worker stdout read failed: {e}");
                        break;
                    }
                }
            }
        });

        // stderr is the worker's log stream; forward it at debug level
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("worker stderr: {line}");
                }
            });
        }

        Ok(WorkerWires {
            outbound: out_tx,
            inbound: in_rx,
            monitor: Arc::new(ProcessMonitor {
                child: Mutex::new(child),
            }),
        })
    }
}

struct ProcessMonitor {
    child: Mutex<Child>,
}

#[async_trait]
impl WorkerMonitor for ProcessMonitor {
    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.start_kill() {
                warn!("worker kill failed: {e}");
            }
        }
        // reap so the pid is not left as a zombie
        let _ = child.wait().await;
    }
}
