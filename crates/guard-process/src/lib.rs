//! OS-process workers.
//!
//! The supervisor side spawns `guard --worker` children and feeds each one events as
//! JSON lines on stdin. The worker side reads those lines and hands them to the
//! in-process event loop. Closing a child's stdin is its shutdown signal.

use std::{path::PathBuf, process::Stdio, sync::Arc};

use async_trait::async_trait;
use guard_core::{
    errors::Error,
    event::Event,
    report::ErrorReporter,
    supervisor::{SpawnedWorker, WorkerExit, WorkerSpawner},
    worker::{serve_events, EventHandler},
    Result,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

pub const WORKER_FLAG: &str = "--worker";

#[derive(Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    reporter: Arc<ErrorReporter>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            program: program.into(),
            args,
            reporter,
        }
    }

    /// Re-run the current binary in worker mode.
    pub fn current_exe(reporter: Arc<ErrorReporter>) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, vec![WORKER_FLAG.to_string()], reporter))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        ordinal: usize,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("GUARD_WORKER_ORDINAL", ordinal.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| Error::External("worker exited before it could be tracked".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External(format!("worker {pid} stdin was not captured")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pipe_events(pid, rx, stdin, self.reporter.clone()));

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => WorkerExit {
                    pid,
                    code: status.code(),
                    signal: exit_signal(&status),
                },
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for worker");
                    WorkerExit {
                        pid,
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exits.send(exit);
        });

        Ok(SpawnedWorker { pid, tx })
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Per-worker writer: one JSON line per event. Ends when the supervisor drops the
/// sender or the pipe breaks; dropping `stdin` then closes the child's input.
async fn pipe_events(
    pid: u32,
    mut rx: mpsc::UnboundedReceiver<Event>,
    mut stdin: ChildStdin,
    reporter: Arc<ErrorReporter>,
) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                reporter.report(e, Some(&format!("Failed to encode update for worker {pid}")));
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(pid, error = %e, "worker pipe closed");
            return;
        }
    }

    let _ = stdin.shutdown().await;
    debug!(pid, "worker pipe closed by supervisor");
}

/// Worker-side loop over this process's stdin. Returns at EOF once in-flight events
/// are done.
pub async fn run_worker_stdin(handler: Arc<dyn EventHandler>, reporter: Arc<ErrorReporter>) {
    let input = BufReader::new(tokio::io::stdin());
    run_worker(input, handler, reporter, std::process::id()).await;
}

pub async fn run_worker<R>(
    input: R,
    handler: Arc<dyn EventHandler>,
    reporter: Arc<ErrorReporter>,
    worker_id: u32,
) where
    R: AsyncBufRead + Unpin,
{
    info!(worker_id, "Worker {worker_id} started");
    let (tx, rx) = mpsc::unbounded_channel();
    let events = tokio::spawn(serve_events(rx, handler, reporter.clone(), worker_id));

    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                reporter.report(e, Some(&format!("Worker {worker_id} stdin read error")));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_event(&line) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                reporter.report(e, Some(&format!("Worker {worker_id} skipped update")));
            }
        }
    }

    drop(tx);
    if let Err(e) = events.await {
        reporter.report(e, Some(&format!("Worker {worker_id} event loop failed")));
    }
}

fn decode_event(line: &str) -> Result<Event> {
    let event: Event = serde_json::from_str(line)?;
    event.validate()?;
    Ok(event)
}
