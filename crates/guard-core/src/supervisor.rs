//! Worker pool ownership and round-robin dispatch.
//!
//! The supervisor is a single-owner actor: inbound events, worker exits and cancellation
//! all arrive through one `select!` loop, so pool state needs no locking.

use std::{collections::HashMap, fmt, num::NonZeroUsize, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{event::Event, report::ErrorReporter, Result};

pub const MAX_WORKERS: usize = 4;

/// Requested size bounded by available parallelism and [`MAX_WORKERS`], at least 1.
pub fn effective_pool_size(requested: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    requested.min(cores).min(MAX_WORKERS).max(1)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerHandle {
    pub ordinal: usize,
    /// OS pid for process workers, a synthetic id for task workers.
    pub pid: u32,
    pub alive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code.map_or_else(|| "null".to_string(), |c| c.to_string());
        let signal = self
            .signal
            .map_or_else(|| "null".to_string(), |s| s.to_string());
        write!(
            f,
            "Worker {} died with code {code} and signal {signal}",
            self.pid
        )
    }
}

pub struct SpawnedWorker {
    pub pid: u32,
    pub tx: mpsc::UnboundedSender<Event>,
}

/// Creates one isolated worker execution context.
///
/// The spawner must send exactly one [`WorkerExit`] on `exits` when the worker ends,
/// whatever the cause.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(
        &self,
        ordinal: usize,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<SpawnedWorker>;
}

pub struct Supervisor {
    workers: Vec<WorkerHandle>,
    senders: HashMap<u32, mpsc::UnboundedSender<Event>>,
    cursor: usize,
    reporter: Arc<ErrorReporter>,
}

impl Supervisor {
    /// Spawn a pool of [`effective_pool_size`]`(requested)` workers.
    pub async fn initialize(
        spawner: &dyn WorkerSpawner,
        requested: usize,
        reporter: Arc<ErrorReporter>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerExit>) {
        let size = effective_pool_size(requested);
        if size < requested {
            info!(requested, size, "worker pool size capped");
        }
        Self::spawn_pool(spawner, size, reporter).await
    }

    /// Spawn exactly `size` workers. Spawn failures are reported and shrink the pool.
    pub async fn spawn_pool(
        spawner: &dyn WorkerSpawner,
        size: usize,
        reporter: Arc<ErrorReporter>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(size);
        let mut senders = HashMap::with_capacity(size);

        for ordinal in 0..size {
            match spawner.spawn(ordinal, exits_tx.clone()).await {
                Ok(SpawnedWorker { pid, tx }) => {
                    info!(pid, ordinal, "worker started");
                    workers.push(WorkerHandle {
                        ordinal,
                        pid,
                        alive: true,
                    });
                    senders.insert(pid, tx);
                }
                Err(e) => {
                    reporter.report(e, Some(&format!("Failed to spawn worker {ordinal}")));
                }
            }
        }

        info!(workers = workers.len(), "worker pool ready");
        let supervisor = Self {
            workers,
            senders,
            cursor: 0,
            reporter,
        };
        (supervisor, exits_rx)
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Hand `event` to the next live worker. Returns the chosen worker's pid if the send
    /// succeeded; failures are reported, never retried on another worker.
    ///
    /// Malformed events are reported and skipped before a worker is chosen.
    pub fn dispatch(&mut self, event: Event) -> Option<u32> {
        if let Err(e) = event.validate() {
            warn!(update_id = event.update_id(), "invalid update skipped");
            self.reporter.report(e, Some("Invalid update skipped"));
            return None;
        }

        let active: Vec<u32> = self
            .workers
            .iter()
            .filter(|w| w.alive)
            .map(|w| w.pid)
            .collect();

        if active.is_empty() {
            error!(update_id = event.update_id(), "no active workers available");
            self.reporter
                .report("No active workers available", Some("dispatch"));
            return None;
        }

        if self.cursor >= active.len() {
            self.cursor = 0;
        }
        let pid = active[self.cursor];
        self.cursor += 1;

        let sent = match self.senders.get(&pid) {
            Some(tx) => tx.send(event).map_err(|e| e.to_string()),
            None => Err("worker channel missing".to_string()),
        };
        match sent {
            Ok(()) => Some(pid),
            Err(e) => {
                self.reporter
                    .report(e, Some(&format!("Failed to send update to worker {pid}")));
                None
            }
        }
    }

    /// Drop an exited worker from the active set. The handle is kept.
    pub fn on_exit(&mut self, exit: WorkerExit) {
        let Some(handle) = self.workers.iter_mut().find(|w| w.pid == exit.pid) else {
            warn!(pid = exit.pid, "exit from unknown worker");
            return;
        };
        if !handle.alive {
            return;
        }
        handle.alive = false;
        self.senders.remove(&exit.pid);

        let remaining = self.active_count();
        if exit.is_clean() {
            info!(pid = exit.pid, remaining, "worker exited");
        } else {
            error!(pid = exit.pid, code = ?exit.code, signal = ?exit.signal, remaining, "worker died");
            self.reporter.report(exit, None);
        }
    }

    /// Actor loop. Ends on cancellation or when every [`SupervisorHandle`] is dropped;
    /// worker channels are closed on the way out so workers drain and exit.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(exit) = exits.recv() => self.on_exit(exit),
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        self.dispatch(event);
                    }
                    None => break,
                },
            }
        }

        info!(active = self.active_count(), "supervisor stopping");
        self.senders.clear();
    }

    /// Start the actor on the current runtime.
    pub fn start(
        self,
        exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(rx, exits, cancel.clone()));
        (SupervisorHandle { tx, cancel }, task)
    }
}

/// Cloneable entry point used by the transport.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    /// `false` once the supervisor has stopped.
    pub fn dispatch(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
