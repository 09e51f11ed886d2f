//! Worker-side event processing.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info};

use crate::{
    event::Event,
    moderation::ModerationFilter,
    report::ErrorReporter,
    saver::MessageSaver,
    supervisor::{SpawnedWorker, WorkerExit, WorkerSpawner},
    Result,
};

/// Exit code reported for a task worker whose loop panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Must not propagate failures; anything unexpected goes to the reporter.
    async fn handle_event(&self, event: Event);
}

/// Moderation first, then persistence. A deleted message is still archived.
pub struct WorkerPipeline {
    moderation: ModerationFilter,
    saver: Arc<MessageSaver>,
}

impl WorkerPipeline {
    pub fn new(moderation: ModerationFilter, saver: Arc<MessageSaver>) -> Self {
        Self { moderation, saver }
    }
}

#[async_trait]
impl EventHandler for WorkerPipeline {
    async fn handle_event(&self, event: Event) {
        let decision = self.moderation.enforce(&event).await;
        let saved = self.saver.observe(&event);
        debug!(
            update_id = event.update_id(),
            denied = decision.is_deny(),
            saved,
            "event handled"
        );
    }
}

/// Handle events from `rx` until it closes, each in its own task.
///
/// A panicking event task is reported with the worker identity; the loop carries on.
/// Returns after every in-flight event has finished.
pub async fn serve_events(
    mut rx: mpsc::UnboundedReceiver<Event>,
    handler: Arc<dyn EventHandler>,
    reporter: Arc<ErrorReporter>,
    worker_id: u32,
) {
    let mut tasks = JoinSet::new();
    let context = format!("Worker {worker_id} update handling error");

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    let handler = handler.clone();
                    tasks.spawn(async move { handler.handle_event(event).await });
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    reporter.report(e, Some(&context));
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            reporter.report(e, Some(&context));
        }
    }
    info!(worker_id, "worker drained");
}

/// Workers as tokio tasks inside the supervisor process.
pub struct TaskSpawner {
    handler: Arc<dyn EventHandler>,
    reporter: Arc<ErrorReporter>,
    next_id: AtomicU32,
}

impl TaskSpawner {
    pub fn new(handler: Arc<dyn EventHandler>, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            handler,
            reporter,
            next_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl WorkerSpawner for TaskSpawner {
    async fn spawn(
        &self,
        ordinal: usize,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<SpawnedWorker> {
        let pid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(serve_events(
            rx,
            self.handler.clone(),
            self.reporter.clone(),
            pid,
        ));
        tokio::spawn(async move {
            let code = match worker.await {
                Ok(()) => 0,
                Err(e) if e.is_panic() => PANIC_EXIT_CODE,
                Err(_) => 1,
            };
            let _ = exits.send(WorkerExit {
                pid,
                code: Some(code),
                signal: None,
            });
        });

        debug!(pid, ordinal, "task worker spawned");
        Ok(SpawnedWorker { pid, tx })
    }
}
