//! Rate-limited archiving of link, forward and media messages.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    db_hook::{DbErrorHook, DbOperation},
    domain::{ChatId, MessageId, UserId},
    event::{Event, MediaKind},
    ratelimit::{message_save_key, RateLimiter},
    report::ErrorReporter,
    security::{sanitize_message_text, validate_chat_id, validate_user_id},
    Result,
};

pub const ARCHIVE_MAX_TEXT: usize = 500;

/// A persisted copy of an interesting message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub saved_at: DateTime<Utc>,
    pub update_id: i64,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaKind>,
}

#[async_trait]
pub trait MessageArchive: Send + Sync {
    async fn save(&self, message: &ArchivedMessage) -> Result<()>;
}

/// Appends one JSON object per line.
pub struct JsonlArchive {
    path: PathBuf,
}

impl JsonlArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageArchive for JsonlArchive {
    async fn save(&self, message: &ArchivedMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SavePolicy {
    pub max_per_window: u32,
    pub window: Duration,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            max_per_window: 50,
            window: Duration::from_secs(60),
        }
    }
}

/// Rate-limited selection of messages worth keeping, written by a background task.
pub struct MessageSaver {
    policy: SavePolicy,
    limiter: Arc<RateLimiter>,
    reporter: Arc<ErrorReporter>,
    tx: Mutex<Option<mpsc::UnboundedSender<ArchivedMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSaver {
    /// Must be called inside a tokio runtime; spawns the writer task.
    pub fn new(
        archive: Arc<dyn MessageArchive>,
        limiter: Arc<RateLimiter>,
        reporter: Arc<ErrorReporter>,
        policy: SavePolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let hook = DbErrorHook::new(reporter.clone());
        let writer = tokio::spawn(write_loop(rx, archive, hook));

        Self {
            policy,
            limiter,
            reporter,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Queue the message for archiving if it qualifies. Returns whether it was queued.
    pub fn observe(&self, event: &Event) -> bool {
        let Some(msg) = event.message() else {
            return false;
        };
        let Some(user_id) = msg.sender_id() else {
            return false;
        };

        if !validate_user_id(user_id) || !validate_chat_id(msg.chat.id) {
            warn!(user_id = %user_id, chat_id = %msg.chat.id, "invalid user or chat id in message");
            return false;
        }

        let key = message_save_key(user_id);
        if !self
            .limiter
            .allow(&key, self.policy.max_per_window, self.policy.window)
        {
            debug!(user_id = %user_id, "message save rate limited");
            return false;
        }

        let interesting = !msg.entities.is_empty() || msg.forwarded || !msg.media.is_empty();
        if !interesting {
            return false;
        }
        if !event.is_edit() && msg.new_chat_members {
            return false;
        }

        let record = ArchivedMessage {
            saved_at: Utc::now(),
            update_id: msg.update_id,
            chat_id: msg.chat.id,
            message_id: msg.message_id,
            user_id,
            edited: event.is_edit(),
            body: msg
                .body
                .as_deref()
                .map(|b| truncate_text(&sanitize_message_text(b), ARCHIVE_MAX_TEXT)),
            links: msg
                .entities
                .iter()
                .filter(|e| e.is_link())
                .filter_map(|e| e.url.clone().or_else(|| msg.entity_text(e).map(str::to_string)))
                .collect(),
            forwarded: msg.forwarded,
            media: msg.media.clone(),
        };

        let sent = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.send(record));
        match sent {
            Some(Ok(())) => true,
            Some(Err(_)) | None => {
                self.reporter.report(
                    "message writer is not running",
                    Some("Failed to post message to writer"),
                );
                false
            }
        }
    }

    /// Close the queue and wait for pending writes.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                self.reporter.report(e, Some("MessageSaver writer error"));
            }
        }
    }
}

async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<ArchivedMessage>,
    archive: Arc<dyn MessageArchive>,
    hook: DbErrorHook,
) {
    while let Some(record) = rx.recv().await {
        let outcome = archive.save(&record).await;
        hook.after(DbOperation::Save, outcome.err(), |err| {
            if err.is_none() {
                debug!(
                    chat_id = %record.chat_id,
                    message_id = record.message_id.0,
                    "message archived"
                );
            }
        });
    }
}

pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}
