//! Batched error reporting.
//!
//! Every component funnels operational failures into one [`ErrorReporter`]. Reports are
//! sanitized, logged locally and queued (bounded, lossy when full). A timer drains the
//! queue, chunks the text to the Bot API message limit and sends it to the report chat.

use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{domain::ChatId, messaging::port::MessagingPort, security::sanitize_input};

/// Upper bound for one outbound report message (Telegram allows 4096).
pub const REPORT_CHUNK_LEN: usize = 4000;

pub const DEFAULT_QUEUE_LIMIT: usize = 100;

/// Decides which failures are expected noise and never worth a report.
pub trait DismissFilter: Send + Sync {
    fn is_dismissable(&self, message: &str) -> bool;
}

/// Bot API failures that happen in normal operation of a group bot.
#[derive(Clone, Copy, Debug, Default)]
pub struct KnownNoise;

const KNOWN_NOISE: &[&str] = &[
    "message to delete not found",
    "message can't be deleted",
    "message to edit not found",
    "message is not modified",
    "not enough rights",
    "have no rights",
    "bot was blocked by the user",
    "bot was kicked",
    "bot is not a member",
    "chat not found",
    "user is deactivated",
    "query is too old",
    "need administrator rights",
];

impl DismissFilter for KnownNoise {
    fn is_dismissable(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        KNOWN_NOISE.iter().any(|noise| lower.contains(noise))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub entries: usize,
    pub chunks_sent: usize,
    pub chunks_failed: usize,
}

pub struct ErrorReporter {
    destination: ChatId,
    limit: usize,
    filter: Box<dyn DismissFilter>,
    queue: Mutex<Vec<String>>,
    flusher: Mutex<Option<Flusher>>,
}

struct Flusher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    sink: Arc<dyn MessagingPort>,
}

impl ErrorReporter {
    pub fn new(destination: ChatId, limit: usize) -> Self {
        Self {
            destination,
            limit,
            filter: Box::new(KnownNoise),
            queue: Mutex::new(Vec::new()),
            flusher: Mutex::new(None),
        }
    }

    pub fn with_filter(mut self, filter: impl DismissFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// Record one failure. Returns whether it was queued.
    ///
    /// Never blocks on I/O and never fails: dismissable errors are dropped, and once the
    /// queue holds `limit` entries further reports are only logged.
    pub fn report(&self, err: impl Display, context: Option<&str>) -> bool {
        let raw = err.to_string();
        if self.filter.is_dismissable(&raw) {
            debug!(error = %raw, "dismissed expected error");
            return false;
        }
        self.enqueue(&raw, context)
    }

    /// Like [`report`](Self::report) but without the dismiss filter. Used for persistence
    /// failures.
    pub fn report_unfiltered(&self, err: impl Display, context: Option<&str>) -> bool {
        self.enqueue(&err.to_string(), context)
    }

    fn enqueue(&self, raw: &str, context: Option<&str>) -> bool {
        let mut message = sanitize_input(raw);
        if message.is_empty() {
            message = "Unknown error".to_string();
        }
        let context = context.map(sanitize_input).filter(|c| !c.is_empty());

        match &context {
            Some(ctx) => error!(context = %ctx, "{message}"),
            None => error!("{message}"),
        }

        let entry = match context {
            Some(ctx) => format!("{ctx}\n{message}"),
            None => message,
        };

        let mut queue = self.queue();
        if queue.len() >= self.limit {
            return false;
        }
        queue.push(entry);
        true
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Atomically take every queued entry, leaving an empty queue behind.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.queue())
    }

    /// Drain the queue and deliver it to the report chat.
    ///
    /// Delivery is at-most-once: a chunk that fails to send is logged and dropped.
    pub async fn flush(&self, sink: &dyn MessagingPort) -> FlushSummary {
        let entries = self.drain();
        let mut summary = FlushSummary {
            entries: entries.len(),
            ..FlushSummary::default()
        };
        if entries.is_empty() {
            return summary;
        }

        let text: String = entries.iter().map(|e| format!("{e}\n")).collect();
        for chunk in chunk_report(&text, REPORT_CHUNK_LEN) {
            match sink.send_text(self.destination, &chunk).await {
                Ok(()) => summary.chunks_sent += 1,
                Err(e) => {
                    summary.chunks_failed += 1;
                    warn!(error = %e, chat_id = %self.destination, "failed to send error report");
                }
            }
        }
        summary
    }

    /// Start the periodic flush. Calling this again while a flusher runs is a no-op.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn MessagingPort>, interval: Duration) {
        let mut slot = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(flush_loop(
            Arc::downgrade(self),
            sink.clone(),
            interval,
            cancel.clone(),
        ));
        *slot = Some(Flusher {
            cancel,
            handle,
            sink,
        });
    }

    /// Stop the flush timer and deliver whatever is still queued.
    pub async fn shutdown(&self) {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(flusher) = flusher else {
            return;
        };

        flusher.cancel.cancel();
        let _ = flusher.handle.await;
        self.flush(flusher.sink.as_ref()).await;
    }

    fn queue(&self) -> MutexGuard<'_, Vec<String>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn flush_loop(
    reporter: Weak<ErrorReporter>,
    sink: Arc<dyn MessagingPort>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(reporter) = reporter.upgrade() else { break };
                let summary = reporter.flush(sink.as_ref()).await;
                if summary.entries > 0 {
                    debug!(
                        entries = summary.entries,
                        sent = summary.chunks_sent,
                        failed = summary.chunks_failed,
                        "flushed error reports"
                    );
                }
            }
        }
    }
}

/// Split `text` into pieces of at most `max_chars` characters.
pub fn chunk_report(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MessageRef, UserId},
        testing::FakeMessenger,
        Result,
    };
    use async_trait::async_trait;

    fn reporter(limit: usize) -> ErrorReporter {
        ErrorReporter::new(ChatId(-500), limit)
    }

    #[test]
    fn queue_never_exceeds_limit() {
        let r = reporter(100);
        for i in 0..250 {
            r.report(format!("boom {i}"), None);
            assert!(r.pending() <= 100);
        }
        assert_eq!(r.pending(), 100);
    }

    #[test]
    fn identical_reports_are_not_deduplicated() {
        let r = reporter(5);
        for _ in 0..3 {
            assert!(r.report("same failure", Some("ctx")));
        }
        assert_eq!(r.pending(), 3);

        for _ in 0..5 {
            r.report("same failure", Some("ctx"));
        }
        assert_eq!(r.pending(), 5);
        assert!(!r.report("same failure", Some("ctx")));
    }

    #[test]
    fn dismissable_errors_are_dropped() {
        let r = reporter(10);
        assert!(!r.report("Bad Request: message to delete not found", None));
        assert!(!r.report("Forbidden: bot was kicked from the group chat", None));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn custom_filter_replaces_known_noise() {
        struct DropTimeouts;
        impl DismissFilter for DropTimeouts {
            fn is_dismissable(&self, message: &str) -> bool {
                message.contains("timed out")
            }
        }

        let r = reporter(10).with_filter(DropTimeouts);
        assert!(!r.report("request timed out", None));
        assert!(r.report("Bad Request: message to delete not found", None));
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn entries_are_sanitized_with_context_first() {
        let r = reporter(10);
        r.report("<script>javascript:alert(1)</script>", Some("Worker <1>"));
        let entries = r.drain();
        assert_eq!(entries, vec!["Worker 1\nscriptalert(1)/script".to_string()]);
    }

    #[test]
    fn empty_messages_get_a_placeholder() {
        let r = reporter(10);
        r.report("<>", None);
        assert_eq!(r.drain(), vec!["Unknown error".to_string()]);
    }

    #[test]
    fn chunking_respects_limit_and_preserves_text() {
        let text = "é".repeat(9_001);
        let chunks = chunk_report(&text, REPORT_CHUNK_LEN);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= REPORT_CHUNK_LEN));
        assert_eq!(chunks.concat(), text);
        assert!(chunk_report("", 10).is_empty());
    }

    #[tokio::test]
    async fn flush_empties_queue_and_sends_chunks() {
        let r = reporter(100);
        for i in 0..100 {
            r.report(format!("{i:03} {}", "x".repeat(95)), None);
        }
        let sink = FakeMessenger::default();

        let summary = r.flush(&sink).await;
        assert_eq!(r.pending(), 0);
        assert_eq!(summary.entries, 100);
        assert_eq!(summary.chunks_failed, 0);
        assert_eq!(summary.chunks_sent, 3);

        let sent = sink.sends.lock().unwrap().clone();
        assert!(sent.iter().all(|(chat, _)| *chat == ChatId(-500)));
        let joined: String = sent.iter().map(|(_, t)| t.as_str()).collect();
        assert!(joined.starts_with("000 "));
        assert!(joined.ends_with('\n'));
    }

    #[tokio::test]
    async fn failed_chunk_does_not_abort_the_rest() {
        let r = reporter(100);
        for _ in 0..100 {
            r.report("y".repeat(99), None);
        }
        let sink = FakeMessenger::default();
        sink.failing_sends.lock().unwrap().push(0);

        let summary = r.flush(&sink).await;
        assert_eq!(summary.chunks_failed, 1);
        assert_eq!(summary.chunks_sent, 2);
        // Lost chunks are not re-queued.
        assert_eq!(r.pending(), 0);
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let r = reporter(10);
        let sink = FakeMessenger::default();
        assert_eq!(r.flush(&sink).await, FlushSummary::default());
        assert!(sink.sent_texts().is_empty());
    }

    /// Sink that reports a new failure while a flush is in progress.
    struct ReentrantSink {
        reporter: Arc<ErrorReporter>,
        inner: FakeMessenger,
    }

    #[async_trait]
    impl MessagingPort for ReentrantSink {
        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            self.inner.delete_message(msg).await
        }

        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
            self.reporter.report("raised during flush", None);
            self.inner.send_text(chat_id, text).await
        }

        async fn is_administrator(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
            self.inner.is_administrator(chat_id, user_id).await
        }
    }

    #[tokio::test]
    async fn reports_during_flush_wait_for_next_cycle() {
        let r = Arc::new(reporter(10));
        r.report("first", None);
        let sink = ReentrantSink {
            reporter: r.clone(),
            inner: FakeMessenger::default(),
        };

        r.flush(&sink).await;
        assert_eq!(sink.inner.sent_texts(), vec!["first\n".to_string()]);
        assert_eq!(r.drain(), vec!["raised during flush".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_and_shutdown_delivers_leftovers() {
        let r = Arc::new(reporter(10));
        let sink = Arc::new(FakeMessenger::default());
        r.start(sink.clone(), Duration::from_secs(60));

        r.report("tick one", None);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sink.sent_texts(), vec!["tick one\n".to_string()]);

        r.report("left over", None);
        r.shutdown().await;
        assert_eq!(sink.sent_texts().len(), 2);
        assert_eq!(r.pending(), 0);
    }
}
