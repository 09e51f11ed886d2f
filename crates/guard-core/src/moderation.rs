//! Channel-link screening for group messages.
//!
//! A message is removed when one of its link entities points at a Telegram deep link
//! (`t.me/<handle>` and friends) for anything other than the chat's own public handle,
//! either literally or after following redirects of a shortened URL.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    domain::{UserId, ANONYMOUS_ADMIN},
    event::{Entity, EntityKind, Event, MessageEvent},
    messaging::port::MessagingPort,
    report::ErrorReporter,
    security::{sanitize_input, validate_user_id},
    Result,
};

const DEEP_LINK_PATTERNS: [&str; 6] = [
    "http://t.me/",
    "https://t.me/",
    "http://telegram.me/",
    "https://telegram.me/",
    "http://telegram.dog/",
    "https://telegram.dog/",
];

/// Follows redirects of a (possibly shortened) URL and returns where it lands.
///
/// Implementations need not bound their own runtime; the filter races every call
/// against its own deadline.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModerationDecision {
    Allow,
    Deny { url: String },
}

impl ModerationDecision {
    pub fn is_deny(&self) -> bool {
        matches!(self, ModerationDecision::Deny { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ModerationPolicy {
    pub admin_id: UserId,
    /// Whether link screening is enabled for group chats at all.
    pub no_channel_links: bool,
    pub resolve_timeout: Duration,
}

pub struct ModerationFilter {
    policy: ModerationPolicy,
    resolver: Arc<dyn UrlResolver>,
    messenger: Arc<dyn MessagingPort>,
    reporter: Arc<ErrorReporter>,
}

impl ModerationFilter {
    pub fn new(
        policy: ModerationPolicy,
        resolver: Arc<dyn UrlResolver>,
        messenger: Arc<dyn MessagingPort>,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            policy,
            resolver,
            messenger,
            reporter,
        }
    }

    /// Decide and act: a denied message is deleted, deletion failures are swallowed.
    pub async fn enforce(&self, event: &Event) -> ModerationDecision {
        let decision = self.check(event).await;

        if let (ModerationDecision::Deny { url }, Some(msg)) = (&decision, event.message()) {
            let target = msg.message_ref();
            match self.messenger.delete_message(target).await {
                Ok(()) => info!(
                    chat_id = %msg.chat.id,
                    message_id = msg.message_id.0,
                    url = %url,
                    "removed message linking to another chat"
                ),
                Err(e) => debug!(
                    chat_id = %msg.chat.id,
                    message_id = msg.message_id.0,
                    error = %e,
                    "could not delete offending message"
                ),
            }
        }

        decision
    }

    /// Pure verdict for one event; performs look-ups but no deletion.
    pub async fn check(&self, event: &Event) -> ModerationDecision {
        let Some(msg) = event.message() else {
            return ModerationDecision::Allow;
        };

        if let Some(user_id) = msg.sender_id() {
            if !validate_user_id(user_id) {
                warn!(user_id = %user_id, "invalid user id in link check");
                return ModerationDecision::Allow;
            }
        }

        if !self.policy.no_channel_links || !msg.is_group() {
            return ModerationDecision::Allow;
        }
        if !msg.has_link_entities() {
            return ModerationDecision::Allow;
        }
        if self.is_exempt(msg).await {
            return ModerationDecision::Allow;
        }

        self.scan(msg).await
    }

    async fn is_exempt(&self, msg: &MessageEvent) -> bool {
        let Some(user_id) = msg.sender_id() else {
            return false;
        };
        if user_id == self.policy.admin_id || user_id == ANONYMOUS_ADMIN {
            return true;
        }

        match self.messenger.is_administrator(msg.chat.id, user_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                warn!(chat_id = %msg.chat.id, user_id = %user_id, error = %e, "admin lookup failed");
                false
            }
        }
    }

    /// Walk link entities in order; the first confirmed violation wins.
    async fn scan(&self, msg: &MessageEvent) -> ModerationDecision {
        let own_handle = msg.chat.username.as_deref();

        for entity in msg.entities.iter().filter(|e| e.is_link()) {
            let Some(url) = extract_url(msg, entity) else {
                continue;
            };
            let url = normalize_url(&url);

            if links_elsewhere(&url, own_handle) {
                return ModerationDecision::Deny { url };
            }

            let Some(resolved) = self.resolve_with_deadline(&url).await else {
                continue;
            };
            let resolved = sanitize_input(&resolved);
            if links_elsewhere(&resolved, own_handle) {
                return ModerationDecision::Deny { url: resolved };
            }
        }

        ModerationDecision::Allow
    }

    /// Race one resolution against the deadline. The losing call is left to finish on
    /// its own; its result is discarded.
    async fn resolve_with_deadline(&self, url: &str) -> Option<String> {
        let resolver = self.resolver.clone();
        let target = url.to_string();
        let attempt = tokio::spawn(async move { resolver.resolve(&target).await });

        match tokio::time::timeout(self.policy.resolve_timeout, attempt).await {
            Ok(Ok(Ok(resolved))) => Some(resolved),
            Ok(Ok(Err(e))) => {
                warn!(url, error = %e, "url resolution failed");
                None
            }
            Ok(Err(e)) => {
                self.reporter
                    .report(e, Some("URL resolution task failed in link check"));
                None
            }
            Err(_) => {
                warn!(
                    url,
                    timeout_ms = self.policy.resolve_timeout.as_millis() as u64,
                    "url resolution timed out"
                );
                None
            }
        }
    }
}

/// Literal URL behind a link entity, sanitized. `None` for empty or unsliceable spans.
pub fn extract_url(msg: &MessageEvent, entity: &Entity) -> Option<String> {
    let raw = match (entity.kind, entity.url.as_deref()) {
        (EntityKind::TextLink, Some(url)) => url,
        _ => msg.entity_text(entity)?,
    };
    let url = sanitize_input(raw);
    (!url.is_empty()).then_some(url)
}

/// Prefix `http://` unless the URL already carries an http(s) scheme.
pub fn normalize_url(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Whether `url` contains a Telegram deep link to a handle other than `own_handle`.
pub fn links_elsewhere(url: &str, own_handle: Option<&str>) -> bool {
    let lower = url.to_ascii_lowercase();
    let own = own_handle.filter(|h| !h.is_empty());

    DEEP_LINK_PATTERNS.iter().any(|pattern| {
        lower.match_indices(pattern).any(|(pos, _)| {
            let handle = lower[pos + pattern.len()..]
                .split(|c| matches!(c, '/' | '?' | '#'))
                .next()
                .unwrap_or("");
            !own.is_some_and(|own| handle.eq_ignore_ascii_case(own))
        })
    })
}
