//! Transport-neutral inbound events.
//!
//! The Telegram adapter builds these once per update (converting entity offsets to byte
//! offsets on the way in), the supervisor validates them before dispatch, and from then
//! on every component works with plain fields instead of probing optional payloads.

use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    security::{validate_chat_id, validate_user_id},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message(MessageEvent),
    EditedMessage(MessageEvent),
    /// Any update the workers do not inspect (callbacks, polls, member changes...).
    Other { update_id: i64, kind: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub update_id: i64,
    pub message_id: MessageId,
    pub chat: ChatInfo,
    pub from: Option<Sender>,
    /// Message text, or the caption for media messages.
    pub body: Option<String>,
    /// Text entities followed by caption entities, offsets into `body` in bytes.
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub forwarded: bool,
    #[serde(default)]
    pub media: Vec<MediaKind>,
    #[serde(default)]
    pub new_chat_members: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: ChatId,
    pub kind: ChatKind,
    pub username: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
    /// Explicit target of a `text_link`.
    pub url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Url,
    TextLink,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Document,
    Sticker,
    Photo,
    VideoNote,
    Video,
    Game,
}

impl Event {
    pub fn update_id(&self) -> i64 {
        match self {
            Event::Message(m) | Event::EditedMessage(m) => m.update_id,
            Event::Other { update_id, .. } => *update_id,
        }
    }

    /// The message payload of message and edited-message updates.
    pub fn message(&self) -> Option<&MessageEvent> {
        match self {
            Event::Message(m) | Event::EditedMessage(m) => Some(m),
            Event::Other { .. } => None,
        }
    }

    pub fn is_edit(&self) -> bool {
        matches!(self, Event::EditedMessage(_))
    }

    /// Ingestion-time checks; a failing event is reported and skipped by the supervisor.
    pub fn validate(&self) -> Result<()> {
        let Some(msg) = self.message() else {
            return Ok(());
        };

        if !validate_chat_id(msg.chat.id) {
            return Err(Error::Validation(format!(
                "update {}: invalid chat id {}",
                msg.update_id, msg.chat.id
            )));
        }
        if let Some(from) = &msg.from {
            if !validate_user_id(from.id) {
                return Err(Error::Validation(format!(
                    "update {}: invalid user id {}",
                    msg.update_id, from.id
                )));
            }
        }

        let body_len = msg.body.as_deref().map_or(0, str::len);
        for entity in &msg.entities {
            let end = entity.offset.checked_add(entity.length);
            if end.map_or(true, |end| end > body_len) && entity.kind != EntityKind::TextLink {
                return Err(Error::Validation(format!(
                    "update {}: entity {}+{} outside body of {body_len} bytes",
                    msg.update_id, entity.offset, entity.length
                )));
            }
        }

        Ok(())
    }
}

impl MessageEvent {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat.id,
            message_id: self.message_id,
        }
    }

    pub fn sender_id(&self) -> Option<UserId> {
        self.from.map(|s| s.id)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.chat.kind, ChatKind::Group | ChatKind::Supergroup)
    }

    pub fn has_link_entities(&self) -> bool {
        self.entities.iter().any(Entity::is_link)
    }

    /// Literal text covered by `entity`, if the span lands on char boundaries.
    pub fn entity_text(&self, entity: &Entity) -> Option<&str> {
        let body = self.body.as_deref()?;
        let end = entity.offset.checked_add(entity.length)?;
        body.get(entity.offset..end)
    }
}

impl Entity {
    pub fn is_link(&self) -> bool {
        matches!(self.kind, EntityKind::Url | EntityKind::TextLink)
    }
}
