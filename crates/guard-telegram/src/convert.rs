//! Bot API update → transport-neutral [`Event`].

use guard_core::{
    domain::{ChatId, MessageId, UserId},
    event::{ChatInfo, ChatKind, Entity, EntityKind, Event, MediaKind, MessageEvent, Sender},
};
use teloxide::types::{Chat, Message, MessageEntity, MessageEntityKind, Update, UpdateKind};

pub fn event_from_update(update: &Update) -> Event {
    let update_id = i64::from(update.id);
    match &update.kind {
        UpdateKind::Message(msg) => Event::Message(message_event(update_id, msg)),
        UpdateKind::EditedMessage(msg) => Event::EditedMessage(message_event(update_id, msg)),
        other => Event::Other {
            update_id,
            kind: update_kind_name(other).to_string(),
        },
    }
}

fn update_kind_name(kind: &UpdateKind) -> &'static str {
    match kind {
        UpdateKind::Message(_) => "message",
        UpdateKind::EditedMessage(_) => "edited_message",
        UpdateKind::ChannelPost(_) => "channel_post",
        UpdateKind::EditedChannelPost(_) => "edited_channel_post",
        UpdateKind::InlineQuery(_) => "inline_query",
        UpdateKind::ChosenInlineResult(_) => "chosen_inline_result",
        UpdateKind::CallbackQuery(_) => "callback_query",
        UpdateKind::Poll(_) => "poll",
        UpdateKind::PollAnswer(_) => "poll_answer",
        UpdateKind::ChatMember(_) => "chat_member",
        UpdateKind::MyChatMember(_) => "my_chat_member",
        _ => "other",
    }
}

fn message_event(update_id: i64, msg: &Message) -> MessageEvent {
    let body = msg.text().or_else(|| msg.caption());

    // Text and caption are mutually exclusive, so at most one list is non-empty.
    let entities = msg
        .entities()
        .into_iter()
        .chain(msg.caption_entities())
        .flatten()
        .map(|e| entity(body.unwrap_or_default(), e))
        .collect();

    MessageEvent {
        update_id,
        message_id: MessageId(msg.id.0),
        chat: chat_info(&msg.chat),
        from: msg.from().map(|u| Sender {
            id: UserId(u.id.0 as i64),
        }),
        body: body.map(str::to_string),
        entities,
        forwarded: msg.forward().is_some(),
        media: media_kinds(msg),
        new_chat_members: msg.new_chat_members().is_some_and(|m| !m.is_empty()),
    }
}

fn chat_info(chat: &Chat) -> ChatInfo {
    let kind = if chat.is_private() {
        ChatKind::Private
    } else if chat.is_group() {
        ChatKind::Group
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else {
        ChatKind::Channel
    };
    ChatInfo {
        id: ChatId(chat.id.0),
        kind,
        username: chat.username().map(str::to_string),
    }
}

fn entity(body: &str, e: &MessageEntity) -> Entity {
    let (kind, url) = match &e.kind {
        MessageEntityKind::Url => (EntityKind::Url, None),
        MessageEntityKind::TextLink { url } => (EntityKind::TextLink, Some(url.to_string())),
        _ => (EntityKind::Other, None),
    };
    // Unmappable spans keep their raw values; ingestion validation or slicing rejects them.
    let (offset, length) = utf16_span_to_bytes(body, e.offset, e.length).unwrap_or((e.offset, e.length));
    Entity {
        kind,
        offset,
        length,
        url,
    }
}

fn media_kinds(msg: &Message) -> Vec<MediaKind> {
    [
        (msg.document().is_some(), MediaKind::Document),
        (msg.sticker().is_some(), MediaKind::Sticker),
        (msg.photo().is_some(), MediaKind::Photo),
        (msg.video_note().is_some(), MediaKind::VideoNote),
        (msg.video().is_some(), MediaKind::Video),
        (msg.game().is_some(), MediaKind::Game),
    ]
    .into_iter()
    .filter_map(|(present, kind)| present.then_some(kind))
    .collect()
}

/// Convert a Bot API span (UTF-16 code units) into a byte span of `text`.
/// `None` if either end falls outside the text or inside a surrogate pair.
pub fn utf16_span_to_bytes(text: &str, offset: usize, length: usize) -> Option<(usize, usize)> {
    let end = offset.checked_add(length)?;
    let mut start_byte = None;
    let mut end_byte = None;
    let mut units = 0usize;

    for (byte, ch) in text.char_indices() {
        if units == offset {
            start_byte = Some(byte);
        }
        if units == end {
            end_byte = Some(byte);
            break;
        }
        units += ch.len_utf16();
    }
    if units == offset && start_byte.is_none() {
        start_byte = Some(text.len());
    }
    if units == end && end_byte.is_none() {
        end_byte = Some(text.len());
    }

    let (start, end) = (start_byte?, end_byte?);
    Some((start, end - start))
}
