//! Telegram adapter (teloxide).
//!
//! Implements the `guard-core` MessagingPort over the Bot API, converts updates into
//! events and runs long polling in front of the supervisor.

use async_trait::async_trait;

use teloxide::prelude::*;

use tokio::time::sleep;

pub mod convert;
pub mod router;

use guard_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::port::MessagingPort,
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn tg_user(user_id: UserId) -> Result<teloxide::types::UserId> {
        u64::try_from(user_id.0)
            .map(teloxide::types::UserId)
            .map_err(|_| Error::Validation(format!("invalid user id {user_id}")))
    }
}

fn map_err(e: teloxide::RequestError) -> Error {
    Error::External(format!("telegram error: {e}"))
}

/// Run `op`, waiting out one flood-control `RetryAfter` before giving up.
async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match e {
                teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                    continue;
                }
                other => return Err(map_err(other)),
            },
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        with_retry(|| {
            self.bot
                .send_message(Self::tg_chat(chat_id), text.to_string())
                .disable_web_page_preview(true)
        })
        .await?;
        Ok(())
    }

    async fn is_administrator(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let user = Self::tg_user(user_id)?;
        let member = with_retry(|| self.bot.get_chat_member(Self::tg_chat(chat_id), user)).await?;
        Ok(member.is_privileged())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use teloxide::{ApiError, RequestError};

    #[tokio::test(start_paused = true)]
    async fn flood_control_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let out = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RequestError::RetryAfter(Duration::from_secs(3)))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_flood_control_gives_up() {
        let calls = AtomicUsize::new(0);

        let out: Result<()> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::RetryAfter(Duration::from_secs(1))) }
        })
        .await;

        assert!(matches!(out, Err(Error::External(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);

        let out: Result<()> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestError::Api(ApiError::BotBlocked)) }
        })
        .await;

        let Err(Error::External(msg)) = out else {
            panic!("expected external error");
        };
        assert!(msg.contains("telegram error"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
