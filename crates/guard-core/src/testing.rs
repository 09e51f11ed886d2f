//! In-memory fakes for the ports, shared by the unit tests of this crate.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef, UserId},
    errors::Error,
    messaging::port::MessagingPort,
    moderation::UrlResolver,
    Result,
};

#[derive(Default)]
pub struct FakeMessenger {
    pub sends: Mutex<Vec<(ChatId, String)>>,
    pub deletes: Mutex<Vec<MessageRef>>,
    pub admins: Mutex<Vec<(ChatId, UserId)>>,
    /// Zero-based send attempts that should fail.
    pub failing_sends: Mutex<Vec<usize>>,
    pub fail_deletes: AtomicBool,
    pub admin_lookups: AtomicUsize,
    send_attempts: AtomicUsize,
}

impl FakeMessenger {
    pub fn sent_texts(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::External(
                "Bad Request: message to delete not found".to_string(),
            ));
        }
        self.deletes.lock().unwrap().push(msg);
        Ok(())
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing_sends.lock().unwrap().contains(&attempt) {
            return Err(Error::External("network down".to_string()));
        }
        self.sends.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn is_administrator(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        self.admin_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.admins.lock().unwrap().contains(&(chat_id, user_id)))
    }
}

/// Resolver with canned answers; unknown URLs resolve to themselves.
#[derive(Default)]
pub struct ScriptedResolver {
    pub answers: HashMap<String, std::result::Result<String, String>>,
    /// Applied before every answer, to exercise the deadline.
    pub delay: Option<Duration>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn with(mut self, from: &str, to: &str) -> Self {
        self.answers.insert(from.to_string(), Ok(to.to_string()));
        self
    }

    pub fn failing(mut self, from: &str) -> Self {
        self.answers
            .insert(from.to_string(), Err("connection refused".to_string()));
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UrlResolver for ScriptedResolver {
    async fn resolve(&self, url: &str) -> Result<String> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.answers.get(url) {
            Some(Ok(to)) => Ok(to.clone()),
            Some(Err(e)) => Err(Error::External(e.clone())),
            None => Ok(url.to_string()),
        }
    }
}
