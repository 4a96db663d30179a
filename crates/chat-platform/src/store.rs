use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chat_core::{Channel, Message};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("local store unavailable: {0}")]
    Unavailable(String),
    #[error("local store backend failure: {0}")]
    Backend(String),
}

/// Offline cache of channels and messages.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Channel by cid with its newest `message_limit` messages, oldest first.
    async fn select_channel(
        &self,
        cid: &str,
        message_limit: usize,
    ) -> Result<Option<Channel>, StoreError>;

    /// Up to `limit` messages of `cid` created strictly before `before`, oldest first.
    async fn select_messages_before(
        &self,
        cid: &str,
        before: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn select_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Upsert channel metadata and the messages it carries.
    async fn insert_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), StoreError>;

    /// Drop messages of `cid` created before `before`.
    async fn delete_channel_messages_before(&self, cid: &str, before: u64)
    -> Result<(), StoreError>;

    async fn delete_channel(&self, cid: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct StoreData {
    channels: HashMap<String, Channel>,
    messages: HashMap<String, Message>,
}

impl StoreData {
    fn channel_messages(&self, cid: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .values()
            .filter(|message| message.cid == cid)
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            a.created_time()
                .cmp(&b.created_time())
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }
}

fn newest(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    let skip = messages.len().saturating_sub(limit);
    messages.drain(..skip);
    messages
}

/// `LocalStore` kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryLocalStore {
    data: Arc<RwLock<StoreData>>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("poisoned lock".to_owned())
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn select_channel(
        &self,
        cid: &str,
        message_limit: usize,
    ) -> Result<Option<Channel>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let Some(channel) = data.channels.get(cid) else {
            return Ok(None);
        };
        let mut channel = channel.clone();
        channel.messages = newest(data.channel_messages(cid), message_limit);
        Ok(Some(channel))
    }

    async fn select_messages_before(
        &self,
        cid: &str,
        before: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let older = data
            .channel_messages(cid)
            .into_iter()
            .filter(|message| message.created_time().is_some_and(|at| at < before))
            .collect();
        Ok(newest(older, limit))
    }

    async fn select_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.messages.get(message_id).cloned())
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        for message in &channel.messages {
            data.messages.insert(message.id.clone(), message.clone());
        }
        let mut stored = channel.clone();
        stored.messages.clear();
        data.channels.insert(stored.cid.clone(), stored);
        Ok(())
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        for message in messages {
            data.messages.insert(message.id.clone(), message.clone());
        }
        Ok(())
    }

    async fn delete_channel_messages_before(
        &self,
        cid: &str,
        before: u64,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.messages.retain(|_, message| {
            message.cid != cid || message.created_time().is_none_or(|at| at >= before)
        });
        Ok(())
    }

    async fn delete_channel(&self, cid: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.channels.remove(cid);
        data.messages.retain(|_, message| message.cid != cid);
        Ok(())
    }
}
