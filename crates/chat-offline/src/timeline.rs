use std::collections::HashMap;

use chat_core::{Message, User};

/// Messages of one channel keyed by id, merged by sync-status-aware ordering key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTimeline {
    messages: HashMap<String, Message>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.get(message_id)
    }

    /// Store `message` unless the stored version is newer. Returns whether it was stored.
    pub fn upsert(&mut self, message: Message) -> bool {
        if !message.supersedes(self.messages.get(&message.id)) {
            return false;
        }
        self.messages.insert(message.id.clone(), message);
        true
    }

    /// Upsert every message, returning the ones that were stored.
    pub fn upsert_all(&mut self, messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
        messages
            .into_iter()
            .filter_map(|message| {
                let accepted = message.clone();
                self.upsert(message).then_some(accepted)
            })
            .collect()
    }

    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        self.messages.remove(message_id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Keep only messages created strictly after `date`.
    pub fn retain_created_after(&mut self, date: u64) {
        self.messages
            .retain(|_, message| message.created_time().is_some_and(|created| created > date));
    }

    /// Messages oldest first; ties broken by id.
    pub fn sorted(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.values().cloned().collect();
        messages.sort_by(|a, b| {
            a.created_time()
                .cmp(&b.created_time())
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }

    pub fn oldest_id(&self) -> Option<String> {
        self.sorted().first().map(|message| message.id.clone())
    }

    pub fn newest_id(&self) -> Option<String> {
        self.sorted().last().map(|message| message.id.clone())
    }

    /// Replace author and reaction users matching `user`. Returns the number of
    /// messages touched.
    pub fn update_user(&mut self, user: &User) -> usize {
        let mut touched = 0;
        for message in self.messages.values_mut() {
            let mut changed = false;
            if message.user.id == user.id {
                message.user = user.clone();
                changed = true;
            }
            for reaction in message
                .own_reactions
                .iter_mut()
                .chain(message.latest_reactions.iter_mut())
            {
                if reaction.user.as_ref().is_some_and(|u| u.id == user.id) {
                    reaction.user = Some(user.clone());
                    changed = true;
                }
            }
            if changed {
                touched += 1;
            }
        }
        touched
    }
}
