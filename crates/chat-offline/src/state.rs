use std::collections::HashMap;

use chat_core::{Channel, ChannelData, ChannelUserRead, Member, Message, User, cid_of};
use tracing::debug;

use crate::{
    gap::{GapLogic, MessagesGapInfo},
    search::SearchLogic,
    timeline::MessageTimeline,
};

/// Pending query flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingState {
    pub initial: bool,
    pub older: bool,
    pub newer: bool,
}

/// Immutable view of one channel handed to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub cid: String,
    pub channel: ChannelData,
    /// Visible messages, oldest first.
    pub messages: Vec<Message>,
    /// Members sorted by user id.
    pub members: Vec<Member>,
    /// Watchers sorted by user id.
    pub watchers: Vec<User>,
    /// Reads sorted by user id.
    pub reads: Vec<ChannelUserRead>,
    /// Read state of the current user.
    pub read: Option<ChannelUserRead>,
    pub unread_count: u32,
    /// Ids of users currently typing, sorted.
    pub typing: Vec<String>,
    pub has_gap: bool,
    pub gap: Option<MessagesGapInfo>,
    pub inside_search: bool,
    pub loading: LoadingState,
    pub end_of_older_messages: bool,
    pub end_of_newer_messages: bool,
    pub hidden: bool,
    pub hide_messages_before: Option<u64>,
    pub muted: bool,
    pub watcher_count: u32,
    pub member_count: u32,
    pub last_message_at: Option<u64>,
    pub recovery_needed: bool,
}

/// Mutable per-channel state. Owned by one `ChannelLogic` behind its mutex.
#[derive(Debug, Clone, Default)]
pub struct ChannelMutableState {
    pub(crate) cid: String,
    pub(crate) channel: ChannelData,
    pub(crate) timeline: MessageTimeline,
    pub(crate) members: HashMap<String, Member>,
    pub(crate) watchers: HashMap<String, User>,
    pub(crate) reads: HashMap<String, ChannelUserRead>,
    pub(crate) read: Option<ChannelUserRead>,
    pub(crate) unread_count: u32,
    pub(crate) typing: HashMap<String, u64>,
    pub(crate) gap: GapLogic,
    pub(crate) search: SearchLogic,
    pub(crate) loading: LoadingState,
    pub(crate) end_of_older_messages: bool,
    pub(crate) end_of_newer_messages: bool,
    pub(crate) hidden: bool,
    pub(crate) hide_messages_before: Option<u64>,
    pub(crate) muted: bool,
    pub(crate) watcher_count: u32,
    pub(crate) member_count: u32,
    pub(crate) last_message_at: Option<u64>,
    pub(crate) recovery_needed: bool,
}

impl ChannelMutableState {
    pub fn new(channel_type: &str, channel_id: &str) -> Self {
        let cid = cid_of(channel_type, channel_id);
        Self {
            channel: ChannelData {
                cid: cid.clone(),
                channel_type: channel_type.to_owned(),
                id: channel_id.to_owned(),
                ..ChannelData::default()
            },
            cid,
            ..Self::default()
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Merge `messages` into the timeline; `refresh` drops the current messages first.
    pub(crate) fn upsert_messages(&mut self, messages: Vec<Message>, refresh: bool) {
        if refresh {
            self.timeline.clear();
        }
        let accepted = self.timeline.upsert_all(messages);
        self.bump_last_message_at(&accepted);
    }

    /// Merge a message delivered by an event, keeping the stored own reactions.
    pub(crate) fn upsert_event_message(&mut self, mut message: Message) {
        if let Some(existing) = self.timeline.get(&message.id) {
            message.own_reactions = existing.own_reactions.clone();
        }
        self.upsert_messages(vec![message], false);
    }

    pub(crate) fn remove_message(&mut self, message_id: &str) {
        self.timeline.remove(message_id);
    }

    /// Drop messages created at or before `date`, then add `system_message` if any.
    pub(crate) fn remove_messages_before(&mut self, date: u64, system_message: Option<Message>) {
        self.timeline.retain_created_after(date);
        if let Some(message) = system_message {
            self.upsert_messages(vec![message], false);
        }
    }

    /// Message by id unless hidden by `hide_messages_before`.
    pub fn get_message(&self, message_id: &str) -> Option<&Message> {
        self.timeline
            .get(message_id)
            .filter(|message| self.is_visible(message))
    }

    fn is_visible(&self, message: &Message) -> bool {
        match (self.hide_messages_before, message.created_time()) {
            (Some(before), Some(created)) => created > before,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    pub(crate) fn update_channel_data(&mut self, mut data: ChannelData) {
        if data.own_capabilities.is_empty() {
            data.own_capabilities = std::mem::take(&mut self.channel.own_capabilities);
        }
        self.channel = data;
    }

    pub(crate) fn upsert_members(&mut self, members: impl IntoIterator<Item = Member>) {
        for member in members {
            self.members.insert(member.user.id.clone(), member);
        }
    }

    pub(crate) fn delete_member(&mut self, user_id: &str) {
        self.members.remove(user_id);
        self.member_count = self.member_count.saturating_sub(1);
    }

    pub(crate) fn upsert_watchers(&mut self, watchers: impl IntoIterator<Item = User>) {
        for user in watchers {
            self.watchers.insert(user.id.clone(), user);
        }
    }

    pub(crate) fn delete_watcher(&mut self, user_id: &str) {
        self.watchers.remove(user_id);
    }

    /// Refresh the user object held by members and watchers.
    pub(crate) fn upsert_user_presence(&mut self, user: &User) {
        if let Some(member) = self.members.get_mut(&user.id) {
            member.user = user.clone();
        }
        if let Some(watcher) = self.watchers.get_mut(&user.id) {
            *watcher = user.clone();
        }
    }

    /// Refresh every copy of `user`: members, watchers, creator, authors and reactions.
    pub(crate) fn upsert_user(&mut self, user: &User) {
        self.upsert_user_presence(user);
        if self
            .channel
            .created_by
            .as_ref()
            .is_some_and(|creator| creator.id == user.id)
        {
            self.channel.created_by = Some(user.clone());
        }
        let touched = self.timeline.update_user(user);
        debug!(cid = %self.cid, user_id = %user.id, touched, "user refreshed in messages");
    }

    /// Track or clear a typing user; the current user is never tracked.
    pub(crate) fn set_typing(
        &mut self,
        user_id: &str,
        started_at: Option<u64>,
        current_user_id: Option<&str>,
    ) {
        match started_at {
            Some(started_at) => {
                self.typing.insert(user_id.to_owned(), started_at);
            }
            None => {
                self.typing.remove(user_id);
            }
        }
        if let Some(current) = current_user_id {
            self.typing.remove(current);
        }
    }

    /// Merge incoming read states.
    ///
    /// The current user's incoming read replaces the known one only when its
    /// `last_read` is more than `tolerance_ms` after the previous value.
    /// Otherwise the previous value is written back into the reads map.
    pub(crate) fn update_reads(
        &mut self,
        reads: Vec<ChannelUserRead>,
        current_user: Option<&User>,
        tolerance_ms: u64,
    ) {
        let Some(current_user) = current_user else {
            debug!(cid = %self.cid, "no current user; read states not merged");
            return;
        };
        let mut incoming: HashMap<String, ChannelUserRead> = reads
            .into_iter()
            .map(|read| (read.user.id.clone(), read))
            .collect();

        if let Some(own) = incoming.get_mut(&current_user.id) {
            own.last_message_seen = self.read.as_ref().and_then(|read| read.last_message_seen);
            let previous = self
                .read
                .as_ref()
                .and_then(|read| read.last_read)
                .or_else(|| {
                    self.reads
                        .get(&current_user.id)
                        .and_then(|read| read.last_read)
                });
            let accept = match previous {
                None => true,
                Some(previous) => own
                    .last_read
                    .is_some_and(|last_read| last_read > previous.saturating_add(tolerance_ms)),
            };

            if accept {
                self.unread_count = own.unread_messages;
                self.read = Some(own.clone());
            } else {
                debug!(cid = %self.cid, ?previous, incoming = ?own.last_read, "stale own read ignored");
                *own = ChannelUserRead::new(current_user.clone(), previous);
            }
        }

        self.reads.extend(incoming);
    }

    /// Count `message` as unread when it qualifies. Returns whether the count changed.
    pub(crate) fn increment_unread_if_needed(
        &mut self,
        message: &Message,
        current_user: Option<&User>,
        muted: bool,
    ) -> bool {
        let Some(current_user) = current_user else {
            return false;
        };
        let mut read = self
            .read
            .clone()
            .unwrap_or_else(|| ChannelUserRead::new(current_user.clone(), None));
        if !should_increment_unread(message, &current_user.id, read.last_message_seen, muted) {
            return false;
        }

        let unread = read.unread_messages.saturating_add(1);
        read.unread_messages = unread;
        read.last_message_seen = message.created_time();
        if let Some(known) = self.reads.get_mut(&current_user.id) {
            known.unread_messages = unread;
            known.last_message_seen = read.last_message_seen;
        }
        self.read = Some(read);
        self.unread_count = unread;
        debug!(cid = %self.cid, unread, "unread count incremented");
        true
    }

    /// Fold a channel returned by a query (or the offline store) into the state.
    pub(crate) fn update_data_from_channel(
        &mut self,
        channel: Channel,
        refresh_messages: bool,
        scroll_update: bool,
        current_user: Option<&User>,
        tolerance_ms: u64,
    ) {
        self.update_channel_data(channel.data());
        self.watcher_count = channel.watcher_count;
        if let Some(read) = self.read.as_mut() {
            read.last_message_seen = channel.last_message_at;
        }
        self.member_count = channel.member_count;
        self.update_reads(channel.read, current_user, tolerance_ms);
        self.upsert_members(channel.members);
        self.upsert_watchers(channel.watchers);

        if !self.search.is_inside_search() || scroll_update {
            self.upsert_messages(channel.messages, refresh_messages);
        }
        if channel.last_message_at.is_some() {
            self.last_message_at = channel.last_message_at;
        }
    }

    fn bump_last_message_at(&mut self, messages: &[Message]) {
        let newest = messages.iter().filter_map(Message::created_time).max();
        if let Some(newest) = newest {
            self.last_message_at = Some(self.last_message_at.map_or(newest, |at| at.max(newest)));
        }
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        let mut watchers: Vec<User> = self.watchers.values().cloned().collect();
        watchers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut reads: Vec<ChannelUserRead> = self.reads.values().cloned().collect();
        reads.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        let mut typing: Vec<String> = self.typing.keys().cloned().collect();
        typing.sort();

        ChannelSnapshot {
            cid: self.cid.clone(),
            channel: self.channel.clone(),
            messages: self
                .timeline
                .sorted()
                .into_iter()
                .filter(|message| self.is_visible(message))
                .collect(),
            members,
            watchers,
            reads,
            read: self.read.clone(),
            unread_count: self.unread_count,
            typing,
            has_gap: self.gap.has_gap(),
            gap: self.gap.gap_info(),
            inside_search: self.search.is_inside_search(),
            loading: self.loading,
            end_of_older_messages: self.end_of_older_messages,
            end_of_newer_messages: self.end_of_newer_messages,
            hidden: self.hidden,
            hide_messages_before: self.hide_messages_before,
            muted: self.muted,
            watcher_count: self.watcher_count,
            member_count: self.member_count,
            last_message_at: self.last_message_at,
            recovery_needed: self.recovery_needed,
        }
    }
}

/// Unread rule: newer than the last seen message, from someone else, in an
/// unmuted channel, and neither silent, shadowed, system nor a hidden thread reply.
fn should_increment_unread(
    message: &Message,
    current_user_id: &str,
    last_message_seen: Option<u64>,
    muted: bool,
) -> bool {
    if muted || message.user.id == current_user_id {
        return false;
    }
    if message.silent || message.shadowed || message.is_system() {
        return false;
    }
    if message.parent_id.is_some() && !message.show_in_channel {
        return false;
    }
    match (message.created_time(), last_message_seen) {
        (Some(created), Some(seen)) => created > seen,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User::new("alice")
    }

    fn from(user: &str, id: &str, created_at: u64) -> Message {
        Message {
            id: id.into(),
            user: User::new(user),
            created_at: Some(created_at),
            ..Message::default()
        }
    }

    fn state() -> ChannelMutableState {
        ChannelMutableState::new("messaging", "general")
    }

    #[test]
    fn new_state_knows_its_cid() {
        let state = state();
        assert_eq!(state.cid(), "messaging:general");
        assert_eq!(state.snapshot().channel.id, "general");
    }

    #[test]
    fn unread_counts_messages_from_others_only() {
        let mut state = state();
        assert!(state.increment_unread_if_needed(&from("bob", "m1", 10), Some(&alice()), false));
        assert!(!state.increment_unread_if_needed(&from("alice", "m2", 20), Some(&alice()), false));
        assert!(!state.increment_unread_if_needed(&from("bob", "m1", 10), Some(&alice()), false));
        assert!(state.increment_unread_if_needed(&from("bob", "m3", 30), Some(&alice()), false));

        assert_eq!(state.unread_count, 2);
        assert_eq!(state.read.as_ref().and_then(|r| r.last_message_seen), Some(30));
    }

    #[test]
    fn unread_skips_muted_silent_and_thread_replies() {
        let mut state = state();
        assert!(!state.increment_unread_if_needed(&from("bob", "m1", 10), Some(&alice()), true));

        let silent = Message {
            silent: true,
            ..from("bob", "m2", 20)
        };
        assert!(!state.increment_unread_if_needed(&silent, Some(&alice()), false));

        let reply = Message {
            parent_id: Some("m0".into()),
            ..from("bob", "m3", 30)
        };
        assert!(!state.increment_unread_if_needed(&reply, Some(&alice()), false));

        let system = Message {
            kind: "system".into(),
            ..from("bob", "m4", 40)
        };
        assert!(!state.increment_unread_if_needed(&system, Some(&alice()), false));
        assert_eq!(state.unread_count, 0);

        let shown_reply = Message {
            parent_id: Some("m0".into()),
            show_in_channel: true,
            ..from("bob", "m5", 50)
        };
        assert!(state.increment_unread_if_needed(&shown_reply, Some(&alice()), false));
    }

    #[test]
    fn own_read_inside_tolerance_keeps_previous_value() {
        let mut state = state();
        state.update_reads(
            vec![ChannelUserRead::new(alice(), Some(100_000))],
            Some(&alice()),
            5_000,
        );
        assert_eq!(state.read.as_ref().and_then(|r| r.last_read), Some(100_000));

        state.update_reads(
            vec![ChannelUserRead::new(alice(), Some(97_000))],
            Some(&alice()),
            5_000,
        );
        assert_eq!(state.read.as_ref().and_then(|r| r.last_read), Some(100_000));
        assert_eq!(
            state.reads.get("alice").and_then(|r| r.last_read),
            Some(100_000)
        );

        state.update_reads(
            vec![ChannelUserRead::new(alice(), Some(103_000))],
            Some(&alice()),
            5_000,
        );
        assert_eq!(state.read.as_ref().and_then(|r| r.last_read), Some(100_000));

        state.update_reads(
            vec![ChannelUserRead::new(alice(), Some(106_000))],
            Some(&alice()),
            5_000,
        );
        assert_eq!(state.read.as_ref().and_then(|r| r.last_read), Some(106_000));
    }

    #[test]
    fn reads_of_other_users_are_always_merged() {
        let mut state = state();
        state.update_reads(
            vec![
                ChannelUserRead::new(User::new("bob"), Some(5)),
                ChannelUserRead::new(User::new("carol"), Some(7)),
            ],
            Some(&alice()),
            5_000,
        );
        assert_eq!(state.reads.len(), 2);
        assert!(state.read.is_none());
    }

    #[test]
    fn hidden_history_is_not_visible() {
        let mut state = state();
        state.upsert_messages(vec![from("bob", "m1", 10), from("bob", "m2", 20)], false);
        state.hide_messages_before = Some(10);

        assert!(state.get_message("m1").is_none());
        assert!(state.get_message("m2").is_some());
        let ids: Vec<String> = state.snapshot().messages.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["m2"]);
    }

    #[test]
    fn event_upsert_keeps_own_reactions() {
        let mut state = state();
        let mut original = from("bob", "m1", 10);
        original.own_reactions = vec![chat_core::Reaction {
            message_id: "m1".into(),
            kind: "like".into(),
            ..chat_core::Reaction::default()
        }];
        state.upsert_messages(vec![original], false);

        let update = Message {
            text: "edited".into(),
            updated_at: Some(20),
            ..from("bob", "m1", 10)
        };
        state.upsert_event_message(update);
        let stored = state.get_message("m1").expect("message stays");
        assert_eq!(stored.text, "edited");
        assert_eq!(stored.own_reactions.len(), 1);
        assert_eq!(state.last_message_at, Some(10));
    }

    #[test]
    fn typing_ignores_current_user() {
        let mut state = state();
        state.set_typing("bob", Some(1), Some("alice"));
        state.set_typing("alice", Some(2), Some("alice"));
        assert_eq!(state.snapshot().typing, ["bob"]);
        state.set_typing("bob", None, Some("alice"));
        assert!(state.snapshot().typing.is_empty());
    }
}
