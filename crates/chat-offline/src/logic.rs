use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chat_core::{ChannelUserRead, ChatError, ChatEvent, Message, Reaction, User, cid_of};
use chat_platform::LocalStore;
use tracing::{debug, info, warn};

use crate::{
    context::ChatContext,
    query::{ChannelQueryClient, MessageFilter, QueryChannelRequest},
    state::{ChannelMutableState, ChannelSnapshot},
};

pub const DEFAULT_MESSAGE_LIMIT: usize = 30;
pub const DEFAULT_READ_TOLERANCE_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLogicConfig {
    /// Page size used when a caller does not pass one.
    pub default_message_limit: usize,
    /// An own read older than the known one plus this window is ignored.
    pub read_tolerance_ms: u64,
    /// Ask for member presence events when watching.
    pub user_presence: bool,
}

impl Default for ChannelLogicConfig {
    fn default() -> Self {
        Self {
            default_message_limit: DEFAULT_MESSAGE_LIMIT,
            read_tolerance_ms: DEFAULT_READ_TOLERANCE_MS,
            user_presence: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    Initial,
    Older,
    Newer,
}

/// Reconciles one channel from offline cache, channel queries and socket events.
pub struct ChannelLogic {
    channel_type: String,
    channel_id: String,
    cid: String,
    config: ChannelLogicConfig,
    state: Mutex<ChannelMutableState>,
    store: Arc<dyn LocalStore>,
    client: Arc<dyn ChannelQueryClient>,
    context: Arc<ChatContext>,
}

impl std::fmt::Debug for ChannelLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLogic")
            .field("cid", &self.cid)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelLogic {
    pub fn new(
        channel_type: &str,
        channel_id: &str,
        config: ChannelLogicConfig,
        store: Arc<dyn LocalStore>,
        client: Arc<dyn ChannelQueryClient>,
        context: Arc<ChatContext>,
    ) -> Self {
        Self {
            channel_type: channel_type.to_owned(),
            channel_id: channel_id.to_owned(),
            cid: cid_of(channel_type, channel_id),
            config,
            state: Mutex::new(ChannelMutableState::new(channel_type, channel_id)),
            store,
            client,
            context,
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn lock(&self) -> MutexGuard<'_, ChannelMutableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.lock().snapshot()
    }

    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        self.lock().get_message(message_id).cloned()
    }

    pub fn recovery_needed(&self) -> bool {
        self.lock().recovery_needed
    }

    /// Load the newest page and start watching the channel.
    ///
    /// A call made while another initial load is running returns the current
    /// snapshot without querying.
    pub async fn watch(&self, limit: Option<usize>) -> Result<ChannelSnapshot, ChatError> {
        let limit = limit.unwrap_or(self.config.default_message_limit);
        if let Some(snapshot) = self.begin_load(LoadKind::Initial) {
            return Ok(snapshot);
        }
        let request = QueryChannelRequest::new(limit).with_presence(self.config.user_presence);
        self.run_query(request, LoadKind::Initial).await
    }

    /// Load a page older than `base_message_id`, or older than the oldest loaded message.
    pub async fn load_older_messages(
        &self,
        limit: usize,
        base_message_id: Option<String>,
    ) -> Result<ChannelSnapshot, ChatError> {
        if let Some(snapshot) = self.begin_load(LoadKind::Older) {
            return Ok(snapshot);
        }
        let base = base_message_id.or_else(|| self.lock().timeline.oldest_id());
        let mut request = QueryChannelRequest::new(limit).with_presence(self.config.user_presence);
        if let Some(base) = base {
            request = request.with_filter(MessageFilter::LessThan(base));
        }
        self.run_query(request, LoadKind::Older).await
    }

    /// Load a page newer than `base_message_id`. Always goes online.
    pub async fn load_newer_messages(
        &self,
        limit: usize,
        base_message_id: String,
    ) -> Result<ChannelSnapshot, ChatError> {
        if let Some(snapshot) = self.begin_load(LoadKind::Newer) {
            return Ok(snapshot);
        }
        let request = QueryChannelRequest::new(limit)
            .with_presence(self.config.user_presence)
            .with_filter(MessageFilter::GreaterThan(base_message_id));
        self.run_query(request, LoadKind::Newer).await
    }

    /// Jump to the window surrounding `message_id`; the channel enters search mode.
    pub async fn load_messages_around_id(
        &self,
        message_id: String,
    ) -> Result<ChannelSnapshot, ChatError> {
        if let Some(snapshot) = self.begin_load(LoadKind::Initial) {
            return Ok(snapshot);
        }
        let request = QueryChannelRequest::new(self.config.default_message_limit)
            .with_presence(self.config.user_presence)
            .with_filter(MessageFilter::AroundId(message_id));
        self.run_query(request, LoadKind::Initial).await
    }

    /// Set the loading flag for `kind`, or return the current snapshot if it is already set.
    fn begin_load(&self, kind: LoadKind) -> Option<ChannelSnapshot> {
        let mut state = self.lock();
        let flag = loading_flag(&mut state, kind);
        if *flag {
            debug!(cid = %self.cid, ?kind, "load already running");
            return Some(state.snapshot());
        }
        *flag = true;
        state.muted = self.context.is_channel_muted(&self.cid);
        None
    }

    fn finish_load(&self, state: &mut ChannelMutableState, kind: LoadKind) {
        *loading_flag(state, kind) = false;
    }

    async fn run_query(
        &self,
        request: QueryChannelRequest,
        kind: LoadKind,
    ) -> Result<ChannelSnapshot, ChatError> {
        let offline_loaded = if request.is_filtering_newer_messages() {
            false
        } else {
            self.load_offline(&request).await
        };

        match self
            .client
            .query_channel(&self.channel_type, &self.channel_id, &request)
            .await
        {
            Ok(channel) => {
                if let Err(error) = self.store.insert_channel(&channel).await {
                    warn!(cid = %self.cid, %error, "failed to persist queried channel");
                }
                let current_user = self.context.current_user();
                let mut state = self.lock();
                let no_more_messages = request.messages_limit > channel.messages.len();

                let inside_search = state.search.is_inside_search();
                if request.is_filtering_newer_messages() {
                    state.gap.handle_newer_messages_limit(
                        !no_more_messages,
                        &channel.messages,
                        inside_search,
                    );
                } else if !request.is_filtering_around_id() {
                    state
                        .gap
                        .handle_older_messages_limit(!no_more_messages, &channel.messages);
                }
                state.search.handle_message_bounds(&request, no_more_messages);

                match &request.filter {
                    None => {
                        state.end_of_older_messages = no_more_messages;
                        state.end_of_newer_messages = true;
                    }
                    Some(MessageFilter::LessThan(_)) => state.end_of_older_messages = no_more_messages,
                    Some(MessageFilter::GreaterThan(_)) => {
                        state.end_of_newer_messages = no_more_messages;
                    }
                    Some(MessageFilter::AroundId(_)) => {
                        state.end_of_older_messages = false;
                        state.end_of_newer_messages = false;
                    }
                }

                if let Some(hidden) = channel.hidden {
                    state.hidden = hidden;
                }
                if channel.hidden_messages_before.is_some() {
                    state.hide_messages_before = channel.hidden_messages_before;
                }
                state.recovery_needed = false;
                state.update_data_from_channel(
                    channel,
                    request.is_filtering_around_id(),
                    true,
                    current_user.as_ref(),
                    self.config.read_tolerance_ms,
                );
                self.finish_load(&mut state, kind);
                info!(
                    cid = %self.cid,
                    ?kind,
                    no_more_messages,
                    has_gap = state.gap.has_gap(),
                    inside_search = state.search.is_inside_search(),
                    "channel query applied"
                );
                Ok(state.snapshot())
            }
            Err(error) => {
                warn!(cid = %self.cid, ?kind, %error, "channel query failed");
                let mut state = self.lock();
                if !error.is_permanent() {
                    state.recovery_needed = true;
                }
                self.finish_load(&mut state, kind);
                if offline_loaded {
                    Ok(state.snapshot())
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Apply cached data for `request`. Returns whether anything was found.
    async fn load_offline(&self, request: &QueryChannelRequest) -> bool {
        if request.is_filtering_older_messages() {
            return self.load_offline_older(request).await;
        }

        let channel = match self
            .store
            .select_channel(&self.cid, request.messages_limit)
            .await
        {
            Ok(Some(channel)) => channel,
            Ok(None) => return false,
            Err(error) => {
                warn!(cid = %self.cid, %error, "offline channel lookup failed");
                return false;
            }
        };
        debug!(cid = %self.cid, messages = channel.messages.len(), "offline channel loaded");
        let current_user = self.context.current_user();
        let mut state = self.lock();
        state.update_data_from_channel(
            channel,
            false,
            true,
            current_user.as_ref(),
            self.config.read_tolerance_ms,
        );
        true
    }

    async fn load_offline_older(&self, request: &QueryChannelRequest) -> bool {
        let Some(base_id) = request.base_message_id() else {
            return false;
        };
        let local_time = self
            .lock()
            .timeline
            .get(base_id)
            .and_then(Message::created_time);
        let base_time = match local_time {
            Some(time) => Some(time),
            None => match self.store.select_message(base_id).await {
                Ok(message) => message.as_ref().and_then(Message::created_time),
                Err(error) => {
                    warn!(cid = %self.cid, %error, "offline base message lookup failed");
                    None
                }
            },
        };
        let Some(base_time) = base_time else {
            return false;
        };

        match self
            .store
            .select_messages_before(&self.cid, base_time, request.messages_limit)
            .await
        {
            Ok(messages) if messages.is_empty() => false,
            Ok(messages) => {
                debug!(cid = %self.cid, count = messages.len(), "offline older page loaded");
                self.lock().upsert_messages(messages, false);
                true
            }
            Err(error) => {
                warn!(cid = %self.cid, %error, "offline older page lookup failed");
                false
            }
        }
    }

    pub fn handle_events(&self, events: &[ChatEvent]) {
        for event in events {
            self.handle_event(event);
        }
    }

    /// Fold one socket event into the channel state.
    pub fn handle_event(&self, event: &ChatEvent) {
        let current_user = self.context.current_user();
        let me = current_user.as_ref();
        let tolerance = self.config.read_tolerance_ms;
        let mut persist = Vec::new();
        let mut truncate_before = None;
        {
            let mut state = self.lock();
            state.muted = self.context.is_channel_muted(&self.cid);

            match event {
                ChatEvent::NewMessage { message, .. }
                | ChatEvent::NotificationMessageNew { message, .. } => {
                    if state.search.is_inside_search() {
                        debug!(cid = %self.cid, id = %message.id, "new message kept out of search window");
                    } else {
                        state.upsert_event_message(message.clone());
                    }
                    let muted = state.muted;
                    state.increment_unread_if_needed(message, me, muted);
                    state.hidden = false;
                    persist.push(message.clone());
                }
                ChatEvent::MessageUpdated { message, .. } => {
                    let mut message = message.clone();
                    message.quoted_message = message
                        .reply_to_id
                        .as_deref()
                        .and_then(|id| state.timeline.get(id))
                        .map(|quoted| Box::new(quoted.clone()));
                    state.upsert_event_message(message.clone());
                    state.hidden = false;
                    persist.push(message);
                }
                ChatEvent::MessageDeleted {
                    message,
                    hard_delete,
                    ..
                } => {
                    if *hard_delete {
                        state.remove_message(&message.id);
                    } else {
                        state.upsert_event_message(message.clone());
                        persist.push(message.clone());
                    }
                    state.hidden = false;
                }
                ChatEvent::ReactionNew {
                    message, reaction, ..
                }
                | ChatEvent::ReactionUpdated {
                    message, reaction, ..
                } => {
                    let merged = merge_own_reaction(&state, message, reaction, me, true);
                    state.upsert_messages(vec![merged.clone()], false);
                    persist.push(merged);
                }
                ChatEvent::ReactionDeleted {
                    message, reaction, ..
                } => {
                    let merged = merge_own_reaction(&state, message, reaction, me, false);
                    state.upsert_messages(vec![merged.clone()], false);
                    persist.push(merged);
                }
                ChatEvent::MemberAdded { member, .. } => {
                    if !state.members.contains_key(member.user_id()) {
                        state.member_count = state.member_count.saturating_add(1);
                    }
                    state.upsert_members([member.clone()]);
                }
                ChatEvent::MemberUpdated { member, .. } => {
                    state.upsert_members([member.clone()]);
                }
                ChatEvent::MemberRemoved { user, .. } => state.delete_member(&user.id),
                ChatEvent::NotificationRemovedFromChannel { member, .. } => {
                    state.delete_member(member.user_id());
                }
                ChatEvent::NotificationAddedToChannel { channel, .. } => {
                    let added = channel
                        .members
                        .iter()
                        .filter(|member| !state.members.contains_key(member.user_id()))
                        .count();
                    state.member_count = state
                        .member_count
                        .saturating_add(u32::try_from(added).unwrap_or(u32::MAX));
                    state.upsert_members(channel.members.iter().cloned());
                }
                ChatEvent::NotificationInviteAccepted { member, channel, .. }
                | ChatEvent::NotificationInviteRejected { member, channel, .. } => {
                    state.upsert_members([member.clone()]);
                    state.update_channel_data(channel.clone());
                }
                ChatEvent::UserStartWatching {
                    user,
                    watcher_count,
                    ..
                } => {
                    state.upsert_watchers([user.clone()]);
                    state.watcher_count = *watcher_count;
                }
                ChatEvent::UserStopWatching {
                    user,
                    watcher_count,
                    ..
                } => {
                    state.delete_watcher(&user.id);
                    state.watcher_count = *watcher_count;
                }
                ChatEvent::ChannelUpdated { channel, .. } => {
                    state.update_channel_data(channel.clone());
                }
                ChatEvent::ChannelHidden {
                    clear_history,
                    created_at,
                    ..
                } => {
                    state.hidden = true;
                    if *clear_history {
                        state.hide_messages_before = Some(*created_at);
                    }
                }
                ChatEvent::ChannelVisible { .. } => state.hidden = false,
                ChatEvent::ChannelDeleted { created_at, .. } => {
                    state.remove_messages_before(*created_at, None);
                    truncate_before = Some(*created_at);
                    state.channel.deleted_at = Some(*created_at);
                }
                ChatEvent::ChannelTruncated {
                    message,
                    created_at,
                    ..
                } => {
                    state.remove_messages_before(*created_at, message.clone());
                    truncate_before = Some(*created_at);
                    persist.extend(message.iter().cloned());
                }
                ChatEvent::NotificationChannelTruncated { created_at, .. } => {
                    state.remove_messages_before(*created_at, None);
                    truncate_before = Some(*created_at);
                }
                ChatEvent::TypingStart {
                    user, created_at, ..
                } => {
                    state.set_typing(&user.id, Some(*created_at), me.map(|u| u.id.as_str()));
                }
                ChatEvent::TypingStop { user, .. } => {
                    state.set_typing(&user.id, None, me.map(|u| u.id.as_str()));
                }
                ChatEvent::MessageRead {
                    user, created_at, ..
                }
                | ChatEvent::NotificationMarkRead {
                    user, created_at, ..
                }
                | ChatEvent::MarkAllRead {
                    user, created_at, ..
                } => {
                    let read = ChannelUserRead::new(user.clone(), Some(*created_at));
                    state.update_reads(vec![read], me, tolerance);
                }
                ChatEvent::UserPresenceChanged { user, .. } => state.upsert_user_presence(user),
                ChatEvent::UserUpdated { user, .. } => state.upsert_user(user),
                ChatEvent::NotificationChannelMutesUpdated { me: own, .. } => {
                    state.muted = own.channel_mutes.iter().any(|mute| mute.cid == self.cid);
                }
                ChatEvent::NotificationInvited { .. }
                | ChatEvent::NotificationChannelDeleted { .. }
                | ChatEvent::ChannelUserBanned { .. }
                | ChatEvent::ChannelUserUnbanned { .. }
                | ChatEvent::UserDeleted { .. }
                | ChatEvent::HealthCheck { .. }
                | ChatEvent::Connected(_)
                | ChatEvent::Unknown => {
                    debug!(cid = %self.cid, event = event.type_name(), "event not applied to channel");
                }
            }
        }

        self.persist_in_background(persist, truncate_before);
    }

    /// Add or replace messages created locally.
    pub fn upsert_messages(&self, messages: Vec<Message>) {
        self.lock().upsert_messages(messages, false);
    }

    pub fn remove_local_message(&self, message_id: &str) {
        self.lock().remove_message(message_id);
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.lock().hidden = hidden;
    }

    /// Hide every message created at or before `date`.
    pub fn hide_messages_before(&self, date: u64) {
        self.lock().hide_messages_before = Some(date);
    }

    fn persist_in_background(&self, messages: Vec<Message>, truncate_before: Option<u64>) {
        if messages.is_empty() && truncate_before.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(cid = %self.cid, "no runtime; event changes not persisted");
            return;
        };
        let store = Arc::clone(&self.store);
        let cid = self.cid.clone();
        runtime.spawn(async move {
            if let Some(date) = truncate_before {
                if let Err(error) = store
                    .delete_channel_messages_before(&cid, date.saturating_add(1))
                    .await
                {
                    warn!(%cid, %error, "failed to truncate offline messages");
                }
            }
            if !messages.is_empty() {
                if let Err(error) = store.insert_messages(&messages).await {
                    warn!(%cid, %error, "failed to persist event messages");
                }
            }
        });
    }
}

fn loading_flag(state: &mut ChannelMutableState, kind: LoadKind) -> &mut bool {
    match kind {
        LoadKind::Initial => &mut state.loading.initial,
        LoadKind::Older => &mut state.loading.older,
        LoadKind::Newer => &mut state.loading.newer,
    }
}

/// Event copy of `message` with the stored own reactions, adjusted for a reaction by the current user.
fn merge_own_reaction(
    state: &ChannelMutableState,
    message: &Message,
    reaction: &Reaction,
    current_user: Option<&User>,
    added: bool,
) -> Message {
    let mut merged = message.clone();
    merged.own_reactions = state
        .timeline
        .get(&message.id)
        .map(|existing| existing.own_reactions.clone())
        .unwrap_or_default();

    let by_me = match (reaction.user.as_ref(), current_user) {
        (Some(author), Some(me)) => author.id == me.id,
        _ => false,
    };
    if by_me {
        merged.own_reactions.retain(|own| own.kind != reaction.kind);
        if added {
            merged.own_reactions.push(reaction.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chat_core::{Channel, ChatErrorCode, OwnUser};
    use chat_platform::InMemoryLocalStore;

    use super::*;

    const CID: &str = "messaging:general";

    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Channel, ChatError>>>,
        requests: Mutex<Vec<QueryChannelRequest>>,
    }

    impl ScriptedClient {
        fn push(&self, response: Result<Channel, ChatError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn requests(&self) -> Vec<QueryChannelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelQueryClient for ScriptedClient {
        async fn query_channel(
            &self,
            _channel_type: &str,
            _channel_id: &str,
            request: &QueryChannelRequest,
        ) -> Result<Channel, ChatError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ChatError::generic("no scripted response")))
        }
    }

    struct Fixture {
        logic: Arc<ChannelLogic>,
        client: Arc<ScriptedClient>,
        store: Arc<InMemoryLocalStore>,
        context: Arc<ChatContext>,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(ScriptedClient::default());
        let store = Arc::new(InMemoryLocalStore::new());
        let context = Arc::new(ChatContext::new());
        context.set_own_user(&OwnUser {
            id: "alice".into(),
            ..OwnUser::default()
        });
        let logic = Arc::new(ChannelLogic::new(
            "messaging",
            "general",
            ChannelLogicConfig::default(),
            store.clone(),
            client.clone(),
            context.clone(),
        ));
        Fixture {
            logic,
            client,
            store,
            context,
        }
    }

    fn message(id: &str, user: &str, created_at: u64) -> Message {
        Message {
            id: id.into(),
            cid: CID.into(),
            user: User::new(user),
            created_at: Some(created_at),
            ..Message::default()
        }
    }

    fn channel(messages: Vec<Message>) -> Channel {
        Channel {
            cid: CID.into(),
            channel_type: "messaging".into(),
            id: "general".into(),
            messages,
            ..Channel::default()
        }
    }

    fn ids(snapshot: &ChannelSnapshot) -> Vec<String> {
        snapshot.messages.iter().map(|m| m.id.clone()).collect()
    }

    fn new_message(message: Message) -> ChatEvent {
        ChatEvent::NewMessage {
            cid: CID.into(),
            message,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn watch_applies_and_persists_query_result() {
        let f = fixture();
        f.client.push(Ok(channel(vec![
            message("m1", "bob", 10),
            message("m2", "bob", 20),
        ])));

        let snapshot = f.logic.watch(None).await.expect("watch succeeds");
        assert_eq!(ids(&snapshot), ["m1", "m2"]);
        assert!(snapshot.end_of_older_messages);
        assert!(snapshot.end_of_newer_messages);
        assert!(!snapshot.loading.initial);
        assert_eq!(snapshot.last_message_at, Some(20));
        assert_eq!(f.client.requests()[0].messages_limit, DEFAULT_MESSAGE_LIMIT);

        let stored = f.store.select_channel(CID, 30).await.unwrap().expect("persisted");
        assert_eq!(stored.messages.len(), 2);
    }

    #[tokio::test]
    async fn failed_query_falls_back_to_offline_cache() {
        let f = fixture();
        f.store
            .insert_channel(&channel(vec![message("cached", "bob", 5)]))
            .await
            .unwrap();
        f.client.push(Err(ChatError::network(
            ChatErrorCode::NetworkFailed,
            "offline",
        )));

        let snapshot = f.logic.watch(Some(10)).await.expect("offline data served");
        assert_eq!(ids(&snapshot), ["cached"]);
        assert!(snapshot.recovery_needed);
        assert!(!snapshot.loading.initial);
        assert!(f.logic.recovery_needed());
    }

    #[tokio::test]
    async fn failed_query_without_cache_returns_error() {
        let f = fixture();
        f.client.push(Err(ChatError::network(
            ChatErrorCode::ValidationError,
            "bad request",
        )
        .with_status(400)));

        let error = f.logic.watch(None).await.expect_err("nothing to serve");
        assert_eq!(error.code, ChatErrorCode::ValidationError);
        assert!(!f.logic.recovery_needed());
        assert!(!f.logic.snapshot().loading.initial);
    }

    #[tokio::test]
    async fn successful_query_clears_recovery_flag() {
        let f = fixture();
        f.client
            .push(Err(ChatError::network(ChatErrorCode::SocketFailure, "down")));
        f.client.push(Ok(channel(vec![message("m1", "bob", 10)])));

        assert!(f.logic.watch(None).await.is_err());
        assert!(f.logic.recovery_needed());
        f.logic.watch(None).await.expect("second watch succeeds");
        assert!(!f.logic.recovery_needed());
    }

    #[tokio::test]
    async fn older_page_uses_oldest_loaded_message_as_base() {
        let f = fixture();
        f.client.push(Ok(channel(vec![
            message("m3", "bob", 30),
            message("m4", "bob", 40),
        ])));
        f.client.push(Ok(channel(vec![
            message("m1", "bob", 10),
            message("m2", "bob", 20),
        ])));

        let first = f.logic.watch(Some(2)).await.unwrap();
        assert!(!first.end_of_older_messages);
        let snapshot = f.logic.load_older_messages(2, None).await.unwrap();

        assert_eq!(ids(&snapshot), ["m1", "m2", "m3", "m4"]);
        assert_eq!(
            f.client.requests()[1].filter,
            Some(MessageFilter::LessThan("m3".into()))
        );
        assert!(!snapshot.has_gap);
    }

    #[tokio::test]
    async fn newer_page_in_search_window_opens_gap() {
        let f = fixture();
        f.client.push(Ok(channel(vec![
            message("m1", "bob", 10),
            message("m2", "bob", 20),
        ])));
        f.client.push(Ok(channel(vec![
            message("m49", "bob", 490),
            message("m50", "bob", 500),
            message("m51", "bob", 510),
        ])));
        f.client.push(Ok(channel(vec![
            message("m52", "bob", 520),
            message("m53", "bob", 530),
        ])));

        f.logic.watch(Some(2)).await.unwrap();
        let around = f.logic.load_messages_around_id("m50".into()).await.unwrap();
        assert!(around.inside_search);
        assert_eq!(ids(&around), ["m49", "m50", "m51"]);

        let snapshot = f.logic.load_newer_messages(2, "m51".into()).await.unwrap();
        assert!(snapshot.has_gap);
        let gap = snapshot.gap.expect("gap info");
        assert_eq!(gap.below_gap_ids, ["m1", "m2"]);
        assert_eq!(gap.above_gap_ids, ["m52", "m53"]);
        assert!(snapshot.inside_search);
    }

    #[tokio::test]
    async fn new_messages_stay_out_of_search_window_until_it_reaches_the_end() {
        let f = fixture();
        f.client.push(Ok(channel(vec![message("m5", "bob", 50)])));
        f.client.push(Ok(channel(vec![message("m6", "bob", 60)])));

        f.logic.load_messages_around_id("m5".into()).await.unwrap();
        f.logic.handle_event(&new_message(message("m99", "bob", 990)));

        let snapshot = f.logic.snapshot();
        assert!(snapshot.inside_search);
        assert_eq!(ids(&snapshot), ["m5"]);
        assert_eq!(snapshot.unread_count, 1);

        let snapshot = f.logic.load_newer_messages(30, "m5".into()).await.unwrap();
        assert!(!snapshot.inside_search);
        assert!(snapshot.end_of_newer_messages);
        assert_eq!(ids(&snapshot), ["m5", "m6"]);
    }

    #[tokio::test]
    async fn own_read_events_respect_tolerance() {
        let f = fixture();
        f.logic.handle_events(&[
            new_message(message("m1", "bob", 1_000)),
            new_message(message("m2", "bob", 2_000)),
            new_message(message("m3", "alice", 3_000)),
        ]);
        assert_eq!(f.logic.snapshot().unread_count, 2);

        let read = |at: u64| ChatEvent::MessageRead {
            cid: CID.into(),
            user: User::new("alice"),
            created_at: at,
        };
        f.logic.handle_event(&read(100_000));
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.read.as_ref().and_then(|r| r.last_read), Some(100_000));

        f.logic.handle_event(&read(97_000));
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.read.as_ref().and_then(|r| r.last_read), Some(100_000));
        let own = snapshot
            .reads
            .iter()
            .find(|r| r.user_id() == "alice")
            .expect("own read kept");
        assert_eq!(own.last_read, Some(100_000));
    }

    #[tokio::test]
    async fn muted_channel_does_not_count_unread() {
        let f = fixture();
        f.context.set_own_user(&OwnUser {
            id: "alice".into(),
            channel_mutes: vec![chat_core::ChannelMute { cid: CID.into() }],
            ..OwnUser::default()
        });
        f.logic.handle_event(&new_message(message("m1", "bob", 10)));
        let snapshot = f.logic.snapshot();
        assert!(snapshot.muted);
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(ids(&snapshot), ["m1"]);
    }

    #[test]
    fn concurrent_duplicate_delivery_counts_once() {
        let f = fixture();
        let event = new_message(message("m1", "bob", 10));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| f.logic.handle_event(&event));
            }
        });
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.unread_count, 1);
        assert_eq!(ids(&snapshot), ["m1"]);
    }

    #[test]
    fn concurrent_delivery_of_two_messages_counts_each_once() {
        let f = fixture();
        let events = [
            new_message(message("m1", "bob", 10)),
            new_message(message("m2", "carol", 20)),
        ];
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| f.logic.handle_events(&events));
            }
        });
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.unread_count, 2);
        assert_eq!(ids(&snapshot), ["m1", "m2"]);
    }

    #[test]
    fn hidden_with_cleared_history_hides_older_messages() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10), message("m2", "bob", 30)]);
        f.logic.handle_event(&ChatEvent::ChannelHidden {
            cid: CID.into(),
            clear_history: true,
            created_at: 20,
        });
        let snapshot = f.logic.snapshot();
        assert!(snapshot.hidden);
        assert_eq!(ids(&snapshot), ["m2"]);

        f.logic.handle_event(&new_message(message("m3", "bob", 40)));
        assert!(!f.logic.snapshot().hidden);
    }

    #[test]
    fn truncation_keeps_system_message() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10), message("m2", "bob", 30)]);
        let system = Message {
            kind: "system".into(),
            ..message("sys", "bob", 50)
        };
        f.logic.handle_event(&ChatEvent::ChannelTruncated {
            cid: CID.into(),
            message: Some(system),
            created_at: 40,
        });
        assert_eq!(ids(&f.logic.snapshot()), ["sys"]);
    }

    #[test]
    fn own_reactions_follow_reaction_events() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10)]);
        let like = Reaction {
            message_id: "m1".into(),
            kind: "like".into(),
            user: Some(User::new("alice")),
            score: 1,
        };
        f.logic.handle_event(&ChatEvent::ReactionNew {
            cid: CID.into(),
            message: message("m1", "bob", 10),
            reaction: like.clone(),
            created_at: 11,
        });
        let stored = f.logic.get_message("m1").expect("message");
        assert_eq!(stored.own_reactions, vec![like.clone()]);

        f.logic.handle_event(&ChatEvent::ReactionDeleted {
            cid: CID.into(),
            message: message("m1", "bob", 10),
            reaction: like,
            created_at: 12,
        });
        assert!(f.logic.get_message("m1").unwrap().own_reactions.is_empty());
    }

    #[test]
    fn members_and_watchers_track_events() {
        let f = fixture();
        f.logic.handle_event(&ChatEvent::MemberAdded {
            cid: CID.into(),
            member: chat_core::Member {
                user: User::new("bob"),
                role: None,
            },
            created_at: 1,
        });
        f.logic.handle_event(&ChatEvent::UserStartWatching {
            cid: CID.into(),
            user: User::new("bob"),
            watcher_count: 3,
            created_at: 2,
        });
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.member_count, 1);
        assert_eq!(snapshot.watcher_count, 3);
        assert_eq!(snapshot.watchers.len(), 1);

        f.logic.handle_event(&ChatEvent::MemberRemoved {
            cid: CID.into(),
            user: User::new("bob"),
            created_at: 3,
        });
        f.logic.handle_event(&ChatEvent::MemberRemoved {
            cid: CID.into(),
            user: User::new("bob"),
            created_at: 4,
        });
        let snapshot = f.logic.snapshot();
        assert!(snapshot.members.is_empty());
        assert_eq!(snapshot.member_count, 0);
    }

    #[test]
    fn channel_deleted_drops_loaded_messages() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10), message("m2", "bob", 20)]);
        f.logic.handle_event(&ChatEvent::ChannelDeleted {
            cid: CID.into(),
            created_at: 30,
        });
        let snapshot = f.logic.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.channel.deleted_at, Some(30));
    }

    #[test]
    fn message_updates_bring_hidden_channel_back() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10), message("m2", "bob", 20)]);
        f.logic.set_hidden(true);
        let edited = Message {
            text: "edited".into(),
            reply_to_id: Some("m1".into()),
            updated_at: Some(25),
            ..message("m2", "bob", 20)
        };
        f.logic.handle_event(&ChatEvent::MessageUpdated {
            cid: CID.into(),
            message: edited,
            created_at: 25,
        });
        assert!(!f.logic.snapshot().hidden);
        let stored = f.logic.get_message("m2").expect("message");
        assert_eq!(stored.text, "edited");
        assert_eq!(
            stored.quoted_message.map(|quoted| quoted.id),
            Some("m1".to_owned())
        );
    }

    #[test]
    fn message_deletes_bring_hidden_channel_back() {
        let f = fixture();
        f.logic.upsert_messages(vec![message("m1", "bob", 10), message("m2", "bob", 20)]);

        f.logic.set_hidden(true);
        f.logic.handle_event(&ChatEvent::MessageDeleted {
            cid: CID.into(),
            message: Message {
                deleted_at: Some(30),
                ..message("m1", "bob", 10)
            },
            hard_delete: false,
            created_at: 30,
        });
        assert!(!f.logic.snapshot().hidden);

        f.logic.set_hidden(true);
        f.logic.handle_event(&ChatEvent::MessageDeleted {
            cid: CID.into(),
            message: message("m2", "bob", 20),
            hard_delete: true,
            created_at: 31,
        });
        let snapshot = f.logic.snapshot();
        assert!(!snapshot.hidden);
        assert!(f.logic.get_message("m2").is_none());
    }

    #[test]
    fn added_to_channel_counts_new_members() {
        let f = fixture();
        let member = |id: &str| chat_core::Member {
            user: User::new(id),
            role: None,
        };
        f.logic.handle_event(&ChatEvent::MemberAdded {
            cid: CID.into(),
            member: member("bob"),
            created_at: 1,
        });
        f.logic.handle_event(&ChatEvent::NotificationAddedToChannel {
            cid: CID.into(),
            channel: Channel {
                members: vec![member("alice"), member("bob")],
                member_count: 7,
                ..channel(Vec::new())
            },
            created_at: 2,
        });
        let snapshot = f.logic.snapshot();
        assert_eq!(snapshot.member_count, 2);
        let member_ids: Vec<_> = snapshot.members.iter().map(|m| m.user_id()).collect();
        assert_eq!(member_ids, ["alice", "bob"]);
    }
}
