use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Chat user as seen by the connection layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct User {
    /// Stable user identifier.
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Presence flag reported by the server.
    #[serde(default)]
    pub online: bool,
}

impl User {
    /// Build a user with only an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            online: false,
        }
    }
}

/// Authenticated user payload carried by the connection acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OwnUser {
    /// Stable user identifier.
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Channels muted by this user.
    #[serde(default)]
    pub channel_mutes: Vec<ChannelMute>,
}

impl OwnUser {
    /// Project the own-user payload onto a plain [`User`].
    pub fn as_user(&self) -> User {
        User {
            id: self.id.clone(),
            name: self.name.clone(),
            online: true,
        }
    }
}

/// A channel mute entry of the current user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMute {
    /// Muted channel cid (`type:id`).
    pub cid: String,
}

/// Whether a locally created or edited message has been confirmed by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local change not sent yet.
    SyncNeeded,
    /// Local change is being sent.
    InProgress,
    /// Message is persisted server side.
    #[default]
    Completed,
    /// Local change was rejected and will not be retried.
    FailedPermanently,
}

/// Reaction attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Reaction {
    /// Message this reaction belongs to.
    pub message_id: String,
    /// Reaction kind, for example `like`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Reacting user.
    #[serde(default)]
    pub user: Option<User>,
    /// Reaction score.
    #[serde(default)]
    pub score: u32,
}

/// Chat message consumed by the channel reconciler.
///
/// All timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Message {
    /// Message identifier.
    pub id: String,
    /// Channel cid (`type:id`) this message belongs to.
    #[serde(default)]
    pub cid: String,
    /// Author.
    #[serde(default)]
    pub user: User,
    /// Text body.
    #[serde(default)]
    pub text: String,
    /// `regular`, `system`, `ephemeral`; empty when unknown.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Server creation time.
    #[serde(default)]
    pub created_at: Option<u64>,
    /// Server update time.
    #[serde(default)]
    pub updated_at: Option<u64>,
    /// Deletion time (server or local).
    #[serde(default)]
    pub deleted_at: Option<u64>,
    /// Local creation time for optimistic messages.
    #[serde(default)]
    pub created_locally_at: Option<u64>,
    /// Local update time for optimistic edits.
    #[serde(default)]
    pub updated_locally_at: Option<u64>,
    /// Sync status of the local copy.
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Thread parent when this message is a thread reply.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Whether a thread reply is also shown in the channel.
    #[serde(default)]
    pub show_in_channel: bool,
    /// Quoted message id.
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// Quoted message, resolved from the local timeline when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_message: Option<Box<Message>>,
    /// Silent messages never bump unread counters.
    #[serde(default)]
    pub silent: bool,
    /// Shadowed messages are only visible to their author.
    #[serde(default)]
    pub shadowed: bool,
    /// Reactions of the current user.
    #[serde(default)]
    pub own_reactions: Vec<Reaction>,
    /// Latest reactions of any user.
    #[serde(default)]
    pub latest_reactions: Vec<Reaction>,
}

impl Message {
    /// Latest server-side timestamp of this message.
    pub fn last_update_time(&self) -> u64 {
        [self.created_at, self.updated_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
    }

    /// Latest local timestamp of this message.
    pub fn last_local_update_time(&self) -> u64 {
        [
            self.created_locally_at,
            self.updated_locally_at,
            self.deleted_at,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }

    /// Ordering key matching this message's sync status.
    ///
    /// Server-confirmed copies compare by server timestamps, pending local
    /// copies by local timestamps.
    pub fn ordering_key(&self) -> u64 {
        if self.sync_status == SyncStatus::Completed {
            self.last_update_time()
        } else {
            self.last_local_update_time()
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == "system"
    }

    /// Creation time used for timeline ordering and gap classification.
    pub fn created_time(&self) -> Option<u64> {
        self.created_at.or(self.created_locally_at)
    }

    /// Whether `self` may replace `current` in a timeline. Each side is
    /// compared by the key matching its own sync status.
    pub fn supersedes(&self, current: Option<&Message>) -> bool {
        current.is_none_or(|current| current.ordering_key() <= self.ordering_key())
    }
}

/// Channel member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Member {
    /// Member user.
    pub user: User,
    /// Channel role, for example `owner` or `member`.
    #[serde(default)]
    pub role: Option<String>,
}

impl Member {
    /// Identifier of the member user.
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// Read state of one user in one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChannelUserRead {
    /// Reader.
    pub user: User,
    /// Last time the user marked the channel read.
    #[serde(default)]
    pub last_read: Option<u64>,
    /// Unread message count for the user.
    #[serde(default)]
    pub unread_messages: u32,
    /// Creation time of the newest message the user has seen.
    #[serde(default)]
    pub last_message_seen: Option<u64>,
}

impl ChannelUserRead {
    /// Build a read marker for `user` at `last_read`.
    pub fn new(user: User, last_read: Option<u64>) -> Self {
        Self {
            user,
            last_read,
            unread_messages: 0,
            last_message_seen: None,
        }
    }

    /// Identifier of the reading user.
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// Channel metadata without the message/member payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChannelData {
    /// Channel cid (`type:id`).
    pub cid: String,
    /// Channel type.
    #[serde(default)]
    pub channel_type: String,
    /// Channel id within its type.
    #[serde(default)]
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Creator of the channel.
    #[serde(default)]
    pub created_by: Option<User>,
    /// Frozen channels reject new messages.
    #[serde(default)]
    pub frozen: bool,
    /// Deletion time.
    #[serde(default)]
    pub deleted_at: Option<u64>,
    /// Ownership capabilities of the current user (`send-message`, `upload-file`, ...).
    #[serde(default)]
    pub own_capabilities: HashSet<String>,
}

/// Channel payload returned by channel queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Channel {
    /// Channel cid (`type:id`).
    pub cid: String,
    /// Channel type.
    #[serde(default)]
    pub channel_type: String,
    /// Channel id within its type.
    #[serde(default)]
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Creator of the channel.
    #[serde(default)]
    pub created_by: Option<User>,
    /// Frozen channels reject new messages.
    #[serde(default)]
    pub frozen: bool,
    /// Deletion time.
    #[serde(default)]
    pub deleted_at: Option<u64>,
    /// Ownership capabilities of the current user.
    #[serde(default)]
    pub own_capabilities: HashSet<String>,
    /// Page of messages returned by the query.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Members returned by the query.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Watchers returned by the query.
    #[serde(default)]
    pub watchers: Vec<User>,
    /// Read states returned by the query.
    #[serde(default)]
    pub read: Vec<ChannelUserRead>,
    /// Number of watchers.
    #[serde(default)]
    pub watcher_count: u32,
    /// Number of members.
    #[serde(default)]
    pub member_count: u32,
    /// Creation time of the newest message.
    #[serde(default)]
    pub last_message_at: Option<u64>,
    /// Hidden flag for the current user.
    #[serde(default)]
    pub hidden: Option<bool>,
    /// Messages created before this time are hidden for the current user.
    #[serde(default)]
    pub hidden_messages_before: Option<u64>,
}

impl Channel {
    /// Metadata portion of the channel.
    pub fn data(&self) -> ChannelData {
        ChannelData {
            cid: self.cid.clone(),
            channel_type: self.channel_type.clone(),
            id: self.id.clone(),
            name: self.name.clone(),
            created_by: self.created_by.clone(),
            frozen: self.frozen,
            deleted_at: self.deleted_at,
            own_capabilities: self.own_capabilities.clone(),
        }
    }
}

/// Build a channel cid from its type and id.
pub fn cid_of(channel_type: &str, channel_id: &str) -> String {
    format!("{channel_type}:{channel_id}")
}

/// Connection acknowledgement sent by the server on a new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectedEvent {
    /// Server-assigned connection id.
    pub connection_id: String,
    /// Authenticated user.
    #[serde(default)]
    pub me: OwnUser,
    /// Event time.
    #[serde(default)]
    pub created_at: u64,
}

/// Why the socket is (or is becoming) disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectCause {
    /// The device has no network.
    NetworkNotAvailable,
    /// The connection was released on purpose.
    ConnectionReleased,
    /// Transient failure; recovery is attempted.
    Error(Option<ChatError>),
    /// Failure that stops all recovery.
    UnrecoverableError(Option<ChatError>),
    /// The socket stopped delivering events.
    WebSocketNotAvailable,
}

impl DisconnectCause {
    /// Whether the health monitor should try to reconnect after this cause.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Error(_) | Self::WebSocketNotAvailable)
    }
}

/// Decoded event delivered over the realtime connection.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "health.check")]
    HealthCheck {
        #[serde(default)]
        connection_id: String,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "connection.ok")]
    Connected(ConnectedEvent),
    #[serde(rename = "message.new")]
    NewMessage {
        cid: String,
        message: Message,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew {
        cid: String,
        message: Message,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated {
        cid: String,
        message: Message,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        cid: String,
        message: Message,
        #[serde(default)]
        hard_delete: bool,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "reaction.new")]
    ReactionNew {
        cid: String,
        message: Message,
        reaction: Reaction,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "reaction.updated")]
    ReactionUpdated {
        cid: String,
        message: Message,
        reaction: Reaction,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted {
        cid: String,
        message: Message,
        reaction: Reaction,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "member.added")]
    MemberAdded {
        cid: String,
        member: Member,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "member.updated")]
    MemberUpdated {
        cid: String,
        member: Member,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "member.removed")]
    MemberRemoved {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.added_to_channel")]
    NotificationAddedToChannel {
        cid: String,
        channel: Channel,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.removed_from_channel")]
    NotificationRemovedFromChannel {
        cid: String,
        member: Member,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.invite_accepted")]
    NotificationInviteAccepted {
        cid: String,
        member: Member,
        channel: ChannelData,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.invite_rejected")]
    NotificationInviteRejected {
        cid: String,
        member: Member,
        channel: ChannelData,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.invited")]
    NotificationInvited {
        cid: String,
        member: Member,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.presence.changed")]
    UserPresenceChanged {
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.updated")]
    UserUpdated {
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.watching.start")]
    UserStartWatching {
        cid: String,
        user: User,
        #[serde(default)]
        watcher_count: u32,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.watching.stop")]
    UserStopWatching {
        cid: String,
        user: User,
        #[serde(default)]
        watcher_count: u32,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "channel.updated")]
    ChannelUpdated {
        cid: String,
        channel: ChannelData,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "channel.hidden")]
    ChannelHidden {
        cid: String,
        #[serde(default)]
        clear_history: bool,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "channel.visible")]
    ChannelVisible {
        cid: String,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "channel.deleted")]
    ChannelDeleted {
        cid: String,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "channel.truncated")]
    ChannelTruncated {
        cid: String,
        #[serde(default)]
        message: Option<Message>,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.channel_truncated")]
    NotificationChannelTruncated {
        cid: String,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.channel_deleted")]
    NotificationChannelDeleted {
        cid: String,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "typing.start")]
    TypingStart {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "typing.stop")]
    TypingStop {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "message.read")]
    MessageRead {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.mark_read")]
    NotificationMarkRead {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.mark_all_read")]
    MarkAllRead {
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "notification.channel_mutes_updated")]
    NotificationChannelMutesUpdated {
        me: OwnUser,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.banned")]
    ChannelUserBanned {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.unbanned")]
    ChannelUserUnbanned {
        cid: String,
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    #[serde(rename = "user.deleted")]
    UserDeleted {
        user: User,
        #[serde(default)]
        created_at: u64,
    },
    /// Any event type this client does not model.
    #[serde(other)]
    Unknown,
}

impl ChatEvent {
    /// Channel cid targeted by this event, when the event is channel scoped.
    pub fn cid(&self) -> Option<&str> {
        use ChatEvent::*;

        match self {
            NewMessage { cid, .. }
            | NotificationMessageNew { cid, .. }
            | MessageUpdated { cid, .. }
            | MessageDeleted { cid, .. }
            | ReactionNew { cid, .. }
            | ReactionUpdated { cid, .. }
            | ReactionDeleted { cid, .. }
            | MemberAdded { cid, .. }
            | MemberUpdated { cid, .. }
            | MemberRemoved { cid, .. }
            | NotificationAddedToChannel { cid, .. }
            | NotificationRemovedFromChannel { cid, .. }
            | NotificationInviteAccepted { cid, .. }
            | NotificationInviteRejected { cid, .. }
            | NotificationInvited { cid, .. }
            | UserStartWatching { cid, .. }
            | UserStopWatching { cid, .. }
            | ChannelUpdated { cid, .. }
            | ChannelHidden { cid, .. }
            | ChannelVisible { cid, .. }
            | ChannelDeleted { cid, .. }
            | ChannelTruncated { cid, .. }
            | NotificationChannelTruncated { cid, .. }
            | NotificationChannelDeleted { cid, .. }
            | TypingStart { cid, .. }
            | TypingStop { cid, .. }
            | MessageRead { cid, .. }
            | NotificationMarkRead { cid, .. }
            | ChannelUserBanned { cid, .. }
            | ChannelUserUnbanned { cid, .. } => Some(cid.as_str()),
            HealthCheck { .. }
            | Connected(_)
            | UserPresenceChanged { .. }
            | UserUpdated { .. }
            | MarkAllRead { .. }
            | NotificationChannelMutesUpdated { .. }
            | UserDeleted { .. }
            | Unknown => None,
        }
    }

    /// Short event type name for logging.
    pub fn type_name(&self) -> &'static str {
        use ChatEvent::*;

        match self {
            HealthCheck { .. } => "health.check",
            Connected(_) => "connection.ok",
            NewMessage { .. } => "message.new",
            NotificationMessageNew { .. } => "notification.message_new",
            MessageUpdated { .. } => "message.updated",
            MessageDeleted { .. } => "message.deleted",
            ReactionNew { .. } => "reaction.new",
            ReactionUpdated { .. } => "reaction.updated",
            ReactionDeleted { .. } => "reaction.deleted",
            MemberAdded { .. } => "member.added",
            MemberUpdated { .. } => "member.updated",
            MemberRemoved { .. } => "member.removed",
            NotificationAddedToChannel { .. } => "notification.added_to_channel",
            NotificationRemovedFromChannel { .. } => "notification.removed_from_channel",
            NotificationInviteAccepted { .. } => "notification.invite_accepted",
            NotificationInviteRejected { .. } => "notification.invite_rejected",
            NotificationInvited { .. } => "notification.invited",
            UserPresenceChanged { .. } => "user.presence.changed",
            UserUpdated { .. } => "user.updated",
            UserStartWatching { .. } => "user.watching.start",
            UserStopWatching { .. } => "user.watching.stop",
            ChannelUpdated { .. } => "channel.updated",
            ChannelHidden { .. } => "channel.hidden",
            ChannelVisible { .. } => "channel.visible",
            ChannelDeleted { .. } => "channel.deleted",
            ChannelTruncated { .. } => "channel.truncated",
            NotificationChannelTruncated { .. } => "notification.channel_truncated",
            NotificationChannelDeleted { .. } => "notification.channel_deleted",
            TypingStart { .. } => "typing.start",
            TypingStop { .. } => "typing.stop",
            MessageRead { .. } => "message.read",
            NotificationMarkRead { .. } => "notification.mark_read",
            MarkAllRead { .. } => "notification.mark_all_read",
            NotificationChannelMutesUpdated { .. } => "notification.channel_mutes_updated",
            ChannelUserBanned { .. } => "user.banned",
            ChannelUserUnbanned { .. } => "user.unbanned",
            UserDeleted { .. } => "user.deleted",
            Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sync_status: SyncStatus) -> Message {
        Message {
            id: "m1".into(),
            sync_status,
            ..Message::default()
        }
    }

    #[test]
    fn ordering_key_uses_server_times_for_completed_messages() {
        let msg = Message {
            created_at: Some(10),
            updated_at: Some(30),
            created_locally_at: Some(99),
            ..message(SyncStatus::Completed)
        };
        assert_eq!(msg.ordering_key(), 30);
    }

    #[test]
    fn ordering_key_uses_local_times_for_pending_messages() {
        let msg = Message {
            created_at: Some(100),
            created_locally_at: Some(40),
            updated_locally_at: Some(50),
            ..message(SyncStatus::SyncNeeded)
        };
        assert_eq!(msg.ordering_key(), 50);
    }

    #[test]
    fn deleted_at_participates_in_both_keys() {
        let msg = Message {
            created_at: Some(1),
            created_locally_at: Some(1),
            deleted_at: Some(70),
            ..message(SyncStatus::Completed)
        };
        assert_eq!(msg.last_update_time(), 70);
        assert_eq!(msg.last_local_update_time(), 70);
    }

    #[test]
    fn recoverable_causes_are_error_and_socket_loss() {
        assert!(DisconnectCause::Error(None).is_recoverable());
        assert!(DisconnectCause::WebSocketNotAvailable.is_recoverable());
        assert!(!DisconnectCause::ConnectionReleased.is_recoverable());
        assert!(!DisconnectCause::NetworkNotAvailable.is_recoverable());
        assert!(!DisconnectCause::UnrecoverableError(None).is_recoverable());
    }

    #[test]
    fn decodes_tagged_events_and_unknown_types() {
        let raw = r#"{"type":"typing.start","cid":"messaging:general","user":{"id":"bob"}}"#;
        let event: ChatEvent = serde_json::from_str(raw).expect("event should decode");
        assert_eq!(event.cid(), Some("messaging:general"));
        assert_eq!(event.type_name(), "typing.start");

        let unknown: ChatEvent =
            serde_json::from_str(r#"{"type":"call.ring"}"#).expect("unknown should decode");
        assert_eq!(unknown, ChatEvent::Unknown);
        assert_eq!(unknown.cid(), None);
    }

    #[test]
    fn builds_cid_from_type_and_id() {
        assert_eq!(cid_of("messaging", "general"), "messaging:general");
    }
}
