//! Core contract of the realtime chat connection layer.
//!
//! This crate defines domain types, the error taxonomy, the connection state
//! machine, backoff policies, listener fan-out and the socket frame codec.

/// Socket text frame decoding and encoding.
pub mod codec;
/// Stable error codes and socket error classification.
pub mod error;
/// Listener registry and ordered delivery task.
pub mod listener;
/// Reconnect and parse-retry backoff policies.
pub mod retry;
/// Connection state machine.
pub mod state_machine;
/// Chat domain types (messages, channels, events).
pub mod types;

pub use codec::{DecodedFrame, decode_frame, encode_event};
pub use error::{
    ChatError, ChatErrorCategory, ChatErrorCode, ChatErrorKind, SocketErrorAction,
    classify_socket_error,
};
pub use listener::{ListenerCall, ListenerDispatcher, ListenerError, ListenerRegistry, SocketListener};
pub use retry::{ParseRetryPolicy, ReconnectBackoff};
pub use state_machine::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, ShutdownReason, SideEffect,
    StopReason, Transition,
};
pub use types::{
    Channel, ChannelData, ChannelMute, ChannelUserRead, ChatEvent, ConnectedEvent,
    DisconnectCause, Member, Message, OwnUser, Reaction, SyncStatus, User, cid_of,
};
