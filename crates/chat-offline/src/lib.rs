//! Per-channel state reconciliation for the realtime chat client.
//!
//! `ChannelLogic` merges offline cache, paginated channel queries and socket
//! events into one consistent view of a channel. `ChannelRegistry` owns the
//! active channels and listens to the socket.

mod context;
mod gap;
mod logic;
mod query;
mod registry;
mod search;
mod state;
mod timeline;

pub use context::ChatContext;
pub use gap::{GapLogic, MessagesGapInfo};
pub use logic::{ChannelLogic, ChannelLogicConfig, DEFAULT_MESSAGE_LIMIT, DEFAULT_READ_TOLERANCE_MS};
pub use query::{ChannelQueryClient, MessageFilter, QueryChannelRequest};
pub use registry::ChannelRegistry;
pub use search::SearchLogic;
pub use state::{ChannelMutableState, ChannelSnapshot, LoadingState};
pub use timeline::MessageTimeline;
