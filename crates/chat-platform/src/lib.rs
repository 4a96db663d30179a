//! Platform collaborators consumed by the chat connection layer.
//!
//! Tokens, network availability, app lifecycle and the offline store are
//! traits here, each with an in-process implementation.

pub mod lifecycle;
pub mod network;
pub mod store;
pub mod token;

pub use lifecycle::{LifecycleHandler, LifecycleObserver, LifecycleSignal, ManualLifecycle};
pub use network::{ManualNetworkState, NetworkStateListener, NetworkStateProvider};
pub use store::{InMemoryLocalStore, LocalStore, StoreError};
pub use token::{
    CachedTokenProvider, StaticTokenLoader, TokenLoader, TokenProvider, dev_token,
    user_id_from_token,
};
