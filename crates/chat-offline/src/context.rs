use std::{
    collections::HashSet,
    sync::{PoisonError, RwLock},
};

use chat_core::{OwnUser, User};

#[derive(Debug, Default)]
struct ContextState {
    user: Option<User>,
    muted_channels: HashSet<String>,
}

/// Session-wide facts shared by every channel: the current user and their channel mutes.
#[derive(Debug, Default)]
pub struct ChatContext {
    state: RwLock<ContextState>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current user and mute list from the server's view of `me`.
    pub fn set_own_user(&self, me: &OwnUser) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.user = Some(me.as_user());
        state.muted_channels = me.channel_mutes.iter().map(|mute| mute.cid.clone()).collect();
    }

    pub fn current_user(&self) -> Option<User> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .clone()
    }

    pub fn is_channel_muted(&self, cid: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .muted_channels
            .contains(cid)
    }

    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ContextState::default();
    }
}

#[cfg(test)]
mod tests {
    use chat_core::ChannelMute;

    use super::*;

    #[test]
    fn tracks_user_and_mutes() {
        let context = ChatContext::new();
        assert!(context.current_user().is_none());

        context.set_own_user(&OwnUser {
            id: "alice".into(),
            channel_mutes: vec![ChannelMute {
                cid: "messaging:noisy".into(),
            }],
            ..OwnUser::default()
        });
        assert_eq!(context.current_user().map(|u| u.id), Some("alice".to_owned()));
        assert!(context.is_channel_muted("messaging:noisy"));
        assert!(!context.is_channel_muted("messaging:general"));

        context.clear();
        assert!(context.current_user().is_none());
        assert!(!context.is_channel_muted("messaging:noisy"));
    }
}
