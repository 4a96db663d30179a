use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chat_core::{ChatEvent, ConnectedEvent, SocketListener, cid_of};
use chat_platform::LocalStore;
use tracing::{debug, info, warn};

use crate::{
    context::ChatContext,
    logic::{ChannelLogic, ChannelLogicConfig},
    query::ChannelQueryClient,
};

/// Owns the `ChannelLogic` of every active channel and routes socket events to them.
pub struct ChannelRegistry {
    context: Arc<ChatContext>,
    config: ChannelLogicConfig,
    store: Arc<dyn LocalStore>,
    client: Arc<dyn ChannelQueryClient>,
    channels: Mutex<HashMap<String, Arc<ChannelLogic>>>,
}

impl ChannelRegistry {
    pub fn new(
        config: ChannelLogicConfig,
        store: Arc<dyn LocalStore>,
        client: Arc<dyn ChannelQueryClient>,
    ) -> Self {
        Self {
            context: Arc::new(ChatContext::new()),
            config,
            store,
            client,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelLogic>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Arc<ChatContext> {
        &self.context
    }

    /// Logic for `channel_type:channel_id`, created on first use.
    pub fn channel(&self, channel_type: &str, channel_id: &str) -> Arc<ChannelLogic> {
        let cid = cid_of(channel_type, channel_id);
        let mut channels = self.channels();
        Arc::clone(channels.entry(cid).or_insert_with(|| {
            debug!(channel_type, channel_id, "channel logic created");
            Arc::new(ChannelLogic::new(
                channel_type,
                channel_id,
                self.config.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.client),
                Arc::clone(&self.context),
            ))
        }))
    }

    pub fn get(&self, cid: &str) -> Option<Arc<ChannelLogic>> {
        self.channels().get(cid).cloned()
    }

    pub fn remove(&self, cid: &str) -> Option<Arc<ChannelLogic>> {
        self.channels().remove(cid)
    }

    pub fn len(&self) -> usize {
        self.channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels().is_empty()
    }

    /// Drop channels nobody outside the registry holds. Returns how many were dropped.
    pub fn release_unobserved(&self) -> usize {
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|_, logic| Arc::strong_count(logic) > 1);
        let released = before - channels.len();
        if released > 0 {
            debug!(released, "unobserved channels released");
        }
        released
    }

    fn all(&self) -> Vec<Arc<ChannelLogic>> {
        self.channels().values().cloned().collect()
    }

    fn delete_offline_channel(&self, cid: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let cid = cid.to_owned();
        runtime.spawn(async move {
            if let Err(error) = store.delete_channel(&cid).await {
                warn!(%cid, %error, "failed to delete offline channel");
            }
        });
    }
}

impl SocketListener for ChannelRegistry {
    fn on_connected(&self, event: &ConnectedEvent) {
        info!(user_id = %event.me.id, "current user updated from connection");
        self.context.set_own_user(&event.me);
    }

    fn on_event(&self, event: &ChatEvent) {
        match event {
            ChatEvent::NotificationChannelMutesUpdated { me, .. } => {
                self.context.set_own_user(me);
                for logic in self.all() {
                    logic.handle_event(event);
                }
            }
            ChatEvent::UserPresenceChanged { .. }
            | ChatEvent::UserUpdated { .. }
            | ChatEvent::MarkAllRead { .. } => {
                for logic in self.all() {
                    logic.handle_event(event);
                }
            }
            ChatEvent::NotificationChannelDeleted { cid, .. } => {
                if self.remove(cid).is_some() {
                    info!(%cid, "channel removed after deletion");
                }
                self.delete_offline_channel(cid);
            }
            _ => {
                let Some(cid) = event.cid() else {
                    return;
                };
                match self.get(cid) {
                    Some(logic) => logic.handle_event(event),
                    None => debug!(%cid, event = event.type_name(), "event for untracked channel"),
                }
            }
        }
    }
}
