use async_trait::async_trait;
use chat_core::{Channel, ChatError};

/// Message pagination filter relative to a base message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    LessThan(String),
    GreaterThan(String),
    AroundId(String),
}

/// Paginated channel query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryChannelRequest {
    pub messages_limit: usize,
    pub filter: Option<MessageFilter>,
    /// Start watching the channel for events.
    pub watch: bool,
    /// Receive presence events for channel members.
    pub presence: bool,
}

impl QueryChannelRequest {
    pub fn new(messages_limit: usize) -> Self {
        Self {
            messages_limit,
            filter: None,
            watch: true,
            presence: false,
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_presence(mut self, presence: bool) -> Self {
        self.presence = presence;
        self
    }

    pub fn is_filtering_newer_messages(&self) -> bool {
        matches!(self.filter, Some(MessageFilter::GreaterThan(_)))
    }

    pub fn is_filtering_older_messages(&self) -> bool {
        matches!(self.filter, Some(MessageFilter::LessThan(_)))
    }

    pub fn is_filtering_around_id(&self) -> bool {
        matches!(self.filter, Some(MessageFilter::AroundId(_)))
    }

    pub fn base_message_id(&self) -> Option<&str> {
        match &self.filter {
            Some(
                MessageFilter::LessThan(id) | MessageFilter::GreaterThan(id) | MessageFilter::AroundId(id),
            ) => Some(id),
            None => None,
        }
    }
}

/// Online channel query backend.
#[async_trait]
pub trait ChannelQueryClient: Send + Sync {
    async fn query_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
        request: &QueryChannelRequest,
    ) -> Result<Channel, ChatError>;
}
