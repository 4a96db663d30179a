use tracing::debug;

use crate::query::QueryChannelRequest;

/// Tracks whether the visible window is a search excerpt rather than the live tail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchLogic {
    inside_search: bool,
}

impl SearchLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inside_search(&self) -> bool {
        self.inside_search
    }

    /// Update the search flag after a query completed.
    pub fn handle_message_bounds(&mut self, request: &QueryChannelRequest, no_more_messages: bool) {
        if !self.inside_search && request.is_filtering_around_id() {
            debug!("entering search window");
            self.inside_search = true;
        } else if self.inside_search && request.is_filtering_newer_messages() && no_more_messages {
            debug!("search window reached the newest messages");
            self.inside_search = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MessageFilter;

    fn request(filter: Option<MessageFilter>) -> QueryChannelRequest {
        QueryChannelRequest {
            filter,
            ..QueryChannelRequest::new(30)
        }
    }

    #[test]
    fn around_id_enters_and_exhausted_newer_page_leaves_search() {
        let mut search = SearchLogic::new();
        search.handle_message_bounds(&request(Some(MessageFilter::AroundId("m5".into()))), false);
        assert!(search.is_inside_search());

        search.handle_message_bounds(&request(Some(MessageFilter::GreaterThan("m9".into()))), false);
        assert!(search.is_inside_search());

        search.handle_message_bounds(&request(Some(MessageFilter::LessThan("m1".into()))), true);
        assert!(search.is_inside_search());

        search.handle_message_bounds(&request(Some(MessageFilter::GreaterThan("m20".into()))), true);
        assert!(!search.is_inside_search());
    }

    #[test]
    fn plain_watch_never_enters_search() {
        let mut search = SearchLogic::new();
        search.handle_message_bounds(&request(None), true);
        assert!(!search.is_inside_search());
    }
}
