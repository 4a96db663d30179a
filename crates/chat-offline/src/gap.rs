use std::collections::HashSet;

use chat_core::Message;
use tracing::debug;

/// Boundaries of an open gap in the cached message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagesGapInfo {
    /// Ids known to lie above (newer than) the gap divisor.
    pub above_gap_ids: Vec<String>,
    /// Ids known to lie below (older than) the gap divisor, in load order.
    pub below_gap_ids: Vec<String>,
    /// Messages behind `below_gap_ids`, same order.
    pub below_gap_messages: Vec<Message>,
}

/// Tracks discontinuities between separately paginated message windows.
///
/// Message ids are the boundary keys. Until a gap opens every older page is
/// recorded below the (future) divisor. A newer page that neither reaches
/// the live edge nor overlaps a known id opens a gap; its first message
/// becomes the divisor. The gap closes once a page reaches the end of the
/// history in its direction or overlaps the boundary on the other side.
#[derive(Debug, Clone, Default)]
pub struct GapLogic {
    has_gap: bool,
    divisor: Option<Message>,
    above_ids: Vec<String>,
    below_ids: Vec<String>,
    below_messages: Vec<Message>,
}

impl GapLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_gap(&self) -> bool {
        self.has_gap
    }

    /// Gap boundaries, present only while a gap is open.
    pub fn gap_info(&self) -> Option<MessagesGapInfo> {
        self.has_gap.then(|| MessagesGapInfo {
            above_gap_ids: self.above_ids.clone(),
            below_gap_ids: self.below_ids.clone(),
            below_gap_messages: self.below_messages.clone(),
        })
    }

    /// Apply a page of newer messages.
    pub fn handle_newer_messages_limit(
        &mut self,
        more_messages_available: bool,
        new_messages: &[Message],
        can_create_gap: bool,
    ) {
        if self.has_gap {
            if !more_messages_available || overlaps(new_messages, &self.above_ids) {
                debug!("gap closed by newer messages");
                self.close();
            } else {
                debug!("gap stays open while loading newer messages");
                self.add_newer(new_messages);
            }
            return;
        }

        let known = overlaps(new_messages, &self.below_ids) || overlaps(new_messages, &self.above_ids);
        let Some(divisor) = new_messages.first() else {
            return;
        };
        if more_messages_available && can_create_gap && !known {
            debug!(divisor = %divisor.id, "gap opened by newer messages");
            self.has_gap = true;
            self.divisor = Some(divisor.clone());
            self.above_ids.push(divisor.id.clone());
            self.add_newer(new_messages);
        }
    }

    /// Apply a page of older messages.
    pub fn handle_older_messages_limit(
        &mut self,
        more_messages_available: bool,
        new_messages: &[Message],
    ) {
        if !self.has_gap {
            self.record_below(new_messages.iter());
            return;
        }
        if !more_messages_available || overlaps(new_messages, &self.below_ids) {
            debug!("gap closed by older messages");
            self.close();
            return;
        }

        let Some(divisor_time) = self.divisor.as_ref().and_then(Message::created_time) else {
            return;
        };
        let below: Vec<&Message> = new_messages
            .iter()
            .filter(|message| message.created_time().is_some_and(|time| time < divisor_time))
            .collect();
        debug!(count = below.len(), "older messages recorded below gap");
        self.record_below(below.into_iter());
    }

    fn add_newer(&mut self, new_messages: &[Message]) {
        let Some(divisor) = self.divisor.as_ref() else {
            return;
        };
        let Some(divisor_time) = divisor.created_time() else {
            return;
        };
        let divisor_id = divisor.id.clone();
        for message in new_messages {
            if message.id == divisor_id || self.above_ids.contains(&message.id) {
                continue;
            }
            match message.created_time() {
                Some(time) if time > divisor_time => self.above_ids.push(message.id.clone()),
                Some(time) if time < divisor_time => {
                    self.below_ids.push(message.id.clone());
                    self.below_messages.push(message.clone());
                }
                _ => {}
            }
        }
    }

    fn record_below<'a>(&mut self, messages: impl Iterator<Item = &'a Message>) {
        for message in messages {
            if !self.below_ids.contains(&message.id) {
                self.below_ids.push(message.id.clone());
                self.below_messages.push(message.clone());
            }
        }
    }

    fn close(&mut self) {
        self.has_gap = false;
        self.divisor = None;
        self.above_ids.clear();
        self.below_ids.clear();
        self.below_messages.clear();
    }
}

fn overlaps(messages: &[Message], ids: &[String]) -> bool {
    if ids.is_empty() {
        return false;
    }
    let known: HashSet<&str> = ids.iter().map(String::as_str).collect();
    messages.iter().any(|message| known.contains(message.id.as_str()))
}
