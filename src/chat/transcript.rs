use std::collections::HashSet;

use super::{DeliveryState, Message};

/// What happened to a live message handed to [`Transcript::apply_live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Appended,
    /// The echo carried the temp id of a pending send and confirmed it in place.
    Confirmed,
    Duplicate,
}

/// Ordered messages of one open conversation.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn find_by_temp_id(&self, temp_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.temp_id.as_deref() == Some(temp_id))
    }

    /// Install fetched history at the head of the transcript. Entries that
    /// arrived before the history did and are not part of it stay, in order,
    /// after it.
    pub fn merge_history(&mut self, history: Vec<Message>) {
        let ids: HashSet<&str> = history.iter().map(|m| m.id.as_str()).collect();
        let temp_ids: HashSet<&str> = history.iter().filter_map(|m| m.temp_id.as_deref()).collect();

        let carried: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| {
                !ids.contains(m.id.as_str())
                    && !m.temp_id.as_deref().is_some_and(|t| temp_ids.contains(t))
            })
            .collect();

        self.messages = history;
        self.messages.extend(carried);
    }

    /// Swap the entry created for `temp_id` with its durable copy. Returns
    /// false when no such entry exists (conversation closed or reset).
    ///
    /// If the durable id is already present, the live echo landed first
    /// without a temp id; the optimistic entry is dropped in its favour.
    pub fn reconcile(&mut self, temp_id: &str, mut durable: Message) -> bool {
        let Some(slot) = self
            .messages
            .iter()
            .position(|m| m.temp_id.as_deref() == Some(temp_id))
        else {
            return false;
        };

        let echoed = self
            .messages
            .iter()
            .enumerate()
            .any(|(i, m)| i != slot && m.id == durable.id);
        if echoed {
            self.messages.remove(slot);
            if let Some(existing) = self.messages.iter_mut().find(|m| m.id == durable.id) {
                existing.temp_id.get_or_insert_with(|| temp_id.to_string());
                existing.delivery_state = DeliveryState::Confirmed;
            }
            return true;
        }

        durable.temp_id = Some(temp_id.to_string());
        durable.delivery_state = DeliveryState::Confirmed;
        self.messages[slot] = durable;
        true
    }

    pub fn apply_live(&mut self, message: Message) -> LiveOutcome {
        if let Some(temp_id) = message.temp_id.clone() {
            if let Some(existing) = self.find_by_temp_id(&temp_id) {
                if !existing.is_pending() {
                    return LiveOutcome::Duplicate;
                }
                self.reconcile(&temp_id, message);
                return LiveOutcome::Confirmed;
            }
        }

        if self.messages.iter().any(|m| m.id == message.id) {
            return LiveOutcome::Duplicate;
        }

        self.messages.push(message);
        LiveOutcome::Appended
    }

    /// Flip a still-pending send to failed. Confirmed entries are left alone.
    pub fn mark_failed(&mut self, temp_id: &str) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.temp_id.as_deref() == Some(temp_id))
        {
            Some(entry) if entry.is_pending() => {
                entry.delivery_state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }
}
