use parking_lot::Mutex;

pub use engine::{EngineEvent, MessageSyncEngine, SendOutcome};
pub use message::{durable_id, normalize, normalize_durable, DeliveryState, Message};
pub use transcript::{LiveOutcome, Transcript};

mod engine;
mod message;
mod transcript;

/// State of one open peer conversation. Dropped together with its
/// transcript when the view closes.
#[derive(Debug)]
pub struct Conversation {
    pub peer: String,
    state: Mutex<ConversationState>,
}

#[derive(Debug, Default)]
struct ConversationState {
    transcript: Transcript,
    sending: bool,
}

impl Conversation {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            state: Mutex::new(ConversationState::default()),
        }
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.state.lock().transcript.messages().to_vec()
    }

    pub fn is_sending(&self) -> bool {
        self.state.lock().sending
    }

    /// Accept a live message that already passed the peer filter.
    pub fn apply_live(&self, message: Message) -> LiveOutcome {
        self.state.lock().transcript.apply_live(message)
    }

    pub fn merge_history(&self, history: Vec<Message>) {
        self.state.lock().transcript.merge_history(history);
    }

    pub fn mark_failed(&self, temp_id: &str) -> bool {
        self.state.lock().transcript.mark_failed(temp_id)
    }

    /// Claim the single in-flight slot and append the optimistic entry.
    /// Returns false if another send is still in flight.
    fn begin_send(&self, draft: Message) -> bool {
        let mut state = self.state.lock();
        if state.sending {
            return false;
        }
        state.sending = true;
        state.transcript.push(draft);
        true
    }

    fn finish_send(&self) {
        self.state.lock().sending = false;
    }

    /// Replace the optimistic entry for `temp_id` with the durable record
    /// returned by the primary channel.
    fn confirm(&self, temp_id: &str, response: &serde_json::Value) -> Option<String> {
        let mut state = self.state.lock();
        let draft = state.transcript.find_by_temp_id(temp_id)?.clone();
        let durable = normalize_durable(response, &draft);
        let id = durable.id.clone();
        state.transcript.reconcile(temp_id, durable).then_some(id)
    }
}
