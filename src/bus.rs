use crate::chat::{ChatMessage, ChatSession};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatEvent {
    /// A customer opened a chat
    SessionCreated(ChatSession),

    /// A message was accepted into a chat
    MessagePosted(ChatMessage),

    /// An admin claimed a chat (explicitly or by replying first)
    SessionAssigned { chat_id: String, admin_id: String },

    /// A chat reached its terminal state
    SessionClosed {
        chat_id: String,
        closed_by: String,
        /// Closed before any admin picked it up
        was_unassigned: bool,
    },

    SessionDeleted { chat_id: String, deleted_by: String },
}

pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChatEvent) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
