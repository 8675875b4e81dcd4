//! Client-side copies of server state and the rules for when a fresh fetch
//! replaces them.
//!
//! Every poll returns the full authoritative list. Replacing the local copy on
//! every tick would throw away messages the user just sent (rendered from the
//! send response before any poll saw them) and force needless re-renders, so:
//!
//! * messages are replaced only if the count or the last message id changed;
//! * the session list is replaced only if its serialised form changed.
//!
//! Order is whatever the server returned. Nothing here sorts.

use crate::chat::{ChatMessage, ChatSession};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSnapshot {
    messages: Vec<ChatMessage>,
}

impl MessageSnapshot {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }

    /// Returns true if `fetched` replaced the local copy.
    pub fn reconcile(&mut self, fetched: Vec<ChatMessage>) -> bool {
        let changed = fetched.len() != self.messages.len()
            || fetched.last().map(|m| m.id) != self.last_id();
        if changed {
            self.messages = fetched;
        }
        changed
    }

    /// Show a message from a send response before the next poll confirms it.
    pub fn push_confirmed(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionListSnapshot {
    sessions: Vec<ChatSession>,
    fingerprint: String,
}

impl SessionListSnapshot {
    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn get(&self, chat_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == chat_id)
    }

    /// Returns true if `fetched` replaced the local copy.
    pub fn reconcile(&mut self, fetched: Vec<ChatSession>) -> bool {
        let fingerprint = fingerprint(&fetched);
        if fingerprint == self.fingerprint {
            return false;
        }
        self.sessions = fetched;
        self.fingerprint = fingerprint;
        true
    }

    /// Swap in a session returned by a command (claim, close, create).
    pub fn upsert(&mut self, session: ChatSession) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.insert(0, session),
        }
        self.fingerprint = fingerprint(&self.sessions);
    }

    pub fn remove(&mut self, chat_id: &str) {
        self.sessions.retain(|s| s.id != chat_id);
        self.fingerprint = fingerprint(&self.sessions);
    }
}

fn fingerprint(sessions: &[ChatSession]) -> String {
    // Serialising plain data structs cannot fail; an empty print just forces a refresh.
    serde_json::to_string(sessions).unwrap_or_default()
}
