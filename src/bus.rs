use crate::chat::{ChatMessage, Reactions};
use crate::entity::{ConversationKey, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Server-to-client chat lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChatEvent {
    /// The message was persisted
    #[serde(rename_all = "camelCase")]
    MessageSent { id: i64, is_sent: bool },

    /// Full record of a freshly stored message
    NewMessage(ChatMessage),

    #[serde(rename_all = "camelCase")]
    MessageRead { id: i64, is_read: bool },

    #[serde(rename_all = "camelCase")]
    ReactionUpdated { message_id: i64, reactions: Reactions },

    #[serde(rename_all = "camelCase")]
    UnreadCount { user_id: UserId, count: i64 },
}

/// Who an event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Conversation(ConversationKey),
    User(UserId),
}

impl Topic {
    pub fn reaches(&self, user: UserId) -> bool {
        match self {
            Topic::Conversation(key) => key.involves(user),
            Topic::User(target) => *target == user,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    pub event: ChatEvent,
}

pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, topic: Topic, event: ChatEvent) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(Envelope { topic, event });
    }
}

#[cfg(test)]
impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
