use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bus::{ChatEvent, EventBus, Topic};
use crate::chat::{ChatMessage, NewMessage, Reactions};
use crate::entity::{ConversationKey, UserId};
use crate::error::{ChatError, ChatResult};
use crate::session::SessionRegistry;
use crate::store::{ReactionToggle, Store};

/// Chat core: applies client intents to the store and session registry and
/// publishes the resulting lifecycle events.
pub struct ChatManager {
    store: Store,
    sessions: SessionRegistry,
    event_bus: Arc<EventBus>,
}

impl ChatManager {
    pub fn new(store: Store, sessions: SessionRegistry, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            sessions,
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    #[cfg(test)]
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn join_chat(&self, user: UserId, partner: UserId) {
        self.sessions.join(user, partner).await;
        info!(
            "{} opened chat with {} ({} active sessions)",
            user,
            partner,
            self.sessions.online_count().await
        );
    }

    pub async fn leave_chat(&self, user: UserId) {
        self.sessions.leave(user).await;
    }

    pub async fn disconnect(&self, user: UserId) {
        info!("{} disconnected", user);
        self.sessions.disconnect(user).await;
    }

    #[cfg(test)]
    pub async fn active_partner_of(&self, user: UserId) -> Option<UserId> {
        self.sessions.active_partner_of(user).await
    }

    /// Persist and deliver a message.
    ///
    /// If the receiver currently has this conversation open the row is written
    /// already read, so the receiver's unread count never includes it.
    pub async fn send_message(
        &self,
        sender: UserId,
        receiver: UserId,
        text: &str,
    ) -> ChatResult<ChatMessage> {
        if text.is_empty() {
            warn!("Dropping empty message from {} to {}", sender, receiver);
            return Err(ChatError::Validation("text must not be empty".into()));
        }

        let auto_read = self.sessions.active_partner_of(receiver).await == Some(sender);

        let draft = NewMessage {
            sender_id: sender,
            receiver_id: receiver,
            text: text.to_string(),
            is_read: auto_read,
            created_at: Utc::now(),
        };

        let message = self.store.insert_message(&draft).await.map_err(|e| {
            error!("Failed to persist message from {} to {}: {:#}", sender, receiver, e);
            ChatError::Store(e)
        })?;

        let topic = Topic::Conversation(message.conversation());
        self.event_bus.publish(
            topic,
            ChatEvent::MessageSent {
                id: message.id,
                is_sent: true,
            },
        );
        self.event_bus
            .publish(topic, ChatEvent::NewMessage(message.clone()));
        debug!("Message {} delivered to {}", message.id, message.conversation());

        if auto_read {
            self.event_bus.publish(
                topic,
                ChatEvent::MessageRead {
                    id: message.id,
                    is_read: true,
                },
            );
        }

        self.publish_unread_count(receiver).await?;

        Ok(message)
    }

    /// Explicit read receipt for a single message.
    pub async fn read_message(&self, message_id: i64) -> ChatResult<ChatMessage> {
        let Some(mut message) = self.store.get_message(message_id).await? else {
            warn!("Read receipt for unknown message {}", message_id);
            return Err(ChatError::MessageNotFound(message_id));
        };

        self.store.mark_read(message_id).await?;
        message.is_read = true;

        self.event_bus.publish(
            Topic::Conversation(message.conversation()),
            ChatEvent::MessageRead {
                id: message_id,
                is_read: true,
            },
        );
        self.publish_unread_count(message.receiver_id).await?;

        Ok(message)
    }

    /// Mark the backlog `partner -> user` as read, one receipt per message.
    pub async fn check_messages(&self, user: UserId, partner: UserId) -> ChatResult<Vec<i64>> {
        let flipped = self.store.mark_read_from(user, partner).await?;
        let topic = Topic::Conversation(ConversationKey::new(user, partner));

        for id in &flipped {
            self.event_bus.publish(
                topic,
                ChatEvent::MessageRead {
                    id: *id,
                    is_read: true,
                },
            );
        }

        if !flipped.is_empty() {
            info!("{} caught up on {} messages from {}", user, flipped.len(), partner);
        }
        self.publish_unread_count(user).await?;

        Ok(flipped)
    }

    pub async fn toggle_reaction(
        &self,
        message_id: i64,
        user: UserId,
        reaction: &str,
    ) -> ChatResult<Reactions> {
        if reaction.is_empty() {
            return Err(ChatError::Validation("reaction must not be empty".into()));
        }

        let Some(message) = self.store.get_message(message_id).await? else {
            return Err(ChatError::MessageNotFound(message_id));
        };

        match self.store.toggle_reaction(message_id, user, reaction).await? {
            ReactionToggle::Applied { reactions, change } => {
                info!(
                    "{} reaction {:?} on message {} ({} total)",
                    user,
                    change,
                    message_id,
                    reactions.count()
                );
                self.event_bus.publish(
                    Topic::Conversation(message.conversation()),
                    ChatEvent::ReactionUpdated {
                        message_id,
                        reactions: reactions.clone(),
                    },
                );
                Ok(reactions)
            }
            ReactionToggle::MissingMessage => Err(ChatError::MessageNotFound(message_id)),
        }
    }

    /// Recompute and publish a user's unread count.
    pub async fn unread_count(&self, user: UserId) -> ChatResult<i64> {
        self.publish_unread_count(user).await
    }

    /// Same count as `unread_count`, without publishing it.
    pub async fn peek_unread_count(&self, user: UserId) -> ChatResult<i64> {
        Ok(self.store.count_unread(user).await?)
    }

    pub async fn history(
        &self,
        user: UserId,
        partner: UserId,
        limit: i64,
    ) -> ChatResult<Vec<ChatMessage>> {
        Ok(self.store.history(user, partner, limit).await?)
    }

    async fn publish_unread_count(&self, user: UserId) -> ChatResult<i64> {
        let count = self.store.count_unread(user).await?;
        self.event_bus
            .publish(Topic::User(user), ChatEvent::UnreadCount { user_id: user, count });
        Ok(count)
    }
}
