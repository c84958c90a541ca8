use crate::entity::{ConversationKey, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub is_sent: bool,
    pub is_read: bool,
    #[serde(default)]
    pub reactions: Reactions,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.receiver_id)
    }
}

/// A message that has not been written to the store yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Reactions on a single message, keyed by the reacting user.
/// A user holds at most one reaction per message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<UserId, String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Added,
    Replaced,
    Removed,
}

impl Reactions {
    /// Repeating the reaction a user already holds removes it; anything else overwrites.
    pub fn toggle(&mut self, user: UserId, reaction: &str) -> ReactionChange {
        match self.0.get(&user) {
            Some(current) if current == reaction => {
                self.0.remove(&user);
                ReactionChange::Removed
            }
            Some(_) => {
                self.0.insert(user, reaction.to_string());
                ReactionChange::Replaced
            }
            None => {
                self.0.insert(user, reaction.to_string());
                ReactionChange::Added
            }
        }
    }

    pub fn get(&self, user: UserId) -> Option<&str> {
        self.0.get(&user).map(String::as_str)
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_adds_removes_and_overwrites() {
        let mut reactions = Reactions::default();
        let user = UserId(3);

        assert_eq!(reactions.toggle(user, "👍"), ReactionChange::Added);
        assert_eq!(reactions.get(user), Some("👍"));

        assert_eq!(reactions.toggle(user, "👍"), ReactionChange::Removed);
        assert_eq!(reactions.get(user), None);

        assert_eq!(reactions.toggle(user, "❤️"), ReactionChange::Added);
        assert_eq!(reactions.toggle(user, "😂"), ReactionChange::Replaced);
        assert_eq!(reactions.get(user), Some("😂"));
        assert_eq!(reactions.count(), 1);
    }

    #[test]
    fn double_toggle_restores_prior_state() {
        let mut reactions = Reactions::default();
        reactions.toggle(UserId(1), "🔥");
        reactions.toggle(UserId(2), "💪");
        let before = reactions.clone();

        reactions.toggle(UserId(5), "👍");
        reactions.toggle(UserId(5), "👍");
        assert_eq!(reactions, before);
    }

    #[test]
    fn reactions_serialize_as_user_keyed_map() {
        let mut reactions = Reactions::default();
        reactions.toggle(UserId(3), "👍");
        let json = serde_json::to_string(&reactions).unwrap();
        assert_eq!(json, r#"{"3":"👍"}"#);

        let parsed: Reactions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reactions);
    }
}
