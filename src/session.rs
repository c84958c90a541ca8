use crate::entity::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Tracks which chat partner each online user currently has open.
///
/// One entry per user; a later `join` overwrites the earlier one. State is
/// process-local and is lost on restart.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<RwLock<HashMap<UserId, UserId>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, user: UserId, partner: UserId) {
        let previous = self.active.write().await.insert(user, partner);
        debug!("{} joined chat with {} (previous: {:?})", user, partner, previous);
    }

    pub async fn leave(&self, user: UserId) {
        if let Some(partner) = self.active.write().await.remove(&user) {
            debug!("{} left chat with {}", user, partner);
        }
    }

    /// Transport-level disconnect. Same effect as `leave`.
    pub async fn disconnect(&self, user: UserId) {
        self.leave(user).await;
    }

    pub async fn active_partner_of(&self, user: UserId) -> Option<UserId> {
        self.active.read().await.get(&user).copied()
    }

    pub async fn online_count(&self) -> usize {
        self.active.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_overwrites_and_leave_clears() {
        let sessions = SessionRegistry::new();
        assert_eq!(sessions.active_partner_of(UserId(1)).await, None);

        sessions.join(UserId(1), UserId(2)).await;
        sessions.join(UserId(1), UserId(2)).await;
        assert_eq!(sessions.active_partner_of(UserId(1)).await, Some(UserId(2)));

        sessions.join(UserId(1), UserId(7)).await;
        assert_eq!(sessions.active_partner_of(UserId(1)).await, Some(UserId(7)));
        assert_eq!(sessions.online_count().await, 1);

        sessions.leave(UserId(1)).await;
        assert_eq!(sessions.active_partner_of(UserId(1)).await, None);

        // leaving twice is a no-op
        sessions.leave(UserId(1)).await;
        assert_eq!(sessions.online_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_behaves_like_leave() {
        let sessions = SessionRegistry::new();
        sessions.join(UserId(4), UserId(5)).await;
        sessions.join(UserId(5), UserId(4)).await;

        sessions.disconnect(UserId(4)).await;
        assert_eq!(sessions.active_partner_of(UserId(4)).await, None);
        assert_eq!(sessions.active_partner_of(UserId(5)).await, Some(UserId(4)));
    }
}
