use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::Envelope;
use crate::entity::UserId;
use crate::error::{ChatError, ChatResult};
use crate::manager::ChatManager;

/// Client-to-server chat intents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinChat {
        user_id: UserId,
        chat_partner_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    LeaveChat { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    CheckMessages {
        user_id: UserId,
        chat_partner_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        sender_id: UserId,
        receiver_id: UserId,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ReadMessage { message_id: i64 },
    #[serde(rename_all = "camelCase")]
    AddReaction {
        message_id: i64,
        user_id: UserId,
        reaction: String,
    },
    #[serde(rename_all = "camelCase")]
    GetUnreadCount { user_id: UserId },
}

impl ClientEvent {
    /// The user acting on this connection, when the event names one.
    fn actor(&self) -> Option<UserId> {
        match self {
            ClientEvent::JoinChat { user_id, .. }
            | ClientEvent::LeaveChat { user_id }
            | ClientEvent::CheckMessages { user_id, .. }
            | ClientEvent::AddReaction { user_id, .. }
            | ClientEvent::GetUnreadCount { user_id } => Some(*user_id),
            ClientEvent::SendMessage { sender_id, .. } => Some(*sender_id),
            ClientEvent::ReadMessage { .. } => None,
        }
    }
}

/// One inbound frame: `{"event": ..., "data": {...}, "requestId": n}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: Option<u64>,
    pub event: ClientEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub request_id: Option<u64>,
    pub reason: String,
}

pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| FrameError {
        request_id: None,
        reason: format!("malformed JSON: {}", e),
    })?;

    let request_id = value
        .as_object_mut()
        .and_then(|obj| obj.remove("requestId"))
        .and_then(|id| id.as_u64());

    let event = serde_json::from_value(value).map_err(|e| FrameError {
        request_id,
        reason: format!("unrecognized event: {}", e),
    })?;

    Ok(Frame { request_id, event })
}

/// Per-action acknowledgement sent back on the originating connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub request_id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Ack {
    fn success(request_id: Option<u64>, result: Value) -> Self {
        Self {
            request_id,
            ok: true,
            code: None,
            error: None,
            result: Some(result),
        }
    }

    fn failure(request_id: Option<u64>, code: &'static str, error: String) -> Self {
        Self {
            request_id,
            ok: false,
            code: Some(code),
            error: Some(error),
            result: None,
        }
    }

    fn from_error(request_id: Option<u64>, err: &ChatError) -> Self {
        let message = match err {
            // store internals stay in the server log
            ChatError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self::failure(request_id, err.code(), message)
    }

    pub fn to_frame(&self) -> String {
        json!({ "event": "ack", "data": self }).to_string()
    }
}

/// Per-connection state: the user this socket speaks for, once known, and the
/// user whose session entry this socket opened with `joinChat`.
pub struct Connection {
    manager: Arc<ChatManager>,
    user: Option<UserId>,
    joined: Option<UserId>,
}

impl Connection {
    pub fn new(manager: Arc<ChatManager>, user: Option<UserId>) -> Self {
        Self {
            manager,
            user,
            joined: None,
        }
    }

    pub fn user(&self) -> Option<UserId> {
        self.user
    }

    /// Wire text for an envelope this connection should see. Unbound
    /// connections see nothing.
    pub fn render(&self, envelope: &Envelope) -> Option<String> {
        let user = self.user?;
        if !envelope.topic.reaches(user) {
            return None;
        }
        match serde_json::to_string(&envelope.event) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to serialize chat event: {}", e);
                None
            }
        }
    }

    /// Handle one text frame and return the ack to send back, if any.
    /// Successful actions are acknowledged only when the client asked for it
    /// with a `requestId`; failures are always reported.
    pub async fn handle_text(&mut self, text: &str) -> Option<Ack> {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejecting frame: {}", e.reason);
                return Some(Ack::failure(e.request_id, "invalid", e.reason));
            }
        };

        debug!("Received {:?}", frame.event);

        match self.dispatch(frame.event).await {
            Ok(result) => frame
                .request_id
                .map(|id| Ack::success(Some(id), result)),
            Err(e) => {
                warn!("Chat action failed: {}", e);
                Some(Ack::from_error(frame.request_id, &e))
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> ChatResult<Value> {
        if let ClientEvent::JoinChat { user_id, .. } = &event {
            self.user = Some(*user_id);
            self.take_over_session(*user_id).await;
        } else if self.user.is_none() {
            self.user = event.actor();
        }

        let manager = &self.manager;
        match event {
            ClientEvent::JoinChat {
                user_id,
                chat_partner_id,
            } => {
                manager.join_chat(user_id, chat_partner_id).await;
                Ok(json!({}))
            }
            ClientEvent::LeaveChat { user_id } => {
                manager.leave_chat(user_id).await;
                if self.joined == Some(user_id) {
                    self.joined = None;
                }
                Ok(json!({}))
            }
            ClientEvent::CheckMessages {
                user_id,
                chat_partner_id,
            } => {
                let read = manager.check_messages(user_id, chat_partner_id).await?;
                Ok(json!({ "read": read }))
            }
            ClientEvent::SendMessage {
                sender_id,
                receiver_id,
                text,
            } => {
                let message = manager.send_message(sender_id, receiver_id, &text).await?;
                Ok(json!({ "id": message.id, "isRead": message.is_read }))
            }
            ClientEvent::ReadMessage { message_id } => {
                manager.read_message(message_id).await?;
                Ok(json!({ "id": message_id }))
            }
            ClientEvent::AddReaction {
                message_id,
                user_id,
                reaction,
            } => {
                let reactions = manager
                    .toggle_reaction(message_id, user_id, &reaction)
                    .await?;
                Ok(json!({ "messageId": message_id, "reactions": reactions }))
            }
            ClientEvent::GetUnreadCount { user_id } => {
                let count = manager.unread_count(user_id).await?;
                Ok(json!({ "userId": user_id, "count": count }))
            }
        }
    }

    /// Joining as a different user hands the socket over; the session entry
    /// the old user opened here goes away with it.
    async fn take_over_session(&mut self, user: UserId) {
        if let Some(previous) = self.joined.replace(user) {
            if previous != user {
                self.manager.disconnect(previous).await;
            }
        }
    }

    /// Only a session opened on this socket is torn down; another socket of the
    /// same user keeps its entry.
    pub async fn close(self) {
        if let Some(user) = self.joined {
            self.manager.disconnect(user).await;
        }
    }
}

pub async fn handle_socket(socket: WebSocket, manager: Arc<ChatManager>, user: Option<UserId>) {
    let connection_id = Uuid::new_v4();
    info!("New chat connection {} (user: {:?})", connection_id, user);

    let mut rx = manager.event_bus().subscribe();
    let mut connection = Connection::new(manager, user);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ack) = connection.handle_text(&text).await {
                            if sink.send(Message::Text(ack.to_frame())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Chat connection {} error: {}", connection_id, e);
                        break;
                    }
                }
            }
            envelope = rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        let Some(text) = connection.render(&envelope) else {
                            continue;
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Chat connection {} lagged, {} events dropped", connection_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("Chat connection {} closed (user: {:?})", connection_id, connection.user());
    connection.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChatEvent, EventBus, Topic};
    use crate::entity::ConversationKey;
    use crate::session::SessionRegistry;
    use crate::store::Store;

    async fn manager() -> Arc<ChatManager> {
        let store = Store::in_memory().await.unwrap();
        Arc::new(ChatManager::new(
            store,
            SessionRegistry::new(),
            Arc::new(EventBus::default()),
        ))
    }

    #[test]
    fn parses_events_with_and_without_request_id() {
        let frame = parse_frame(
            r#"{"event":"sendMessage","data":{"senderId":1,"receiverId":2,"text":"hi"},"requestId":7}"#,
        )
        .unwrap();
        assert_eq!(frame.request_id, Some(7));
        assert_eq!(
            frame.event,
            ClientEvent::SendMessage {
                sender_id: UserId(1),
                receiver_id: UserId(2),
                text: "hi".into(),
            }
        );

        let frame = parse_frame(r#"{"event":"joinChat","data":{"userId":2,"chatPartnerId":1}}"#)
            .unwrap();
        assert_eq!(frame.request_id, None);
        assert_eq!(
            frame.event,
            ClientEvent::JoinChat {
                user_id: UserId(2),
                chat_partner_id: UserId(1),
            }
        );
    }

    #[test]
    fn rejects_missing_fields_and_unknown_events() {
        let err = parse_frame(r#"{"event":"sendMessage","data":{"senderId":1},"requestId":3}"#)
            .unwrap_err();
        assert_eq!(err.request_id, Some(3));

        assert!(parse_frame(r#"{"event":"dance","data":{}}"#).is_err());
        assert!(parse_frame("not json").is_err());
    }

    #[tokio::test]
    async fn join_binds_connection_and_close_clears_session() {
        let manager = manager().await;
        let mut connection = Connection::new(manager.clone(), None);

        let ack = connection
            .handle_text(r#"{"event":"joinChat","data":{"userId":2,"chatPartnerId":1},"requestId":1}"#)
            .await
            .unwrap();
        assert!(ack.ok);
        assert_eq!(connection.user(), Some(UserId(2)));
        assert_eq!(manager.active_partner_of(UserId(2)).await, Some(UserId(1)));

        connection.close().await;
        assert_eq!(manager.active_partner_of(UserId(2)).await, None);
    }

    #[tokio::test]
    async fn closing_an_unjoined_socket_keeps_other_sessions() {
        let manager = manager().await;

        let mut joined_tab = Connection::new(manager.clone(), None);
        joined_tab
            .handle_text(r#"{"event":"joinChat","data":{"userId":2,"chatPartnerId":1}}"#)
            .await;

        let mut other_tab = Connection::new(manager.clone(), Some(UserId(2)));
        other_tab
            .handle_text(r#"{"event":"getUnreadCount","data":{"userId":2}}"#)
            .await;
        other_tab.close().await;

        assert_eq!(manager.active_partner_of(UserId(2)).await, Some(UserId(1)));
        let message = manager.send_message(UserId(1), UserId(2), "hi").await.unwrap();
        assert!(message.is_read);

        joined_tab.close().await;
        assert_eq!(manager.active_partner_of(UserId(2)).await, None);
    }

    #[tokio::test]
    async fn leave_then_close_does_not_disconnect_twice() {
        let manager = manager().await;
        let mut connection = Connection::new(manager.clone(), None);
        connection
            .handle_text(r#"{"event":"joinChat","data":{"userId":2,"chatPartnerId":1}}"#)
            .await;
        connection
            .handle_text(r#"{"event":"leaveChat","data":{"userId":2}}"#)
            .await;
        assert_eq!(manager.active_partner_of(UserId(2)).await, None);

        let mut second = Connection::new(manager.clone(), None);
        second
            .handle_text(r#"{"event":"joinChat","data":{"userId":2,"chatPartnerId":4}}"#)
            .await;

        connection.close().await;
        assert_eq!(manager.active_partner_of(UserId(2)).await, Some(UserId(4)));
    }

    #[tokio::test]
    async fn render_filters_by_bound_user() {
        let manager = manager().await;
        let envelope = Envelope {
            topic: Topic::Conversation(ConversationKey::new(UserId(1), UserId(2))),
            event: ChatEvent::MessageRead { id: 5, is_read: true },
        };

        let unbound = Connection::new(manager.clone(), None);
        assert_eq!(unbound.render(&envelope), None);

        let outsider = Connection::new(manager.clone(), Some(UserId(3)));
        assert_eq!(outsider.render(&envelope), None);

        let participant = Connection::new(manager.clone(), Some(UserId(2)));
        let text = participant.render(&envelope).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"event": "messageRead", "data": {"id": 5, "isRead": true}})
        );

        let direct = Envelope {
            topic: Topic::User(UserId(3)),
            event: ChatEvent::UnreadCount {
                user_id: UserId(3),
                count: 1,
            },
        };
        assert!(outsider.render(&direct).is_some());
        assert_eq!(participant.render(&direct), None);
    }

    #[tokio::test]
    async fn first_identifying_event_binds_the_connection() {
        let manager = manager().await;
        let mut connection = Connection::new(manager, None);
        let envelope = Envelope {
            topic: Topic::User(UserId(7)),
            event: ChatEvent::UnreadCount {
                user_id: UserId(7),
                count: 0,
            },
        };
        assert_eq!(connection.render(&envelope), None);

        connection
            .handle_text(r#"{"event":"getUnreadCount","data":{"userId":7}}"#)
            .await;
        assert_eq!(connection.user(), Some(UserId(7)));
        assert!(connection.render(&envelope).is_some());
    }

    #[tokio::test]
    async fn failures_are_acknowledged_without_request_id() {
        let manager = manager().await;
        let mut connection = Connection::new(manager, Some(UserId(1)));

        let ack = connection
            .handle_text(r#"{"event":"sendMessage","data":{"senderId":1,"receiverId":2,"text":""}}"#)
            .await
            .unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.code, Some("invalid"));

        let ack = connection
            .handle_text(r#"{"event":"readMessage","data":{"messageId":55},"requestId":9}"#)
            .await
            .unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.request_id, Some(9));
        assert_eq!(ack.code, Some("not_found"));

        // successful action without a requestId is not acknowledged
        let ack = connection
            .handle_text(r#"{"event":"sendMessage","data":{"senderId":1,"receiverId":2,"text":"yo"}}"#)
            .await;
        assert!(ack.is_none());
    }

    #[tokio::test]
    async fn send_ack_reports_id_and_publishes() {
        let manager = manager().await;
        let mut rx = manager.event_bus().subscribe();
        let mut connection = Connection::new(manager, None);

        let ack = connection
            .handle_text(
                r#"{"event":"sendMessage","data":{"senderId":1,"receiverId":2,"text":"hi"},"requestId":4}"#,
            )
            .await
            .unwrap();
        assert!(ack.ok);
        assert_eq!(connection.user(), Some(UserId(1)));
        let id = ack.result.unwrap()["id"].as_i64().unwrap();

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.topic, Topic::Conversation(_)));
        assert_eq!(envelope.event, ChatEvent::MessageSent { id, is_sent: true });

        let frame: Value =
            serde_json::from_str(&Ack::success(Some(4), json!({})).to_frame()).unwrap();
        assert_eq!(frame["event"], "ack");
        assert_eq!(frame["data"]["requestId"], 4);
    }
}
