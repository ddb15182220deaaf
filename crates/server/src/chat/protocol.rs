//! Wire protocol
//!
//! Every WebSocket text frame carries one event as
//! `{"event": "<name>", "data": {...}}`. Client events are validated here,
//! before they reach the engine.

use crate::core::error::{Error, Result};
use crate::core::models::{Attachment, Message, MessageKind, UserSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Login {
        username: String,
    },
    SendMessage(SendMessageInput),
    AdminSendMessage {
        admin_username: String,
        sender: String,
        receiver: String,
        message: String,
        #[serde(default)]
        message_type: MessageKind,
    },
    #[serde(rename = "message_read", alias = "mark_read")]
    MarkRead {
        reader: String,
        sender: String,
    },
    Typing {
        sender: String,
        receiver: String,
        is_typing: bool,
    },
    GetConversation(HistoryQuery),
    GetMoreMessages(HistoryQuery),
    DeleteUser {
        admin_username: String,
        target_username: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageInput {
    pub sender: String,
    pub receiver: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub offline_id: Option<String>,
    /// Set when an admin sends on behalf of `sender`
    pub admin_username: Option<String>,
}

impl SendMessageInput {
    pub fn attachment(&self) -> Option<Attachment> {
        self.file_url.as_ref().map(|url| Attachment {
            url: url.clone(),
            name: self.file_name.clone(),
            size: self.file_size.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub user1: String,
    pub user2: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Login { .. } => "login",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::AdminSendMessage { .. } => "admin_send_message",
            ClientEvent::MarkRead { .. } => "message_read",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::GetConversation(_) => "get_conversation",
            ClientEvent::GetMoreMessages(_) => "get_more_messages",
            ClientEvent::DeleteUser { .. } => "delete_user",
        }
    }

    /// Parse a raw text frame and validate it.
    pub fn parse(raw: &str) -> Result<Self> {
        let event: ClientEvent = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("malformed event: {e}")))?;
        event.validated()
    }

    /// Trim identifiers, normalise optional fields and reject blank
    /// required fields.
    pub fn validated(mut self) -> Result<Self> {
        match &mut self {
            ClientEvent::Login { username } => required("username", username)?,
            ClientEvent::SendMessage(input) => {
                required("sender", &mut input.sender)?;
                required("receiver", &mut input.receiver)?;
                input.file_url = non_blank(input.file_url.take());
                input.file_name = non_blank(input.file_name.take());
                input.offline_id = non_blank(input.offline_id.take());
                input.admin_username = non_blank(input.admin_username.take());
                if input.message.trim().is_empty() && input.file_url.is_none() {
                    return Err(Error::validation("message body or file_url required"));
                }
                if input.file_size.is_some_and(|size| size < 0) {
                    return Err(Error::validation("file_size must not be negative"));
                }
            }
            ClientEvent::AdminSendMessage {
                admin_username,
                sender,
                receiver,
                message,
                ..
            } => {
                required("admin_username", admin_username)?;
                required("sender", sender)?;
                required("receiver", receiver)?;
                if message.trim().is_empty() {
                    return Err(Error::validation("message required"));
                }
            }
            ClientEvent::MarkRead { reader, sender } => {
                required("reader", reader)?;
                required("sender", sender)?;
                if reader == sender {
                    return Err(Error::validation("reader and sender must differ"));
                }
            }
            ClientEvent::Typing {
                sender, receiver, ..
            } => {
                required("sender", sender)?;
                required("receiver", receiver)?;
            }
            ClientEvent::GetConversation(query) => query.validate()?,
            ClientEvent::GetMoreMessages(query) => {
                if query.offset.is_none() {
                    return Err(Error::validation("offset required"));
                }
                query.validate()?;
            }
            ClientEvent::DeleteUser {
                admin_username,
                target_username,
            } => {
                required("admin_username", admin_username)?;
                required("target_username", target_username)?;
            }
        }
        Ok(self)
    }
}

impl HistoryQuery {
    fn validate(&mut self) -> Result<()> {
        required("user1", &mut self.user1)?;
        required("user2", &mut self.user2)?;
        if self.limit.is_some_and(|l| l < 0) || self.offset.is_some_and(|o| o < 0) {
            return Err(Error::validation("limit and offset must not be negative"));
        }
        Ok(())
    }
}

fn required(field: &str, value: &mut String) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{field} required")));
    }
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Acknowledgment tick carried by `message_sent`, `message_delivered` and
/// `message_read`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub offline_id: Option<String>,
    /// `None` on a replayed send: already processed
    pub message_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Full message as pushed to receivers and returned in history pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub message: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub timestamp: DateTime<Utc>,
    pub offline_id: Option<String>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        let (file_url, file_name, file_size) = match &message.attachment {
            Some(a) => (Some(a.url.clone()), a.name.clone(), a.size),
            None => (None, None, 0),
        };
        Self {
            id: message.id,
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            message: message.body.clone(),
            message_type: message.kind,
            file_url,
            file_name,
            file_size,
            timestamp: message.created_at,
            offline_id: message.offline_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub user1: String,
    pub user2: String,
    /// Oldest first
    pub messages: Vec<MessagePayload>,
    pub offset: i64,
    pub has_more: bool,
}

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    LoginSuccess {
        username: String,
        online_users: Vec<String>,
        all_users: Vec<UserSummary>,
        is_admin: bool,
    },
    LoginFailed {
        message: String,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    UserDeleted {
        username: String,
    },
    MessageSent(Receipt),
    NewMessage(MessagePayload),
    MessageDelivered(Receipt),
    MessageRead(Receipt),
    UserTyping {
        sender: String,
        is_typing: bool,
    },
    ConversationHistory(HistoryPage),
    MoreMessages(HistoryPage),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::LoginSuccess { .. } => "login_success",
            ServerEvent::LoginFailed { .. } => "login_failed",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::UserDeleted { .. } => "user_deleted",
            ServerEvent::MessageSent(_) => "message_sent",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::MessageDelivered(_) => "message_delivered",
            ServerEvent::MessageRead(_) => "message_read",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::ConversationHistory(_) => "conversation_history",
            ServerEvent::MoreMessages(_) => "more_messages",
        }
    }

    pub fn login_failed(message: impl Into<String>) -> Self {
        ServerEvent::LoginFailed {
            message: message.into(),
        }
    }
}
