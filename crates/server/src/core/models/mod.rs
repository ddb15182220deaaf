use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered user. Created on first login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub is_admin: bool,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Public listing entry for peer lists and `GET /users`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub is_online: bool,
    pub is_admin: bool,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            is_online: user.is_online,
            is_admin: user.is_admin,
        }
    }
}

/// Message kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "voice" => Ok(MessageKind::Voice),
            other => Err(format!("unknown message kind `{other}`")),
        }
    }
}

/// Reference to an attachment already stored elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub size: i64,
}

/// A persisted direct message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the store, monotonically increasing
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    /// Client idempotency token (`offline_id` on the wire)
    pub offline_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Lifecycle position derived from the persisted timestamps.
    pub fn state(&self) -> DeliveryState {
        if self.read_at.is_some() {
            DeliveryState::Read
        } else if self.delivered_at.is_some() {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    }

    /// True if this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }

    pub fn involves(&self, username: &str) -> bool {
        self.sender == username || self.receiver == username
    }
}

/// A message about to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub offline_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn into_message(self, id: i64) -> Message {
        Message {
            id,
            sender: self.sender,
            receiver: self.receiver,
            body: self.body,
            kind: self.kind,
            attachment: self.attachment,
            offline_id: self.offline_id,
            created_at: self.created_at,
            delivered_at: None,
            read_at: None,
        }
    }
}

/// Outcome of inserting a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The idempotency token was already persisted under this id
    Conflict(i64),
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Conflict(id) => *id,
        }
    }
}

/// A row touched by a bulk read update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: i64,
    pub offline_id: Option<String>,
}

/// Message lifecycle: Created -> Sent -> Delivered? -> Read?
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryState {
    Created,
    Sent,
    Delivered,
    Read,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        NewMessage {
            sender: "alice".into(),
            receiver: "bob".into(),
            body: "hi".into(),
            kind: MessageKind::Text,
            attachment: None,
            offline_id: Some("T1".into()),
            created_at: Utc::now(),
        }
        .into_message(7)
    }

    #[test]
    fn state_follows_timestamps() {
        let mut msg = sample();
        assert_eq!(msg.state(), DeliveryState::Sent);
        msg.delivered_at = Some(Utc::now());
        assert_eq!(msg.state(), DeliveryState::Delivered);
        msg.read_at = Some(Utc::now());
        assert_eq!(msg.state(), DeliveryState::Read);
    }

    #[test]
    fn conversation_membership_is_unordered() {
        let msg = sample();
        assert!(msg.is_between("alice", "bob"));
        assert!(msg.is_between("bob", "alice"));
        assert!(!msg.is_between("alice", "carol"));
        assert!(msg.involves("bob"));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [MessageKind::Text, MessageKind::Image, MessageKind::Voice] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("video".parse::<MessageKind>().is_err());
    }
}
