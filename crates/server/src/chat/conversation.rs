//! Conversation Router
//!
//! Decides which live connections hear about what. Routing reads the
//! presence registry at call time and keeps no state of its own; the
//! caller dispatches the resulting [`Outbound`] batches.

use crate::chat::hub::{ConnectionId, Outbound};
use crate::chat::presence::PresenceRegistry;
use crate::chat::protocol::{HistoryPage, MessagePayload, Receipt, ServerEvent};
use crate::core::models::{Message, ReadReceipt};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Events produced by one accepted send, in emission order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoutePlan {
    /// `message_sent` to each sender session
    pub sent: Vec<Outbound>,
    /// `new_message` to each receiver session
    pub delivery: Vec<Outbound>,
    /// `message_delivered` to each sender session; empty when the receiver
    /// is offline
    pub delivered: Vec<Outbound>,
}

impl RoutePlan {
    pub fn reaches_receiver(&self) -> bool {
        !self.delivery.is_empty()
    }
}

#[derive(Clone)]
pub struct ConversationRouter {
    presence: Arc<PresenceRegistry>,
}

impl ConversationRouter {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    pub fn route(&self, message: &Message) -> RoutePlan {
        let sender_conns = self.presence.connections_for(&message.sender);
        let receiver_conns = self.presence.connections_for(&message.receiver);
        let receipt = Receipt {
            offline_id: message.offline_id.clone(),
            message_id: Some(message.id),
            timestamp: message.created_at,
        };

        let sent = fan_out(&sender_conns, &ServerEvent::MessageSent(receipt.clone()));
        if receiver_conns.is_empty() {
            return RoutePlan {
                sent,
                ..RoutePlan::default()
            };
        }

        RoutePlan {
            sent,
            delivery: fan_out(&receiver_conns, &ServerEvent::NewMessage(message.into())),
            delivered: fan_out(&sender_conns, &ServerEvent::MessageDelivered(receipt)),
        }
    }

    /// `new_message` copy for a third party (an admin sending as someone else).
    pub fn copy_to(&self, username: &str, message: &Message) -> Vec<Outbound> {
        fan_out(
            &self.presence.connections_for(username),
            &ServerEvent::NewMessage(message.into()),
        )
    }

    /// `message_sent` with no id, for a send whose token was already seen.
    pub fn replay_ack(&self, sender: &str, offline_id: &str, at: DateTime<Utc>) -> Vec<Outbound> {
        let event = ServerEvent::MessageSent(Receipt {
            offline_id: Some(offline_id.to_string()),
            message_id: None,
            timestamp: at,
        });
        fan_out(&self.presence.connections_for(sender), &event)
    }

    /// One `message_read` per receipt, to every session of `sender`.
    pub fn read_receipts(
        &self,
        sender: &str,
        receipts: &[ReadReceipt],
        at: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let conns = self.presence.connections_for(sender);
        receipts
            .iter()
            .flat_map(|r| {
                let event = ServerEvent::MessageRead(Receipt {
                    offline_id: r.offline_id.clone(),
                    message_id: Some(r.message_id),
                    timestamp: at,
                });
                fan_out(&conns, &event)
            })
            .collect()
    }

    /// `message_delivered` for backlog rows picked up by a history fetch.
    pub fn backlog_delivered(&self, messages: &[&Message], at: DateTime<Utc>) -> Vec<Outbound> {
        messages
            .iter()
            .flat_map(|m| {
                let event = ServerEvent::MessageDelivered(Receipt {
                    offline_id: m.offline_id.clone(),
                    message_id: Some(m.id),
                    timestamp: at,
                });
                fan_out(&self.presence.connections_for(&m.sender), &event)
            })
            .collect()
    }

    /// `user_typing` goes to the receiver only; dropped when they are offline.
    pub fn typing_indicator(&self, sender: &str, receiver: &str, is_typing: bool) -> Vec<Outbound> {
        let event = ServerEvent::UserTyping {
            sender: sender.to_string(),
            is_typing,
        };
        fan_out(&self.presence.connections_for(receiver), &event)
    }

    /// Turn a newest-first page into the chronological page clients see.
    ///
    /// `has_more` is `page.len() == limit`: a page that exactly exhausts
    /// the conversation still reports more. Clients find out on the next
    /// (empty) page.
    pub fn history_page(
        user1: &str,
        user2: &str,
        newest_first: &[Message],
        limit: i64,
        offset: i64,
    ) -> HistoryPage {
        let messages: Vec<MessagePayload> =
            newest_first.iter().rev().map(MessagePayload::from).collect();
        HistoryPage {
            user1: user1.to_string(),
            user2: user2.to_string(),
            has_more: messages.len() as i64 == limit,
            messages,
            offset,
        }
    }
}

fn fan_out(conns: &[ConnectionId], event: &ServerEvent) -> Vec<Outbound> {
    conns
        .iter()
        .map(|conn| Outbound::new(*conn, event.clone()))
        .collect()
}
