//! Delivery Tracker
//!
//! Moves a message through Created -> Sent -> Delivered -> Read, persisting
//! each step and pushing the matching tick to the sender.

use crate::chat::conversation::ConversationRouter;
use crate::chat::hub::ConnectionHub;
use crate::core::error::{Error, Result};
use crate::core::models::{DeliveryState, InsertOutcome, Message, NewMessage, ReadReceipt};
use crate::core::store::DurableStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to an accepted send
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub message: Message,
    /// `Sent` if the receiver was offline, `Delivered` if pushed live
    pub state: DeliveryState,
    /// The token already existed in the store; `message.id` is the original
    pub resolved_conflict: bool,
}

pub struct DeliveryTracker {
    store: Arc<dyn DurableStore>,
    hub: Arc<ConnectionHub>,
    router: ConversationRouter,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn DurableStore>,
        hub: Arc<ConnectionHub>,
        router: ConversationRouter,
    ) -> Self {
        Self { store, hub, router }
    }

    /// Persist `draft` and fan it out. A storage failure aborts before any
    /// acknowledgment goes out.
    pub async fn send(&self, draft: NewMessage) -> Result<SendOutcome> {
        let (mut message, resolved_conflict) = match self.store.insert_message(&draft).await? {
            InsertOutcome::Inserted(id) => (draft.into_message(id), false),
            InsertOutcome::Conflict(existing_id) => {
                info!(
                    "[Delivery] Token {:?} already stored as message {}",
                    draft.offline_id, existing_id
                );
                // Route what was stored, not the retry's copy.
                let stored = self.store.message_by_id(existing_id).await?.ok_or_else(|| {
                    Error::StorageUnavailable(format!("message {existing_id} vanished"))
                })?;
                (stored, true)
            }
        };
        let plan = self.router.route(&message);

        self.hub.dispatch(plan.sent);
        if plan.delivery.is_empty() {
            debug!(
                "[Delivery] {} -> {} stored as {} (receiver offline)",
                message.sender, message.receiver, message.id
            );
            return Ok(SendOutcome {
                message,
                state: DeliveryState::Sent,
                resolved_conflict,
            });
        }

        self.hub.dispatch(plan.delivery);
        if let Err(e) = self.store.mark_delivered(message.id).await {
            warn!("[Delivery] Failed to persist delivery of {}: {}", message.id, e);
        }
        message.delivered_at.get_or_insert_with(Utc::now);
        self.hub.dispatch(plan.delivered);

        debug!(
            "[Delivery] {} -> {} delivered as {}",
            message.sender, message.receiver, message.id
        );
        Ok(SendOutcome {
            message,
            state: DeliveryState::Delivered,
            resolved_conflict,
        })
    }

    /// Re-acknowledge a replayed send so the client stops retrying.
    pub fn acknowledge_replay(&self, sender: &str, offline_id: &str) -> usize {
        self.hub
            .dispatch(self.router.replay_ack(sender, offline_id, Utc::now()))
    }

    /// Mark everything `sender` sent to `reader` as read and tick each one.
    pub async fn mark_read(&self, reader: &str, sender: &str) -> Result<Vec<ReadReceipt>> {
        let receipts = self.store.mark_read_bulk(sender, reader).await?;
        if !receipts.is_empty() {
            info!(
                "[Delivery] {} read {} message(s) from {}",
                reader,
                receipts.len(),
                sender
            );
            self.hub
                .dispatch(self.router.read_receipts(sender, &receipts, Utc::now()));
        }
        Ok(receipts)
    }

    /// A history fetch by `reader` counts as delivery for every fetched
    /// row addressed to them that was never pushed live.
    pub async fn deliver_backlog(&self, reader: &str, page: &[Message]) -> Result<usize> {
        let pending: Vec<&Message> = page
            .iter()
            .filter(|m| m.receiver == reader && m.delivered_at.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        for message in &pending {
            self.store.mark_delivered(message.id).await?;
        }
        self.hub
            .dispatch(self.router.backlog_delivered(&pending, Utc::now()));

        debug!("[Delivery] {} picked up {} backlog message(s)", reader, pending.len());
        Ok(pending.len())
    }

    /// Push a copy of `message` to every session of `username`.
    pub fn copy_to(&self, username: &str, message: &Message) -> usize {
        self.hub.dispatch(self.router.copy_to(username, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::hub::ConnectionId;
    use crate::chat::presence::PresenceRegistry;
    use crate::chat::protocol::ServerEvent;
    use crate::core::models::MessageKind;
    use crate::core::store::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Rig {
        store: Arc<MemoryStore>,
        hub: Arc<ConnectionHub>,
        presence: Arc<PresenceRegistry>,
        tracker: DeliveryTracker,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new(&[]));
        let hub = Arc::new(ConnectionHub::new());
        let presence = Arc::new(PresenceRegistry::new());
        let tracker = DeliveryTracker::new(
            store.clone(),
            hub.clone(),
            ConversationRouter::new(presence.clone()),
        );
        Rig {
            store,
            hub,
            presence,
            tracker,
        }
    }

    impl Rig {
        fn login(&self, name: &str) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
            let (conn, rx) = self.hub.open();
            self.presence.connect(name, conn, false);
            (conn, rx)
        }
    }

    fn draft(token: &str) -> NewMessage {
        NewMessage {
            sender: "alice".into(),
            receiver: "bob".into(),
            body: "hello".into(),
            kind: MessageKind::Text,
            attachment: None,
            offline_id: Some(token.to_string()),
            created_at: Utc::now(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn offline_receiver_stays_sent() {
        let rig = rig();
        let (_a, mut alice) = rig.login("alice");

        let outcome = rig.tracker.send(draft("T1")).await.unwrap();
        assert_eq!(outcome.state, DeliveryState::Sent);

        let events = drain(&mut alice);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "message_sent");
        assert!(rig.store.message(outcome.message.id).unwrap().delivered_at.is_none());
    }

    #[tokio::test]
    async fn online_receiver_is_delivered_after_sent_tick() {
        let rig = rig();
        let (_a, mut alice) = rig.login("alice");
        let (_b, mut bob) = rig.login("bob");

        let outcome = rig.tracker.send(draft("T1")).await.unwrap();
        assert_eq!(outcome.state, DeliveryState::Delivered);

        let names: Vec<_> = drain(&mut alice).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["message_sent", "message_delivered"]);
        let names: Vec<_> = drain(&mut bob).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["new_message"]);
        assert!(rig.store.message(outcome.message.id).unwrap().delivered_at.is_some());
    }

    #[tokio::test]
    async fn storage_failure_sends_no_ack() {
        let rig = rig();
        let (_a, mut alice) = rig.login("alice");
        rig.store.set_available(false);

        assert!(rig.tracker.send(draft("T1")).await.is_err());
        assert!(drain(&mut alice).is_empty());
    }

    #[tokio::test]
    async fn backlog_fetch_marks_only_reader_rows() {
        let rig = rig();
        let (_a, mut alice) = rig.login("alice");
        rig.tracker.send(draft("T1")).await.unwrap();
        drain(&mut alice);

        let page = rig.store.query_range("alice", "bob", 10, 0).await.unwrap();
        assert_eq!(rig.tracker.deliver_backlog("alice", &page).await.unwrap(), 0);
        assert_eq!(rig.tracker.deliver_backlog("bob", &page).await.unwrap(), 1);

        let events = drain(&mut alice);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::MessageDelivered(r) if r.offline_id.as_deref() == Some("T1")));

        let page = rig.store.query_range("alice", "bob", 10, 0).await.unwrap();
        assert_eq!(rig.tracker.deliver_backlog("bob", &page).await.unwrap(), 0);
    }
}
