//! Coordination Engine
//!
//! One handler per inbound client event. Handlers consult the presence
//! registry and dedup cache, persist through the store and drive the
//! delivery tracker. A failing handler is logged and dropped; it never
//! takes the connection or the engine down with it.

use crate::chat::conversation::ConversationRouter;
use crate::chat::dedup::DedupCache;
use crate::chat::delivery::{DeliveryTracker, SendOutcome};
use crate::chat::hub::{ConnectionHub, ConnectionId};
use crate::chat::presence::{Admission, PresenceRegistry};
use crate::chat::protocol::{ClientEvent, HistoryPage, HistoryQuery, SendMessageInput, ServerEvent};
use crate::core::config::RelayConfig;
use crate::core::error::{Error, Result};
use crate::core::models::{MessageKind, NewMessage};
use crate::core::store::DurableStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-sender FIFO lane: persistence of one sender's messages is serialised
type Lane = Arc<tokio::sync::Mutex<()>>;

pub struct CoordinationEngine {
    config: RelayConfig,
    store: Arc<dyn DurableStore>,
    presence: Arc<PresenceRegistry>,
    dedup: DedupCache,
    hub: Arc<ConnectionHub>,
    router: ConversationRouter,
    tracker: DeliveryTracker,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl CoordinationEngine {
    pub fn new(config: RelayConfig, store: Arc<dyn DurableStore>) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let router = ConversationRouter::new(presence.clone());
        let tracker = DeliveryTracker::new(store.clone(), hub.clone(), router.clone());

        Self {
            dedup: DedupCache::new(config.dedup_capacity),
            config,
            store,
            presence,
            hub,
            router,
            tracker,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// A socket opened. It can receive broadcasts but owns no username yet.
    pub fn open_connection(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn, rx) = self.hub.open();
        debug!("[Engine] Connection {} opened", conn);
        (conn, rx)
    }

    /// A socket closed. If it held the user's last session they go offline.
    pub async fn close_connection(&self, conn: ConnectionId) {
        self.hub.close(conn);
        debug!("[Engine] Connection {} closed", conn);

        let Some(departure) = self.presence.disconnect(conn) else {
            return;
        };
        if !departure.went_offline {
            return;
        }

        if let Err(e) = self.sync_presence(&departure.username).await {
            error!("[Engine] Failed to persist offline state for {}: {}", departure.username, e);
        }
        self.hub.broadcast(
            &ServerEvent::UserLeft {
                username: departure.username.clone(),
            },
            None,
        );
        info!("[Engine] {} left", departure.username);
    }

    /// Parse one raw frame and handle it. Malformed frames are ignored.
    pub async fn handle_frame(&self, conn: ConnectionId, raw: &str) {
        match ClientEvent::parse(raw) {
            Ok(event) => self.handle(conn, event).await,
            Err(e) => debug!("[Engine] Ignoring frame from {}: {}", conn, e),
        }
    }

    /// Run the handler for `event`. Errors end here.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let name = event.name();
        let event = match event.validated() {
            Ok(event) => event,
            Err(e) => {
                debug!("[Engine] Ignoring {} from {}: {}", name, conn, e);
                return;
            }
        };

        let result = match event {
            ClientEvent::Login { username } => self.login(conn, &username).await,
            ClientEvent::SendMessage(input) => self.send_message(input).await.map(|_| ()),
            ClientEvent::AdminSendMessage {
                admin_username,
                sender,
                receiver,
                message,
                message_type,
            } => self
                .admin_send_message(&admin_username, &sender, &receiver, &message, message_type)
                .await
                .map(|_| ()),
            ClientEvent::MarkRead { reader, sender } => {
                self.mark_read(&reader, &sender).await.map(|_| ())
            }
            ClientEvent::Typing {
                sender,
                receiver,
                is_typing,
            } => {
                self.typing(&sender, &receiver, is_typing);
                Ok(())
            }
            ClientEvent::GetConversation(query) => {
                self.fetch_history(conn, &query, false).await.map(|_| ())
            }
            ClientEvent::GetMoreMessages(query) => {
                self.fetch_history(conn, &query, true).await.map(|_| ())
            }
            ClientEvent::DeleteUser {
                admin_username,
                target_username,
            } => self
                .delete_user(&admin_username, &target_username)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {}
            Err(Error::Validation(msg)) => debug!("[Engine] {} from {} rejected: {}", name, conn, msg),
            Err(Error::Unauthorized(msg)) => warn!("[Engine] {} from {} unauthorized: {}", name, conn, msg),
            Err(e @ Error::StorageUnavailable(_)) => error!("[Engine] {} from {} aborted: {}", name, conn, e),
            Err(e) => warn!("[Engine] {} from {} failed: {}", name, conn, e),
        }
    }

    pub async fn login(&self, conn: ConnectionId, username: &str) -> Result<()> {
        let user = match self
            .store
            .upsert_user(username, self.config.is_admin_name(username))
            .await
        {
            Ok(user) => user,
            Err(e) => {
                self.hub.push(conn, ServerEvent::login_failed("Registration failed"));
                return Err(e);
            }
        };

        let admission = self.presence.connect(username, conn, user.is_admin);
        if let Admission::Rejected(reason) = admission {
            info!("[Engine] Login for {} refused: {}", username, reason.message());
            self.hub.push(conn, ServerEvent::login_failed(reason.message()));
            return Ok(());
        }

        if let Err(e) = self.sync_presence(username).await {
            error!("[Engine] Failed to persist online state for {}: {}", username, e);
        }

        let all_users = self.store.list_users(Some(username)).await.unwrap_or_else(|e| {
            warn!("[Engine] User listing unavailable for {}: {}", username, e);
            Vec::new()
        });

        self.hub.push(
            conn,
            ServerEvent::LoginSuccess {
                username: username.to_string(),
                online_users: self.presence.online_usernames(Some(username)),
                all_users,
                is_admin: user.is_admin,
            },
        );

        if admission == Admission::Joined {
            self.hub.broadcast(
                &ServerEvent::UserJoined {
                    username: username.to_string(),
                },
                Some(conn),
            );
        }

        info!("[Engine] {} logged in (admin: {})", username, user.is_admin);
        Ok(())
    }

    /// `send_message`. The sender needs a live session unless an admin
    /// vouches for it through `admin_username`, or the sender is a
    /// configured admin. Returns `None` for a deduplicated replay.
    pub async fn send_message(&self, input: SendMessageInput) -> Result<Option<SendOutcome>> {
        let acting_admin = match input.admin_username.clone() {
            Some(admin) => {
                self.require_admin(&admin).await?;
                Some(admin)
            }
            None => {
                self.require_session(&input.sender)?;
                None
            }
        };
        self.accept_send(input, acting_admin).await
    }

    /// `admin_send_message`: identical to a send, on behalf of `sender`.
    pub async fn admin_send_message(
        &self,
        admin: &str,
        sender: &str,
        receiver: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<Option<SendOutcome>> {
        self.require_admin(admin).await?;
        let input = SendMessageInput {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message: body.to_string(),
            message_type: kind,
            file_url: None,
            file_name: None,
            file_size: None,
            offline_id: None,
            admin_username: Some(admin.to_string()),
        };
        self.accept_send(input, Some(admin.to_string())).await
    }

    async fn accept_send(
        &self,
        input: SendMessageInput,
        acting_admin: Option<String>,
    ) -> Result<Option<SendOutcome>> {
        let token = input.offline_id.clone().unwrap_or_default();
        if !self.dedup.check_and_record(&token) {
            info!("[Engine] Ignoring duplicate send with offline_id {}", token);
            self.tracker.acknowledge_replay(&input.sender, &token);
            return Ok(None);
        }

        let draft = NewMessage {
            attachment: input.attachment(),
            sender: input.sender,
            receiver: input.receiver,
            body: input.message,
            kind: input.message_type,
            offline_id: input.offline_id,
            created_at: Utc::now(),
        };

        let outcome = match self.send_in_lane(draft).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Never persisted: let the client's retry through.
                self.dedup.forget(&token);
                return Err(e);
            }
        };

        if let Some(admin) = acting_admin.filter(|admin| *admin != outcome.message.sender) {
            self.tracker.copy_to(&admin, &outcome.message);
        }

        info!(
            "[Engine] Message {} from {} to {} ({:?})",
            outcome.message.id, outcome.message.sender, outcome.message.receiver, outcome.state
        );
        Ok(Some(outcome))
    }

    async fn send_in_lane(&self, mut draft: NewMessage) -> Result<SendOutcome> {
        let sender = draft.sender.clone();
        let lane = self
            .lanes
            .lock()
            .entry(sender.clone())
            .or_default()
            .clone();

        let outcome = {
            let _turn = lane.lock().await;
            // Stamp once the turn is ours so time order follows id order.
            draft.created_at = Utc::now();
            self.tracker.send(draft).await
        };

        drop(lane);
        let mut lanes = self.lanes.lock();
        if lanes
            .get(&sender)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(&sender);
        }

        outcome
    }

    /// `mark_read`: conversation-scoped. Returns how many messages flipped.
    pub async fn mark_read(&self, reader: &str, sender: &str) -> Result<usize> {
        Ok(self.tracker.mark_read(reader, sender).await?.len())
    }

    /// `typing`: forwarded to the receiver's sessions only. Returns how many
    /// sessions it reached.
    pub fn typing(&self, sender: &str, receiver: &str, is_typing: bool) -> usize {
        self.hub
            .dispatch(self.router.typing_indicator(sender, receiver, is_typing))
    }

    /// `get_conversation` / `get_more_messages`. The page goes back to
    /// `conn` only; rows addressed to the connection's user count as
    /// delivered.
    pub async fn fetch_history(
        &self,
        conn: ConnectionId,
        query: &HistoryQuery,
        more: bool,
    ) -> Result<HistoryPage> {
        let limit = query.limit.unwrap_or(self.config.history_page_size);
        let offset = query.offset.unwrap_or(0);

        let newest_first = self
            .store
            .query_range(&query.user1, &query.user2, limit, offset)
            .await?;

        if let Some(reader) = self.presence.username_for(conn) {
            if reader == query.user1 || reader == query.user2 {
                if let Err(e) = self.tracker.deliver_backlog(&reader, &newest_first).await {
                    warn!("[Engine] Backlog delivery for {} failed: {}", reader, e);
                }
            }
        }

        let page = ConversationRouter::history_page(&query.user1, &query.user2, &newest_first, limit, offset);
        let event = if more {
            ServerEvent::MoreMessages(page.clone())
        } else {
            ServerEvent::ConversationHistory(page.clone())
        };
        self.hub.push(conn, event);
        Ok(page)
    }

    /// Admin-only: remove `target` and their messages, unbind their
    /// sessions and tell everyone. Returns whether the user existed.
    pub async fn delete_user(&self, admin: &str, target: &str) -> Result<bool> {
        self.require_admin(admin).await?;

        let existed = self.store.delete_user(target).await?;
        let evicted = self.presence.evict(target);
        self.hub.broadcast(
            &ServerEvent::UserDeleted {
                username: target.to_string(),
            },
            None,
        );

        info!(
            "[Engine] {} deleted user {} ({} live session(s) unbound)",
            admin,
            target,
            evicted.len()
        );
        Ok(existed)
    }

    /// Persist the registry's view of `username`. A login or disconnect
    /// racing the write flips the registry, so re-read it after each write
    /// until the stored flag matches.
    pub(crate) async fn sync_presence(&self, username: &str) -> Result<()> {
        let mut online = self.presence.is_online(username);
        loop {
            self.store.set_online(username, online).await?;
            let now = self.presence.is_online(username);
            if now == online {
                return Ok(());
            }
            debug!("[Engine] Presence of {} changed during write; rewriting", username);
            online = now;
        }
    }

    fn require_session(&self, sender: &str) -> Result<()> {
        if self.presence.is_online(sender) || self.config.is_admin_name(sender) {
            Ok(())
        } else {
            Err(Error::unauthorized(format!("{sender} has no live session")))
        }
    }

    async fn require_admin(&self, username: &str) -> Result<()> {
        if self.store.is_admin(username).await? {
            Ok(())
        } else {
            Err(Error::unauthorized(format!("{username} is not an admin")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    fn engine() -> (Arc<MemoryStore>, CoordinationEngine) {
        let config = RelayConfig {
            admin_usernames: vec!["root".to_string()],
            ..RelayConfig::default()
        };
        let store = Arc::new(MemoryStore::new(&config.admin_usernames));
        let engine = CoordinationEngine::new(config, store.clone());
        (store, engine)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn input(sender: &str, receiver: &str, token: Option<&str>) -> SendMessageInput {
        SendMessageInput {
            sender: sender.into(),
            receiver: receiver.into(),
            message: "hi".into(),
            message_type: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
            offline_id: token.map(str::to_string),
            admin_username: None,
        }
    }

    fn send(sender: &str, receiver: &str, token: Option<&str>) -> ClientEvent {
        ClientEvent::SendMessage(input(sender, receiver, token))
    }

    #[tokio::test]
    async fn send_without_session_is_ignored() {
        let (store, engine) = engine();
        let (conn, mut rx) = engine.open_connection();

        engine.handle(conn, send("ghost", "bob", Some("T1"))).await;
        assert_eq!(store.message_count(), 0);
        assert!(drain(&mut rx).is_empty());
        // The token was not consumed by the rejected send.
        assert!(!engine.dedup().seen("T1"));
    }

    #[tokio::test]
    async fn configured_admin_may_send_without_session() {
        let (store, engine) = engine();
        let (conn, _rx) = engine.open_connection();

        engine.handle(conn, send("root", "bob", None)).await;
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn storage_outage_releases_the_token() {
        let (store, engine) = engine();
        let (conn, mut rx) = engine.open_connection();
        engine.handle(conn, ClientEvent::Login { username: "alice".into() }).await;
        drain(&mut rx);

        store.set_available(false);
        engine.handle(conn, send("alice", "bob", Some("T9"))).await;
        assert!(drain(&mut rx).is_empty());

        store.set_available(true);
        engine.handle(conn, send("alice", "bob", Some("T9"))).await;
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::MessageSent(r) if r.message_id.is_some()));
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn login_storage_failure_reports_login_failed() {
        let (store, engine) = engine();
        let (conn, mut rx) = engine.open_connection();
        store.set_available(false);

        engine.handle(conn, ClientEvent::Login { username: "alice".into() }).await;
        assert_eq!(drain(&mut rx), vec![ServerEvent::login_failed("Registration failed")]);
        assert!(!engine.presence().is_online("alice"));
    }

    #[tokio::test]
    async fn non_admin_cannot_delete_or_impersonate() {
        let (store, engine) = engine();
        let (conn, mut rx) = engine.open_connection();
        engine.handle(conn, ClientEvent::Login { username: "alice".into() }).await;
        drain(&mut rx);

        engine
            .handle(
                conn,
                ClientEvent::DeleteUser {
                    admin_username: "alice".into(),
                    target_username: "bob".into(),
                },
            )
            .await;
        engine
            .handle(
                conn,
                ClientEvent::AdminSendMessage {
                    admin_username: "alice".into(),
                    sender: "bob".into(),
                    receiver: "carol".into(),
                    message: "spoof".into(),
                    message_type: MessageKind::Text,
                },
            )
            .await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn admin_send_echoes_to_admin_sessions() {
        let (_store, engine) = engine();
        let (admin_conn, mut admin_rx) = engine.open_connection();
        let (bob_conn, mut bob_rx) = engine.open_connection();
        engine.handle(admin_conn, ClientEvent::Login { username: "root".into() }).await;
        engine.handle(bob_conn, ClientEvent::Login { username: "bob".into() }).await;
        drain(&mut admin_rx);
        drain(&mut bob_rx);

        let outcome = engine
            .admin_send_message("root", "carol", "bob", "as carol", MessageKind::Text)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.message.sender, "carol");

        let bob_events = drain(&mut bob_rx);
        assert!(matches!(&bob_events[0], ServerEvent::NewMessage(p) if p.sender == "carol"));
        let admin_events = drain(&mut admin_rx);
        assert!(matches!(&admin_events[0], ServerEvent::NewMessage(p) if p.message == "as carol"));
    }

    #[tokio::test]
    async fn history_from_unbound_connection_marks_nothing() {
        let (store, engine) = engine();
        engine.send_message(input("root", "bob", None)).await.unwrap();

        let (conn, mut rx) = engine.open_connection();
        let query = HistoryQuery {
            user1: "bob".into(),
            user2: "root".into(),
            limit: None,
            offset: None,
        };
        let page = engine.fetch_history(conn, &query, false).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);
        assert!(store.message(page.messages[0].id).unwrap().delivered_at.is_none());
        assert!(matches!(drain(&mut rx)[0], ServerEvent::ConversationHistory(_)));
    }

    #[tokio::test]
    async fn lanes_are_released_after_send() {
        let (_store, engine) = engine();
        engine
            .admin_send_message("root", "root", "bob", "x", MessageKind::Text)
            .await
            .unwrap();
        assert!(engine.lanes.lock().is_empty());
    }

    #[tokio::test]
    async fn created_at_is_stamped_inside_the_lane() {
        let (store, engine) = engine();
        let stale = chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let draft = |body: &str| NewMessage {
            sender: "root".into(),
            receiver: "bob".into(),
            body: body.into(),
            kind: MessageKind::Text,
            attachment: None,
            offline_id: None,
            created_at: stale,
        };

        let first = engine.send_in_lane(draft("first")).await.unwrap().message;
        let second = engine.send_in_lane(draft("second")).await.unwrap().message;

        assert!(first.created_at > stale);
        assert!(first.id < second.id);
        assert!(first.created_at <= second.created_at);
        assert_eq!(store.message(first.id).unwrap().created_at, first.created_at);
    }

    #[tokio::test]
    async fn presence_sync_rewrites_a_stale_flag() {
        let (store, engine) = engine();
        let (conn, _rx) = engine.open_connection();
        engine.handle(conn, ClientEvent::Login { username: "alice".into() }).await;
        assert!(store.user("alice").unwrap().is_online);

        // A late offline write from an earlier session lands after the login.
        store.set_online("alice", false).await.unwrap();
        engine.sync_presence("alice").await.unwrap();
        assert!(store.user("alice").unwrap().is_online);

        engine.close_connection(conn).await;
        assert!(!store.user("alice").unwrap().is_online);
    }
}
