//! In-memory DurableStore
//!
//! Same contract as the SQLite store, held behind one mutex. Availability
//! can be toggled to simulate an unreachable database.

use super::DurableStore;
use crate::core::error::{Error, Result};
use crate::core::models::{InsertOutcome, Message, NewMessage, ReadReceipt, User, UserSummary};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<String, User>,
    messages: Vec<Message>,
    next_id: i64,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new(admins: &[String]) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock();
            for admin in admins {
                state.users.insert(
                    admin.clone(),
                    User {
                        username: admin.clone(),
                        is_admin: true,
                        is_online: false,
                        last_seen: Utc::now(),
                    },
                );
            }
        }
        store
    }

    /// Make every subsequent call fail with `StorageUnavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of a single message, for assertions.
    pub fn message(&self, id: i64) -> Option<Message> {
        self.state.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.state.lock().users.get(username).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_user(&self, username: &str, is_admin: bool) -> Result<User> {
        self.check()?;
        let mut state = self.state.lock();
        let user = state
            .users
            .entry(username.to_string())
            .or_insert_with(|| User {
                username: username.to_string(),
                is_admin: false,
                is_online: false,
                last_seen: Utc::now(),
            });
        user.is_admin |= is_admin;
        user.last_seen = Utc::now();
        Ok(user.clone())
    }

    async fn set_online(&self, username: &str, online: bool) -> Result<()> {
        self.check()?;
        if let Some(user) = self.state.lock().users.get_mut(username) {
            user.is_online = online;
            user.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn is_admin(&self, username: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .users
            .get(username)
            .map(|u| u.is_admin)
            .unwrap_or(false))
    }

    async fn list_users(&self, exclude: Option<&str>) -> Result<Vec<UserSummary>> {
        self.check()?;
        let state = self.state.lock();
        let mut users: Vec<UserSummary> = state
            .users
            .values()
            .filter(|u| Some(u.username.as_str()) != exclude)
            .map(UserSummary::from)
            .collect();
        // BTreeMap is already alphabetical; stable sort keeps that within groups.
        users.sort_by_key(|u| !u.is_online);
        Ok(users)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome> {
        self.check()?;
        let mut state = self.state.lock();

        let token = message.offline_id.as_deref().filter(|t| !t.is_empty());
        if let Some(token) = token {
            if let Some(existing) = state
                .messages
                .iter()
                .find(|m| m.offline_id.as_deref() == Some(token))
            {
                return Ok(InsertOutcome::Conflict(existing.id));
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let mut stored = message.clone().into_message(id);
        stored.offline_id = token.map(str::to_string);
        state.messages.push(stored);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn message_by_id(&self, message_id: i64) -> Result<Option<Message>> {
        self.check()?;
        Ok(self.message(message_id))
    }

    async fn mark_delivered(&self, message_id: i64) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
            message.delivered_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn mark_read_bulk(&self, sender: &str, receiver: &str) -> Result<Vec<ReadReceipt>> {
        self.check()?;
        let now = Utc::now();
        let mut state = self.state.lock();
        let receipts = state
            .messages
            .iter_mut()
            .filter(|m| m.sender == sender && m.receiver == receiver && m.read_at.is_none())
            .map(|m| {
                m.read_at = Some(now);
                m.delivered_at.get_or_insert(now);
                ReadReceipt {
                    message_id: m.id,
                    offline_id: m.offline_id.clone(),
                }
            })
            .collect();
        Ok(receipts)
    }

    async fn query_range(
        &self,
        user_a: &str,
        user_b: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        self.check()?;
        let state = self.state.lock();
        let mut matching: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.is_between(user_a, user_b))
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        state.messages.retain(|m| !m.involves(username));
        Ok(state.users.remove(username).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::MessageKind;
    use tokio_test::{assert_err, assert_ok};

    fn draft(token: Option<&str>) -> NewMessage {
        NewMessage {
            sender: "alice".into(),
            receiver: "bob".into(),
            body: "hello".into(),
            kind: MessageKind::Text,
            attachment: None,
            offline_id: token.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_tokens_unique() {
        let store = MemoryStore::new(&[]);
        let a = assert_ok!(store.insert_message(&draft(Some("T1"))).await);
        let b = assert_ok!(store.insert_message(&draft(None)).await);
        let c = assert_ok!(store.insert_message(&draft(Some("T1"))).await);

        assert_eq!(a, InsertOutcome::Inserted(1));
        assert_eq!(b, InsertOutcome::Inserted(2));
        assert_eq!(c, InsertOutcome::Conflict(1));
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new(&["root".to_string()]);
        store.set_available(false);

        assert!(matches!(
            store.is_admin("root").await,
            Err(Error::StorageUnavailable(_))
        ));
        assert_err!(store.insert_message(&draft(None)).await);

        store.set_available(true);
        assert!(assert_ok!(store.is_admin("root").await));
    }

    #[tokio::test]
    async fn list_users_online_first_alphabetical() {
        let store = MemoryStore::new(&[]);
        for name in ["dave", "alice", "carol", "bob"] {
            store.upsert_user(name, false).await.unwrap();
        }
        store.set_online("dave", true).await.unwrap();
        store.set_online("bob", true).await.unwrap();

        let names: Vec<_> = store
            .list_users(Some("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["bob", "dave", "carol"]);
    }
}
