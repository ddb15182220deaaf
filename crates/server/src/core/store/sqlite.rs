//! SQLite-backed DurableStore
//!
//! Users and messages live in one database file (`relay.sqlite` under the
//! data directory). Timestamps are stored as fixed-width RFC 3339 text so
//! lexical order equals chronological order.

use super::DurableStore;
use crate::core::error::{Error, Result};
use crate::core::models::{
    Attachment, InsertOutcome, Message, NewMessage, ReadReceipt, User, UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, warn};

pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    username: String,
    is_admin: bool,
    is_online: bool,
    last_seen: String,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    sender: String,
    receiver: String,
    body: String,
    kind: String,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: i64,
    offline_id: Option<String>,
    created_at: String,
    delivered_at: Option<String>,
    read_at: Option<String>,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            username: row.username,
            is_admin: row.is_admin,
            is_online: row.is_online,
            last_seen: parse_stamp(&row.last_seen)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let kind = row.kind.parse().map_err(Error::StorageUnavailable)?;
        let attachment = row.file_url.filter(|url| !url.is_empty()).map(|url| Attachment {
            url,
            name: row.file_name,
            size: row.file_size,
        });

        Ok(Message {
            id: row.id,
            sender: row.sender,
            receiver: row.receiver,
            body: row.body,
            kind,
            attachment,
            offline_id: row.offline_id,
            created_at: parse_stamp(&row.created_at)?,
            delivered_at: row.delivered_at.as_deref().map(parse_stamp).transpose()?,
            read_at: row.read_at.as_deref().map(parse_stamp).transpose()?,
        })
    }
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::StorageUnavailable(format!("corrupt timestamp `{raw}`: {e}")))
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and seed `admins`.
    pub async fn open(url: &str, admins: &[String]) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_db(admins).await?;

        info!("[Store] SQLite store ready at {}", url);
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub async fn in_memory(admins: &[String]) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_db(admins).await?;
        Ok(store)
    }

    async fn init_db(&self, admins: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                is_admin INTEGER NOT NULL DEFAULT 0,
                is_online INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'text',
                file_url TEXT,
                file_name TEXT,
                file_size INTEGER NOT NULL DEFAULT 0,
                offline_id TEXT UNIQUE,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                read_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_participants ON messages (sender, receiver, created_at)",
        )
        .execute(&self.pool)
        .await?;

        // Nobody is connected to a freshly started relay.
        sqlx::query("UPDATE users SET is_online = 0")
            .execute(&self.pool)
            .await?;

        for admin in admins {
            self.upsert_user(admin, true).await?;
        }

        Ok(())
    }

    /// Insert one row. A taken token surfaces as `Error::Conflict` carrying
    /// the id of the row that owns it.
    async fn insert_row(&self, message: &NewMessage) -> Result<i64> {
        let token = message.offline_id.as_deref().filter(|t| !t.is_empty());
        let (file_url, file_name, file_size) = match &message.attachment {
            Some(a) => (Some(a.url.as_str()), a.name.as_deref(), a.size),
            None => (None, None, 0),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages
                (sender, receiver, body, kind, file_url, file_name, file_size, offline_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.sender)
        .bind(&message.receiver)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(file_url)
        .bind(file_name)
        .bind(file_size)
        .bind(token)
        .bind(stamp(message.created_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM messages WHERE offline_id = ?")
                        .bind(token)
                        .fetch_optional(&self.pool)
                        .await?;
                match existing {
                    Some((existing_id,)) => Err(Error::Conflict { existing_id }),
                    None => Err(Error::StorageUnavailable(
                        "unique violation without a matching offline_id".to_string(),
                    )),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert_user(&self, username: &str, is_admin: bool) -> Result<User> {
        let now = stamp(Utc::now());
        let row: UserRow = sqlx::query_as(
            r#"
            INSERT INTO users (username, is_admin, is_online, created_at, last_seen)
            VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                last_seen = excluded.last_seen,
                is_admin = MAX(users.is_admin, excluded.is_admin)
            RETURNING username, is_admin, is_online, last_seen
            "#,
        )
        .bind(username)
        .bind(is_admin)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn set_online(&self, username: &str, online: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE username = ?")
            .bind(online)
            .bind(stamp(Utc::now()))
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_admin(&self, username: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_admin FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(admin,)| admin).unwrap_or(false))
    }

    async fn list_users(&self, exclude: Option<&str>) -> Result<Vec<UserSummary>> {
        let rows: Vec<(String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT username, is_online, is_admin
            FROM users
            WHERE username != ?
            ORDER BY is_online DESC, username
            "#,
        )
        .bind(exclude.unwrap_or(""))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(username, is_online, is_admin)| UserSummary {
                username,
                is_online,
                is_admin,
            })
            .collect())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome> {
        match self.insert_row(message).await {
            Ok(id) => Ok(InsertOutcome::Inserted(id)),
            Err(Error::Conflict { existing_id }) => {
                warn!(
                    "[Store] Duplicate offline_id {:?} resolved to message {}",
                    message.offline_id, existing_id
                );
                Ok(InsertOutcome::Conflict(existing_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn message_by_id(&self, message_id: i64) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, sender, receiver, body, kind, file_url, file_name, file_size,
                   offline_id, created_at, delivered_at, read_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }

    async fn mark_delivered(&self, message_id: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL")
            .bind(stamp(Utc::now()))
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_read_bulk(&self, sender: &str, receiver: &str) -> Result<Vec<ReadReceipt>> {
        let now = stamp(Utc::now());
        let mut rows: Vec<(i64, Option<String>)> = sqlx::query_as(
            r#"
            UPDATE messages
            SET read_at = ?, delivered_at = COALESCE(delivered_at, ?)
            WHERE sender = ? AND receiver = ? AND read_at IS NULL
            RETURNING id, offline_id
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(sender)
        .bind(receiver)
        .fetch_all(&self.pool)
        .await?;

        rows.sort_by_key(|(id, _)| *id);
        Ok(rows
            .into_iter()
            .map(|(message_id, offline_id)| ReadReceipt {
                message_id,
                offline_id,
            })
            .collect())
    }

    async fn query_range(
        &self,
        user_a: &str,
        user_b: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, sender, receiver, body, kind, file_url, file_name, file_size,
                   offline_id, created_at, delivered_at, read_at
            FROM messages
            WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let messages = sqlx::query("DELETE FROM messages WHERE sender = ? OR receiver = ?")
            .bind(username)
            .bind(username)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let users = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!(
            "[Store] Deleted user {} ({} messages removed)",
            username, messages
        );
        Ok(users > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::MessageKind;
    use tempfile::TempDir;

    fn draft(sender: &str, receiver: &str, body: &str, token: Option<&str>) -> NewMessage {
        NewMessage {
            sender: sender.into(),
            receiver: receiver.into(),
            body: body.into(),
            kind: MessageKind::Text,
            attachment: None,
            offline_id: token.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    async fn open_temp(dir: &TempDir) -> SqliteStore {
        let url = format!("sqlite:{}", dir.path().join("relay.sqlite").display());
        SqliteStore::open(&url, &["root".to_string()]).await.unwrap()
    }

    #[tokio::test]
    async fn test_admins_are_seeded_and_sticky() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        assert!(store.is_admin("root").await.unwrap());
        assert!(!store.is_admin("nobody").await.unwrap());

        // A later non-admin upsert must not demote.
        let user = store.upsert_user("root", false).await.unwrap();
        assert!(user.is_admin);
    }

    #[tokio::test]
    async fn test_duplicate_token_resolves_to_original() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        let first = store
            .insert_message(&draft("alice", "bob", "hi", Some("T1")))
            .await
            .unwrap();
        let second = store
            .insert_message(&draft("alice", "bob", "hi", Some("T1")))
            .await
            .unwrap();

        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Conflict(first.id()));
        assert_eq!(store.query_range("alice", "bob", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_tokens_never_conflict() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        store.insert_message(&draft("alice", "bob", "a", Some(""))).await.unwrap();
        store.insert_message(&draft("alice", "bob", "b", Some(""))).await.unwrap();
        store.insert_message(&draft("alice", "bob", "c", None)).await.unwrap();

        assert_eq!(store.query_range("bob", "alice", 10, 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_query_range_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        for body in ["one", "two", "three"] {
            store.insert_message(&draft("alice", "bob", body, None)).await.unwrap();
        }
        store.insert_message(&draft("alice", "carol", "other", None)).await.unwrap();

        let page = store.query_range("bob", "alice", 2, 0).await.unwrap();
        let bodies: Vec<_> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["three", "two"]);

        let rest = store.query_range("alice", "bob", 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, "one");
    }

    #[tokio::test]
    async fn test_mark_read_bulk_only_touches_unread() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        for token in ["a", "b", "c"] {
            store
                .insert_message(&draft("alice", "bob", token, Some(token)))
                .await
                .unwrap();
        }
        store.insert_message(&draft("bob", "alice", "reply", None)).await.unwrap();

        let receipts = store.mark_read_bulk("alice", "bob").await.unwrap();
        let tokens: Vec<_> = receipts.iter().filter_map(|r| r.offline_id.as_deref()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);

        assert!(store.mark_read_bulk("alice", "bob").await.unwrap().is_empty());

        let page = store.query_range("alice", "bob", 10, 0).await.unwrap();
        let reply = page.iter().find(|m| m.sender == "bob").unwrap();
        assert!(reply.read_at.is_none());
        assert!(page
            .iter()
            .filter(|m| m.sender == "alice")
            .all(|m| m.read_at.is_some() && m.delivered_at.is_some()));
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let dir = TempDir::new().unwrap();
        let store = open_temp(&dir).await;

        store.upsert_user("alice", false).await.unwrap();
        store.upsert_user("bob", false).await.unwrap();
        store.insert_message(&draft("alice", "bob", "x", None)).await.unwrap();
        store.insert_message(&draft("bob", "alice", "y", None)).await.unwrap();

        assert!(store.delete_user("alice").await.unwrap());
        assert!(!store.delete_user("alice").await.unwrap());
        assert!(store.query_range("alice", "bob", 10, 0).await.unwrap().is_empty());

        let users = store.list_users(None).await.unwrap();
        assert!(users.iter().all(|u| u.username != "alice"));
    }

    #[tokio::test]
    async fn test_list_users_orders_online_first() {
        let store = SqliteStore::in_memory(&[]).await.unwrap();
        for name in ["carol", "alice", "bob"] {
            store.upsert_user(name, false).await.unwrap();
        }
        store.set_online("carol", true).await.unwrap();

        let names: Vec<_> = store
            .list_users(Some("bob"))
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["carol", "alice"]);
    }

    #[tokio::test]
    async fn test_attachment_survives_storage() {
        let store = SqliteStore::in_memory(&[]).await.unwrap();
        let mut message = draft("alice", "bob", "", None);
        message.kind = MessageKind::Voice;
        message.attachment = Some(Attachment {
            url: "/uploads/a.ogg".into(),
            name: Some("a.ogg".into()),
            size: 512,
        });
        store.insert_message(&message).await.unwrap();

        let stored = &store.query_range("alice", "bob", 1, 0).await.unwrap()[0];
        assert_eq!(stored.kind, MessageKind::Voice);
        assert_eq!(stored.attachment, message.attachment);
    }
}
