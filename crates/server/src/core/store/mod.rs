//! Durable storage for users and messages
//!
//! The coordination engine only sees the [`DurableStore`] trait. Two
//! backends ship: SQLite via sqlx for real deployments and an in-memory
//! store for ephemeral runs and tests.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::error::Result;
use crate::core::models::{InsertOutcome, Message, NewMessage, ReadReceipt, User, UserSummary};
use async_trait::async_trait;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Create the user if missing and refresh `last_seen`. `is_admin` only
    /// ever promotes; it never clears an existing flag.
    async fn upsert_user(&self, username: &str, is_admin: bool) -> Result<User>;

    /// Persist presence; always stamps `last_seen = now`.
    async fn set_online(&self, username: &str, online: bool) -> Result<()>;

    async fn is_admin(&self, username: &str) -> Result<bool>;

    /// All users except `exclude`, online first then by username.
    async fn list_users(&self, exclude: Option<&str>) -> Result<Vec<UserSummary>>;

    /// Insert a message. A non-empty `offline_id` that already exists
    /// resolves to [`InsertOutcome::Conflict`] with the original id.
    async fn insert_message(&self, message: &NewMessage) -> Result<InsertOutcome>;

    async fn message_by_id(&self, message_id: i64) -> Result<Option<Message>>;

    async fn mark_delivered(&self, message_id: i64) -> Result<()>;

    /// Stamp `read_at` on every unread message from `sender` to `receiver`
    /// and return the affected rows ordered by id.
    async fn mark_read_bulk(&self, sender: &str, receiver: &str) -> Result<Vec<ReadReceipt>>;

    /// Messages between the unordered pair, newest first.
    async fn query_range(&self, user_a: &str, user_b: &str, limit: i64, offset: i64)
        -> Result<Vec<Message>>;

    /// Delete a user and every message they sent or received. Returns
    /// whether the user existed.
    async fn delete_user(&self, username: &str) -> Result<bool>;
}
