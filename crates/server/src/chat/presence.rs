//! Presence Registry
//!
//! Single source of truth for which usernames are reachable and through
//! which connections. Regular users hold at most one session; privileged
//! users may hold any number. All mutation goes through one mutex and no
//! lock is ever held across an await.

use crate::chat::hub::ConnectionId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Result of a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First session for this user: they just came online
    Joined,
    /// Privileged user opened another concurrent session
    AdditionalSession,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Non-privileged user already has a live session
    AlreadyOnline,
    /// This connection is already bound to a username
    ConnectionBound,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::AlreadyOnline => "Username already taken",
            RejectReason::ConnectionBound => "Connection already logged in",
        }
    }
}

/// What a disconnect did to the owning user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub username: String,
    /// The last session closed; the user is now offline
    pub went_offline: bool,
}

#[derive(Default)]
struct Sessions {
    by_user: HashMap<String, BTreeSet<ConnectionId>>,
    owner: HashMap<ConnectionId, String>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    inner: Mutex<Sessions>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `username`. Check and insert happen under one lock so
    /// two racing logins for the same regular user cannot both succeed.
    pub fn connect(&self, username: &str, conn: ConnectionId, privileged: bool) -> Admission {
        let mut sessions = self.inner.lock();

        if sessions.owner.contains_key(&conn) {
            return Admission::Rejected(RejectReason::ConnectionBound);
        }

        let existing = sessions
            .by_user
            .get(username)
            .map(|set| !set.is_empty())
            .unwrap_or(false);
        if existing && !privileged {
            debug!("[Presence] Rejected duplicate login for {}", username);
            return Admission::Rejected(RejectReason::AlreadyOnline);
        }

        sessions
            .by_user
            .entry(username.to_string())
            .or_default()
            .insert(conn);
        sessions.owner.insert(conn, username.to_string());

        if existing {
            info!("[Presence] {} opened another session ({})", username, conn);
            Admission::AdditionalSession
        } else {
            info!("[Presence] {} is online ({})", username, conn);
            Admission::Joined
        }
    }

    /// Unbind `conn`. Returns `None` if it never logged in.
    pub fn disconnect(&self, conn: ConnectionId) -> Option<Departure> {
        let mut sessions = self.inner.lock();
        let username = sessions.owner.remove(&conn)?;

        let went_offline = match sessions.by_user.get_mut(&username) {
            Some(set) => {
                set.remove(&conn);
                set.is_empty()
            }
            None => true,
        };
        if went_offline {
            sessions.by_user.remove(&username);
            info!("[Presence] {} is offline", username);
        }

        Some(Departure {
            username,
            went_offline,
        })
    }

    /// Drop every session of `username` (used on account deletion).
    /// Returns the connections that were bound.
    pub fn evict(&self, username: &str) -> Vec<ConnectionId> {
        let mut sessions = self.inner.lock();
        let conns: Vec<ConnectionId> = sessions
            .by_user
            .remove(username)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for conn in &conns {
            sessions.owner.remove(conn);
        }
        conns
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner
            .lock()
            .by_user
            .get(username)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Live connections of `username`; empty when offline.
    pub fn connections_for(&self, username: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .by_user
            .get(username)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn username_for(&self, conn: ConnectionId) -> Option<String> {
        self.inner.lock().owner.get(&conn).cloned()
    }

    /// Sorted online usernames, minus `except`.
    pub fn online_usernames(&self, except: Option<&str>) -> Vec<String> {
        let sessions = self.inner.lock();
        let mut names: Vec<String> = sessions
            .by_user
            .iter()
            .filter(|(name, set)| !set.is_empty() && Some(name.as_str()) != except)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
