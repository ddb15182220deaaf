//! Idempotency-token cache
//!
//! A bounded set of recently seen `offline_id`s. There is no per-entry
//! expiry: once the set grows past its capacity it is cleared in one go.
//! A token recorded just before a clear is forgotten, so a late retry of
//! that send is accepted as new (the store's unique token still catches
//! it). Empty tokens are never tracked.

use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::info;

pub struct DedupCache {
    seen: Mutex<HashSet<String>>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seen(&self, token: &str) -> bool {
        !token.is_empty() && self.seen.lock().contains(token)
    }

    pub fn record(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        let mut seen = self.seen.lock();
        self.insert_locked(&mut seen, token);
    }

    /// `seen` + `record` under one lock. Returns `true` when the token is
    /// new (or empty) and the send should proceed.
    pub fn check_and_record(&self, token: &str) -> bool {
        if token.is_empty() {
            return true;
        }
        let mut seen = self.seen.lock();
        if seen.contains(token) {
            return false;
        }
        self.insert_locked(&mut seen, token);
        true
    }

    /// Withdraw a token whose send was never persisted.
    pub fn forget(&self, token: &str) {
        if !token.is_empty() {
            self.seen.lock().remove(token);
        }
    }

    fn insert_locked(&self, seen: &mut HashSet<String>, token: &str) {
        seen.insert(token.to_string());
        if seen.len() > self.capacity {
            info!("[Dedup] {} tokens exceed capacity {}; clearing", seen.len(), self.capacity);
            seen.clear();
        }
    }
}
