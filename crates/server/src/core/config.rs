//! Relay server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chat::engine::CoordinationEngine;
use crate::core::store::DurableStore;

/// Default ceiling for the idempotency-token cache before it is bulk-cleared.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Default number of messages returned by a history request without a limit.
pub const DEFAULT_HISTORY_PAGE: i64 = 50;

/// Which DurableStore backend the server runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl StorageBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Configuration for the chat relay
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Directory holding the SQLite database
    pub data_dir: PathBuf,
    /// Storage backend
    pub storage: StorageBackend,
    /// Usernames that are always privileged
    pub admin_usernames: Vec<String>,
    /// Token count above which the dedup cache is cleared
    pub dedup_capacity: usize,
    /// Default page size for history requests
    pub history_page_size: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            data_dir: PathBuf::from("relay_data"),
            storage: StorageBackend::Sqlite,
            admin_usernames: vec!["admin".to_string()],
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            history_page_size: DEFAULT_HISTORY_PAGE,
        }
    }
}

impl RelayConfig {
    /// Build a config from `RELAY_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("RELAY_ROOT") {
            config.data_dir = PathBuf::from(root);
        }
        if let Some(addr) = env_parse::<SocketAddr>("RELAY_BIND") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("RELAY_STORAGE") {
            match StorageBackend::parse(&raw) {
                Some(backend) => config.storage = backend,
                None => tracing::warn!("Unknown RELAY_STORAGE `{}`; using sqlite", raw),
            }
        }
        if let Ok(raw) = std::env::var("RELAY_ADMINS") {
            let admins: Vec<String> = raw
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            if !admins.is_empty() {
                config.admin_usernames = admins;
            }
        }
        if let Some(capacity) = env_parse::<usize>("RELAY_DEDUP_CAPACITY") {
            config.dedup_capacity = capacity;
        }
        if let Some(page) = env_parse::<i64>("RELAY_HISTORY_PAGE") {
            config.history_page_size = page.max(1);
        }

        config
    }

    /// Create config with custom base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// SQLite connection URL for the relay database
    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.data_dir.join("relay.sqlite").display())
    }

    pub fn is_admin_name(&self, username: &str) -> bool {
        self.admin_usernames.iter().any(|admin| admin == username)
    }

    /// Ensure the data directory exists
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}=`{}`", key, raw);
            None
        }
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub engine: Arc<CoordinationEngine>,
    pub store: Arc<dyn DurableStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_base_dir_keeps_defaults() {
        let config = RelayConfig::with_base_dir("/tmp/relay-test");
        assert_eq!(config.dedup_capacity, DEFAULT_DEDUP_CAPACITY);
        assert_eq!(config.history_page_size, DEFAULT_HISTORY_PAGE);
        assert_eq!(config.database_url(), "sqlite:/tmp/relay-test/relay.sqlite");
        assert!(config.is_admin_name("admin"));
        assert!(!config.is_admin_name("alice"));
    }

    #[test]
    fn storage_backend_parse() {
        assert_eq!(StorageBackend::parse(" Memory "), Some(StorageBackend::Memory));
        assert_eq!(StorageBackend::parse("sqlite"), Some(StorageBackend::Sqlite));
        assert_eq!(StorageBackend::parse("postgres"), None);
    }
}
