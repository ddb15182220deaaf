//! Core Service Layer
//!
//! Shared infrastructure for the relay: configuration, error taxonomy,
//! data models and durable storage.

pub mod config;
pub mod error;
pub mod models;
pub mod store;

// Re-exports for convenience
pub use config::{AppState, RelayConfig, StorageBackend};
pub use error::{Error, Result};
pub use store::DurableStore;
