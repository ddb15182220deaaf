//! Chat Service Layer
//!
//! Presence, idempotent sends, delivery/read receipts and history
//! pagination for one-to-one conversations over WebSocket.

pub mod conversation;
pub mod dedup;
pub mod delivery;
pub mod engine;
pub mod handlers;
pub mod hub;
pub mod presence;
pub mod protocol;

pub use engine::CoordinationEngine;
pub use handlers::router;
