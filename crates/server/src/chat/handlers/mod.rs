//! Chat Handlers and Router
//!
//! The WebSocket endpoint carries every client event; the HTTP routes
//! cover the user directory and admin account removal.

use crate::core::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub mod admin;
pub mod users;
pub mod ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/users", get(users::list_users))
        .route("/admin/delete_user", post(admin::delete_user))
}
