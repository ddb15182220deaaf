use crate::core::config::AppState;
use crate::core::error::Result;
use crate::core::models::UserSummary;
use axum::{extract::State, Json};
use tracing::info;

/// GET /users
///
/// Every registered user, online ones first, then alphabetical.
pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<UserSummary>>> {
    let users = state.store.list_users(None).await?;
    info!("GET /users - {} user(s)", users.len());
    Ok(Json(users))
}
