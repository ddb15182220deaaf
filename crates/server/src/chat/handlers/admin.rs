use crate::core::config::AppState;
use crate::core::error::Error;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub admin_username: String,
    pub target_username: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteUserResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /admin/delete_user
pub async fn delete_user(
    State(state): State<AppState>,
    Json(req): Json<DeleteUserRequest>,
) -> (StatusCode, Json<DeleteUserResponse>) {
    let admin = req.admin_username.trim();
    let target = req.target_username.trim();
    info!("POST /admin/delete_user - {} removes {}", admin, target);

    if admin.is_empty() || target.is_empty() {
        return failure(Error::validation("admin_username and target_username are required"));
    }

    match state.engine.delete_user(admin, target).await {
        Ok(_) => (
            StatusCode::OK,
            Json(DeleteUserResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => {
            warn!("[Admin] delete_user {} by {} failed: {}", target, admin, e);
            failure(e)
        }
    }
}

fn failure(e: Error) -> (StatusCode, Json<DeleteUserResponse>) {
    (
        e.status_code(),
        Json(DeleteUserResponse {
            success: false,
            error: Some(e.to_string()),
        }),
    )
}
