//! Metadata update endpoints.

use std::collections::HashSet;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use rolelink_core::watcher::RoleChangeEvent;
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::error::{AppError, AppResult};

/// Body of `POST /update-metadata`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub user_id: String,
    /// Current role ids; read from the configured guild when omitted.
    pub role_ids: Option<HashSet<String>>,
}

/// `POST /update-metadata`: push the user's current metadata.
///
/// Returns 204 whether the push happened, was skipped, or was rejected by the
/// platform; the outcome is logged by the pusher.
pub async fn update_metadata_handler(
    State(state): State<AppState>,
    Json(body): Json<UpdateMetadataRequest>,
) -> AppResult<StatusCode> {
    let result = match &body.role_ids {
        Some(roles) => state.pusher.sync(&body.user_id, roles).await?,
        None => state.pusher.sync_from_platform(&body.user_id).await?,
    };
    debug!(user_id = %body.user_id, ?result, "update-metadata handled");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /role-change`: hand a role-change notification to the watcher.
pub async fn role_change_handler(
    State(state): State<AppState>,
    Json(event): Json<RoleChangeEvent>,
) -> AppResult<StatusCode> {
    state
        .role_events
        .send(event)
        .await
        .map_err(|_| AppError::Internal("role-change watcher is not running".into()))?;
    Ok(StatusCode::ACCEPTED)
}
