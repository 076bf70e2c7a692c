//! REST surface over the persisted chat schema: two-party history,
//! per-sender unread counts, and the online snapshot. These back the
//! surrounding application's chat UI; live traffic goes over /ws.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::{ChatMessage, UserId};
use crate::state::AppState;

/// Fixed page size for conversation history.
const HISTORY_PAGE_SIZE: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub receiver_id: UserId,
    /// 1-based page number; defaults to the newest page.
    pub page: Option<i64>,
}

/// GET /api/chat/history?receiver_id=&page= — Paginated two-party history,
/// newest first. Bearer JWT required.
pub async fn chat_history(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, StatusCode> {
    let user_id = claims.user_id()?;

    let offset = match query.page {
        Some(page) if page > 0 => (page - 1) * HISTORY_PAGE_SIZE,
        _ => 0,
    };

    let messages = state
        .store
        .history(user_id, query.receiver_id, HISTORY_PAGE_SIZE, offset)
        .await
        .map_err(|e| {
            tracing::error!(user_id, error = %e, "failed to load chat history");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(messages))
}

/// GET /api/chat/unread — Undelivered message counts for the authenticated
/// user, keyed by sender id. Bearer JWT required.
pub async fn unread_counts(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<HashMap<UserId, i64>>, StatusCode> {
    let user_id = claims.user_id()?;

    let counts = state.store.unread_counts(user_id).await.map_err(|e| {
        tracing::error!(user_id, error = %e, "failed to load unread counts");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(counts))
}

/// GET /api/chat/online — Snapshot of online user ids from the presence
/// registry. Bearer JWT required.
pub async fn online_status(
    State(state): State<AppState>,
    _claims: Claims,
) -> Json<HashMap<UserId, bool>> {
    let online = state
        .registry
        .snapshot()
        .into_iter()
        .map(|id| (id, true))
        .collect();
    Json(online)
}
