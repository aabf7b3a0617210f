use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;
use crate::server::middleware::Session;

use super::{account_scope, owned_account, paging};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadQuery {
    pub account_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Threads of one account, or of all the user's accounts, newest activity
/// first.
pub async fn list_threads(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Value>, AppError> {

    let account_ids = account_scope(&state, &session.user_id, query.account_id).await?;

    let (page, limit) = paging(query.page, query.limit);

    let result = state.store
        .threads_for_accounts(&account_ids, limit, (page - 1) * limit)
        .await?;

    Ok(Json(json!({
        "threads": result.threads,
        "total": result.total,
        "page": page,
        "limit": limit,
    })))
}

pub async fn get_thread(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {

    let not_found = || AppError::NotFound("Thread not found".to_string());

    let thread = state.store.thread(thread_id).await?.ok_or_else(not_found)?;

    owned_account(&state, &session.user_id, thread.account_id)
        .await
        .map_err(|e| match e {
            AppError::NotFound(_) => not_found(),
            e => e,
        })?;

    let emails = state.store.messages_in_thread(thread.id).await?;

    Ok(Json(json!({
        "thread": thread,
        "emails": emails,
    })))
}
