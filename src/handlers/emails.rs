use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;
use crate::db::MessageFilter;
use crate::email::{Direction, Message, MessageStatus};
use crate::email::classify::{ClassificationJob, ClassifyRequest};
use crate::email::send::SendRequest;
use crate::error::AppError;
use crate::server::middleware::Session;

use super::{account_scope, owned_account, paging};

async fn owned_message(
    state: &AppState,
    user_id: &str,
    id: Uuid,
) -> Result<Message, AppError> {

    let not_found = || AppError::NotFound("Email not found".to_string());

    let message = state.store.message(id).await?.ok_or_else(not_found)?;

    match owned_account(state, user_id, message.account_id).await {
        Ok(_) => Ok(message),
        Err(AppError::NotFound(_)) => Err(not_found()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailQuery {
    pub account_id: Option<Uuid>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub direction: Option<Direction>,
    pub status: Option<MessageStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_emails(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<Value>, AppError> {

    let account_ids = account_scope(&state, &session.user_id, query.account_id).await?;
    let (page, limit) = paging(query.page, query.limit);

    if account_ids.is_empty() {
        return Ok(Json(json!({
            "emails": [],
            "total": 0,
            "page": page,
            "limit": limit,
        })));
    }

    let filter = MessageFilter {
        account_ids,
        is_read: query.is_read,
        is_starred: query.is_starred,
        direction: query.direction,
        status: query.status,
    };

    let result = state.store
        .messages_page(&filter, limit, (page - 1) * limit)
        .await?;

    Ok(Json(json!({
        "emails": result.messages,
        "total": result.total,
        "page": page,
        "limit": limit,
    })))
}

pub async fn get_email(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> Result<Json<Message>, AppError> {

    let message = owned_message(&state, &session.user_id, id).await?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEmail {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
}

pub async fn update_email(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateEmail>,
) -> Result<Json<Message>, AppError> {

    owned_message(&state, &session.user_id, id).await?;

    let message = state.store
        .set_message_flags(id, payload.is_read, payload.is_starred)
        .await?
        .ok_or_else(|| AppError::NotFound("Email not found".to_string()))?;

    Ok(Json(message))
}

pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(payload): Json<SendRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {

    if payload.to.is_empty() {
        return Err(AppError::BadRequest("At least one recipient is required".to_string()));
    }

    let account = owned_account(&state, &session.user_id, payload.account_id).await?;

    let message = state.outbox.send(&account, payload).await?;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn classify_email(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), AppError> {

    let message = owned_message(&state, &session.user_id, id).await?;

    let Some(dispatcher) = &state.classifier else {
        return Err(AppError::Unavailable("Classification is disabled".to_string()));
    };

    let job = ClassificationJob {
        message_id: message.id,
        thread_id: message.thread_id,
        request: ClassifyRequest::new(
            &message.from,
            &message.subject,
            message.body_text.as_deref(),
            message.body_html.as_deref(),
        ),
    };

    if !dispatcher.dispatch(job) {
        return Err(AppError::Unavailable("Classification queue is full".to_string()));
    }

    Ok((StatusCode::ACCEPTED, Json(json!({
        "ok": true,
        "emailId": message.id,
    }))))
}
