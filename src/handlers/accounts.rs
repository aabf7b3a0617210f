use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::email::{Account, NewAccount};
use crate::email::parse::bare_address;
use crate::error::AppError;
use crate::server::middleware::Session;

use super::owned_account;

pub async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, AppError> {

    let accounts = state.store.accounts_for_user(&session.user_id).await?;

    Ok(Json(json!({
        "accounts": accounts,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccount {
    pub email: String,
    pub name: String,
    pub api_key: String,
}

pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Json(payload): Json<CreateAccount>,
) -> Result<(StatusCode, Json<Account>), AppError> {

    let email = bare_address(&payload.email);
    if !email.contains('@') {
        return Err(AppError::BadRequest("Invalid email address".to_string()));
    }

    let api_key = payload.api_key.trim();
    if api_key.is_empty() {
        return Err(AppError::BadRequest("API key is required".to_string()));
    }

    if state.store.account_by_email(&email).await?.is_some() {
        return Err(AppError::Conflict("Account already exists".to_string()));
    }

    let encrypted = state.cipher
        .encrypt(api_key)
        .map_err(|e| AppError::Database(anyhow::anyhow!(e)))?;

    let name = match payload.name.trim() {
        "" => email.clone(),
        name => name.to_string(),
    };

    let account = state.store.create_account(NewAccount {
        user_id: session.user_id,
        email,
        name,
        api_key: encrypted,
    }).await?;

    info!(account_id = %account.id, "Account created");

    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccount {
    pub is_default: Option<bool>,
}

/// Only promotion is accepted. Clearing the flag would leave the user with
/// no default, so `isDefault: false` is rejected.
pub async fn update_account(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAccount>,
) -> Result<Json<Account>, AppError> {

    let account = owned_account(&state, &session.user_id, id).await?;

    match payload.is_default {
        None => Ok(Json(account)),
        Some(false) => Err(AppError::BadRequest("Make another account the default instead".to_string())),
        Some(true) => {
            let account = state.store
                .set_default_account(&session.user_id, id)
                .await?
                .ok_or_else(|| AppError::NotFound("Account not found".to_string()))?;

            info!(account_id = %account.id, "Default account changed");
            Ok(Json(account))
        }
    }
}

pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {

    owned_account(&state, &session.user_id, id).await?;

    if !state.store.delete_account(id).await? {
        return Err(AppError::NotFound("Account not found".to_string()));
    }

    info!(account_id = %id, "Account deleted");

    Ok(Json(json!({ "ok": true })))
}
