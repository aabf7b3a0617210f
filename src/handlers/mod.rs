pub mod accounts;
pub mod threads;
pub mod emails;

use uuid::Uuid;

use crate::AppState;
use crate::email::Account;
use crate::error::AppError;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 100;

/// `(page, limit)` with pages counted from 1.
pub fn paging(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    (page.unwrap_or(1).max(1), limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT))
}

/// Loads an account only if it belongs to `user_id`. Anything else is a 404
/// so other users' ids are not confirmed to exist.
pub async fn owned_account(
    state: &AppState,
    user_id: &str,
    account_id: Uuid,
) -> Result<Account, AppError> {

    state.store
        .account_by_id(account_id)
        .await?
        .filter(|account| account.user_id == user_id)
        .ok_or_else(|| AppError::NotFound("Account not found".to_string()))
}

/// One owned account when `account_id` is given, else all of the user's.
pub async fn account_scope(
    state: &AppState,
    user_id: &str,
    account_id: Option<Uuid>,
) -> Result<Vec<Uuid>, AppError> {

    match account_id {
        Some(id) => Ok(vec![owned_account(state, user_id, id).await?.id]),
        None => Ok(state.store
            .accounts_for_user(user_id)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect()),
    }
}
