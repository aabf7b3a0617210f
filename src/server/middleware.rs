use axum::{
    body::Body,
    extract::State,
    http::{
        Request,
        header::AUTHORIZATION
    },
    response::Response,
    middleware::Next,
};

use std::sync::Arc;

use crate::AppState;
use crate::error::AppError;

/// The authenticated user, inserted into request extensions by
/// [`authenticate_user`].
#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: String,
}

pub async fn authenticate_user(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {

    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(extract_token)
        .ok_or(AppError::Unauthorized)?;

    let user_id = state.store
        .session_user(token)
        .await?
        .ok_or(AppError::Unauthorized)?;

    req.extensions_mut().insert(Session { user_id });

    Ok(next.run(req).await)
}

pub fn extract_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_tokens_only() {
        assert_eq!(extract_token("Bearer abc "), Some("abc"));
        assert_eq!(extract_token("Basic abc"), None);
        assert_eq!(extract_token("Bearer   "), None);
    }
}
