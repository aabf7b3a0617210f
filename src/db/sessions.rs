use sqlx::postgres::PgPool;

/// Read-only view of the auth service's session table.
#[derive(Clone)]
pub struct SessionQueries {
    pool: PgPool,
}

impl SessionQueries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn user_for_token(&self, token: &str) -> Result<Option<String>, anyhow::Error> {
        let user_id: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM sessions WHERE token = $1 AND expires_at > now();"
        )
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user_id)
    }
}
