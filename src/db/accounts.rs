use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::crypto::EncryptedSecret;
use crate::email::{Account, NewAccount};

const ACCOUNT_COLUMNS: &str = "id, user_id, email, name, api_key_encrypted, api_key_iv, api_key_tag, is_default, created_at";

#[derive(Clone)]
pub struct AccountQueries {
    pool: PgPool,
}

impl AccountQueries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE email = $1 LIMIT 1;"))
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Option<Account>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE id = $1;"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn for_user(&self, user_id: &str) -> Result<Vec<Account>, anyhow::Error> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE user_id = $1 ORDER BY created_at ASC;"))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    /// The first account a user adds becomes their default.
    pub async fn create(&self, account: NewAccount) -> Result<Account, anyhow::Error> {

        let row = sqlx::query(&format!(
            "INSERT INTO email_accounts (id, user_id, email, name, api_key_encrypted, api_key_iv, api_key_tag, is_default)
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOT EXISTS(SELECT 1 FROM email_accounts WHERE user_id = $2))
             RETURNING {ACCOUNT_COLUMNS};"
        ))
            .bind(Uuid::new_v4())
            .bind(&account.user_id)
            .bind(account.email.to_lowercase())
            .bind(&account.name)
            .bind(&account.api_key.ciphertext)
            .bind(&account.api_key.iv)
            .bind(&account.api_key.tag)
            .fetch_one(&self.pool)
            .await?;

        account_from_row(&row)
    }

    pub async fn set_default(&self, user_id: &str, id: Uuid) -> Result<Option<Account>, anyhow::Error> {

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE email_accounts SET is_default = true WHERE id = $1 AND user_id = $2 RETURNING {ACCOUNT_COLUMNS};"
        ))
            .bind(id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE email_accounts SET is_default = false WHERE user_id = $1 AND id <> $2;")
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        account_from_row(&row).map(Some)
    }

    /// Threads and emails go with the account through `ON DELETE CASCADE`.
    pub async fn delete(&self, id: Uuid) -> Result<bool, anyhow::Error> {

        let mut tx = self.pool.begin().await?;

        let deleted: Option<(String, bool)> = sqlx::query_as(
            "DELETE FROM email_accounts WHERE id = $1 RETURNING user_id, is_default;"
        )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((user_id, was_default)) = deleted else {
            tx.rollback().await?;
            return Ok(false);
        };

        if was_default {
            sqlx::query(
                "UPDATE email_accounts SET is_default = true
                 WHERE id = (SELECT id FROM email_accounts WHERE user_id = $1 ORDER BY created_at ASC LIMIT 1);"
            )
                .bind(&user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, anyhow::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        api_key: EncryptedSecret {
            ciphertext: row.try_get("api_key_encrypted")?,
            iv: row.try_get("api_key_iv")?,
            tag: row.try_get("api_key_tag")?,
        },
        is_default: row.try_get("is_default")?,
        created_at: row.try_get("created_at")?,
    })
}
