//! PostgreSQL token store. Tokens are encrypted at rest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{TokenRecord, TokenStore};
use crate::LinkError;
use crate::secrets::TokenCipher;

/// Token store backed by the `discord_tokens` table.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl PgTokenStore {
    pub fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, LinkError> {
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>, Option<String>)>(
            "SELECT access_token, refresh_token, expires_at, username \
             FROM discord_tokens WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((access, refresh, expires_at, username)) = row else {
            return Ok(None);
        };
        Ok(Some(TokenRecord {
            access_token: self.cipher.decrypt(&access)?,
            refresh_token: self.cipher.decrypt(&refresh)?,
            expires_at,
            username,
        }))
    }

    async fn put(&self, user_id: &str, record: TokenRecord) -> Result<(), LinkError> {
        let access = self.cipher.encrypt(&record.access_token)?;
        let refresh = self.cipher.encrypt(&record.refresh_token)?;
        sqlx::query(
            "INSERT INTO discord_tokens (user_id, access_token, refresh_token, expires_at, username) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET \
               access_token = EXCLUDED.access_token, \
               refresh_token = EXCLUDED.refresh_token, \
               expires_at = EXCLUDED.expires_at, \
               username = EXCLUDED.username, \
               updated_at = now()",
        )
        .bind(user_id)
        .bind(access)
        .bind(refresh)
        .bind(record.expires_at)
        .bind(record.username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<(), LinkError> {
        sqlx::query("DELETE FROM discord_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
