//! Per-user OAuth2 credential storage and lifecycle.
//!
//! A missing record means "not authorized". Records are created by the OAuth
//! callback, replaced wholesale on refresh, and removed only when the
//! platform rejects the refresh token.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::LinkError;
use crate::platform::{PlatformApi, PlatformError, TokenGrant};

pub use memory::MemoryTokenStore;
pub use postgres::PgTokenStore;

/// Stored credentials for one platform user.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of `access_token`.
    pub expires_at: DateTime<Utc>,
    /// Platform username, sent as `platform_username` on pushes.
    pub username: Option<String>,
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("username", &self.username)
            .finish()
    }
}

impl TokenRecord {
    /// Build a record from a token grant.
    ///
    /// `fallback_refresh` is kept when the grant carries no new refresh token.
    pub fn from_grant(
        grant: TokenGrant,
        fallback_refresh: Option<&str>,
        username: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let refresh_token = grant
            .refresh_token
            .or_else(|| fallback_refresh.map(str::to_string))?;
        Some(Self {
            access_token: grant.access_token,
            refresh_token,
            expires_at: now + Duration::seconds(grant.expires_in),
            username,
        })
    }

    /// True when the access token has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Durable per-user token storage. Implementations must be safe for
/// concurrent use across users.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, LinkError>;

    /// Upsert, replacing any existing record wholesale.
    async fn put(&self, user_id: &str, record: TokenRecord) -> Result<(), LinkError>;

    async fn remove(&self, user_id: &str) -> Result<(), LinkError>;
}

/// Refresh `record` through the platform and store the result.
///
/// A 4xx answer means the refresh token is revoked or expired: the record is
/// removed and [`LinkError::RefreshFailed`] returned. Transport errors and
/// 5xx answers return [`LinkError::Platform`] and leave the record in place.
pub async fn refresh(
    store: &dyn TokenStore,
    platform: &dyn PlatformApi,
    user_id: &str,
    record: &TokenRecord,
) -> Result<TokenRecord, LinkError> {
    match platform.refresh_token(&record.refresh_token).await {
        Ok(grant) => {
            let refreshed = TokenRecord::from_grant(
                grant,
                Some(&record.refresh_token),
                record.username.clone(),
                Utc::now(),
            )
            .ok_or_else(|| LinkError::RefreshFailed("grant without refresh token".into()))?;
            store.put(user_id, refreshed.clone()).await?;
            info!(user_id, expires_at = %refreshed.expires_at, "access token refreshed");
            Ok(refreshed)
        }
        Err(e @ PlatformError::Status { .. }) if e.is_client_error() => {
            warn!(user_id, error = %e, "refresh token rejected, removing stored tokens");
            store.remove(user_id).await?;
            Err(LinkError::RefreshFailed(e.to_string()))
        }
        Err(e) => Err(LinkError::Platform(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakePlatform, RefreshMode};

    fn record(expires_at: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
            expires_at,
            username: Some("alice".into()),
        }
    }

    fn grant(refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: "new-access".into(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            refresh_token: refresh.map(str::to_string),
            scope: None,
        }
    }

    #[test]
    fn expired_at_exact_expiry_instant() {
        let now = Utc::now();
        let r = record(now);
        assert!(r.is_expired_at(now));
        assert!(!r.is_expired_at(now - Duration::seconds(1)));
    }

    #[test]
    fn fresh_record_is_not_expired() {
        assert!(!record(Utc::now() + Duration::hours(1)).is_expired());
        assert!(record(Utc::now() - Duration::hours(1)).is_expired());
    }

    #[test]
    fn from_grant_computes_absolute_expiry() {
        let now = Utc::now();
        let r = TokenRecord::from_grant(grant(Some("r")), None, None, now).unwrap();
        assert_eq!(r.expires_at, now + Duration::seconds(3600));
        assert_eq!(r.refresh_token, "r");
    }

    #[test]
    fn from_grant_keeps_fallback_refresh_token() {
        let r = TokenRecord::from_grant(grant(None), Some("kept"), None, Utc::now()).unwrap();
        assert_eq!(r.refresh_token, "kept");
        assert!(TokenRecord::from_grant(grant(None), None, None, Utc::now()).is_none());
    }

    #[test]
    fn debug_redacts_tokens() {
        let out = format!("{:?}", record(Utc::now()));
        assert!(!out.contains("old-access"));
        assert!(!out.contains("old-refresh"));
    }

    #[tokio::test]
    async fn refresh_replaces_stored_record() {
        let store = MemoryTokenStore::new();
        let platform = FakePlatform::new();
        let old = record(Utc::now() - Duration::minutes(1));
        store.put("u1", old.clone()).await.unwrap();

        let fresh = refresh(&store, &platform, "u1", &old).await.unwrap();
        assert_ne!(fresh.access_token, old.access_token);
        assert!(!fresh.is_expired());
        assert_eq!(fresh.username.as_deref(), Some("alice"));
        assert_eq!(store.get("u1").await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn rejected_refresh_removes_record() {
        let store = MemoryTokenStore::new();
        let platform = FakePlatform::new();
        platform.set_refresh_mode(RefreshMode::Reject);
        let old = record(Utc::now() - Duration::minutes(1));
        store.put("u1", old.clone()).await.unwrap();

        let err = refresh(&store, &platform, "u1", &old).await.unwrap_err();
        assert!(matches!(err, LinkError::RefreshFailed(_)));
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_platform_keeps_record() {
        let store = MemoryTokenStore::new();
        let platform = FakePlatform::new();
        platform.set_refresh_mode(RefreshMode::Unavailable);
        let old = record(Utc::now() - Duration::minutes(1));
        store.put("u1", old.clone()).await.unwrap();

        let err = refresh(&store, &platform, "u1", &old).await.unwrap_err();
        assert!(matches!(err, LinkError::Platform(_)));
        assert_eq!(store.get("u1").await.unwrap(), Some(old));
    }
}
