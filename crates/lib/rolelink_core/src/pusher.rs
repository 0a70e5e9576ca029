//! Metadata push: tokens → role vector → role-connection PUT.
//!
//! Pushes for the same user are serialized through a per-user async mutex so
//! that a refresh followed by a push is atomic from that user's point of
//! view. Different users proceed in parallel.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::LinkError;
use crate::platform::{PlatformApi, PlatformError, RoleConnection};
use crate::role_map::{MetadataVector, RoleMap};
use crate::tokens::{self, TokenRecord, TokenStore};

/// Why a push was not attempted. Skips are normal outcomes, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No stored tokens for the user.
    NotAuthorized,
    /// The refresh token was rejected; the user must log in again.
    ReauthorizationRequired,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotAuthorized => f.write_str("not authorized"),
            SkipReason::ReauthorizationRequired => f.write_str("reauthorization required"),
        }
    }
}

/// Outcome of one [`MetadataPusher::sync`].
#[derive(Debug, Clone, PartialEq)]
pub enum PushResult {
    Pushed { vector: MetadataVector },
    Skipped { reason: SkipReason },
    /// The platform rejected the push (or was unreachable, `status: None`).
    Failed { status: Option<u16>, body: String },
}

impl PushResult {
    pub fn skipped(reason: SkipReason) -> Self {
        PushResult::Skipped { reason }
    }

    fn from_platform_error(e: PlatformError) -> Self {
        match e {
            PlatformError::Status { status, body } => PushResult::Failed {
                status: Some(status),
                body,
            },
            other => PushResult::Failed {
                status: None,
                body: other.to_string(),
            },
        }
    }

    pub fn is_pushed(&self) -> bool {
        matches!(self, PushResult::Pushed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PushResult::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PushResult::Failed { .. })
    }

    /// Convert a failed push into [`LinkError::PushFailed`] for callers that
    /// want to propagate it.
    pub fn into_error(self) -> Option<LinkError> {
        match self {
            PushResult::Failed { status, body } => Some(LinkError::PushFailed {
                status: status.unwrap_or(0),
                body,
            }),
            _ => None,
        }
    }
}

/// Fixed identity fields sent with every push.
#[derive(Debug, Clone)]
pub struct PushSettings {
    /// `platform_name` shown on the user's profile.
    pub platform_name: String,
    /// Guild whose member roles feed [`MetadataPusher::sync_from_platform`].
    pub guild_id: Option<String>,
}

/// Where the current roles of a sync come from.
enum RoleSource<'a> {
    Given(&'a HashSet<String>),
    Guild(&'a str),
}

/// Computes and pushes metadata vectors.
pub struct MetadataPusher {
    store: Arc<dyn TokenStore>,
    platform: Arc<dyn PlatformApi>,
    role_map: Arc<RoleMap>,
    settings: PushSettings,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MetadataPusher {
    pub fn new(
        store: Arc<dyn TokenStore>,
        platform: Arc<dyn PlatformApi>,
        role_map: Arc<RoleMap>,
        settings: PushSettings,
    ) -> Self {
        Self {
            store,
            platform,
            role_map,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn role_map(&self) -> &Arc<RoleMap> {
        &self.role_map
    }

    /// Declare the metadata schema to the platform. Full replace; safe to
    /// repeat on every start.
    pub async fn register_schema(&self) -> Result<(), LinkError> {
        self.platform
            .register_metadata(self.role_map.schema())
            .await?;
        info!(
            records = self.role_map.schema().len(),
            "role-connection metadata registered"
        );
        Ok(())
    }

    /// Push the vector for `current_roles`.
    ///
    /// `Err` is reserved for token store failures; platform outcomes are
    /// reported through [`PushResult`].
    pub async fn sync(
        &self,
        user_id: &str,
        current_roles: &HashSet<String>,
    ) -> Result<PushResult, LinkError> {
        self.serialized(user_id, RoleSource::Given(current_roles))
            .await
    }

    /// Read the user's roles from the configured guild, then push.
    pub async fn sync_from_platform(&self, user_id: &str) -> Result<PushResult, LinkError> {
        let guild_id = self
            .settings
            .guild_id
            .as_deref()
            .ok_or_else(|| LinkError::Config("no guild configured for role lookup".into()))?;
        self.serialized(user_id, RoleSource::Guild(guild_id)).await
    }

    async fn serialized(
        &self,
        user_id: &str,
        roles: RoleSource<'_>,
    ) -> Result<PushResult, LinkError> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.sync_locked(user_id, roles).await
        };
        drop(lock);
        self.locks
            .remove_if(user_id, |_, l| Arc::strong_count(l) == 1);

        match &result {
            Ok(PushResult::Pushed { vector }) => {
                info!(user_id, metadata = ?vector, "role connection pushed")
            }
            Ok(PushResult::Skipped { reason }) => {
                info!(user_id, %reason, "role connection push skipped")
            }
            Ok(PushResult::Failed { status, body }) => {
                warn!(user_id, ?status, body = %body, "role connection push failed")
            }
            Err(e) => warn!(user_id, error = %e, "role connection sync error"),
        }
        result
    }

    async fn sync_locked(
        &self,
        user_id: &str,
        roles: RoleSource<'_>,
    ) -> Result<PushResult, LinkError> {
        let Some(mut record) = self.store.get(user_id).await? else {
            return Ok(PushResult::skipped(SkipReason::NotAuthorized));
        };

        let mut refreshed = false;
        if record.is_expired() {
            debug!(user_id, "access token expired, refreshing");
            match self.refresh(user_id, &record).await? {
                Ok(r) => {
                    record = r;
                    refreshed = true;
                }
                Err(result) => return Ok(result),
            }
        }

        let fetched;
        let current_roles = match roles {
            RoleSource::Given(roles) => roles,
            RoleSource::Guild(guild_id) => {
                match self
                    .platform
                    .guild_member_roles(&record.access_token, guild_id)
                    .await
                {
                    Ok(roles) => {
                        fetched = roles.unwrap_or_default();
                        &fetched
                    }
                    Err(e) => return Ok(PushResult::from_platform_error(e)),
                }
            }
        };

        let vector = self.role_map.compute_vector(current_roles);
        let connection = RoleConnection {
            platform_name: self.settings.platform_name.clone(),
            platform_username: record.username.clone(),
            platform_id: user_id.to_string(),
            metadata: vector.clone(),
        };

        match self
            .platform
            .push_role_connection(&record.access_token, &connection)
            .await
        {
            Ok(()) => Ok(PushResult::Pushed { vector }),
            Err(PlatformError::Status { status: 401, .. }) if !refreshed => {
                debug!(user_id, "push unauthorized, refreshing once and retrying");
                let record = match self.refresh(user_id, &record).await? {
                    Ok(r) => r,
                    Err(result) => return Ok(result),
                };
                match self
                    .platform
                    .push_role_connection(&record.access_token, &connection)
                    .await
                {
                    Ok(()) => Ok(PushResult::Pushed { vector }),
                    Err(e) => Ok(PushResult::from_platform_error(e)),
                }
            }
            Err(e) => Ok(PushResult::from_platform_error(e)),
        }
    }

    /// Outer `Err`: store failure. Inner `Err`: the sync ends with that result.
    async fn refresh(
        &self,
        user_id: &str,
        record: &TokenRecord,
    ) -> Result<Result<TokenRecord, PushResult>, LinkError> {
        match tokens::refresh(self.store.as_ref(), self.platform.as_ref(), user_id, record).await {
            Ok(r) => Ok(Ok(r)),
            Err(LinkError::RefreshFailed(_)) => {
                Ok(Err(PushResult::skipped(SkipReason::ReauthorizationRequired)))
            }
            Err(LinkError::Platform(e)) => Ok(Err(PushResult::from_platform_error(e))),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::platform::fake::{FakePlatform, RefreshMode};
    use crate::role_map::{MetadataField, MetadataKind, RoleMapping};
    use crate::tokens::MemoryTokenStore;

    fn abc_map() -> Arc<RoleMap> {
        let field = |k: &str| MetadataField {
            key: k.into(),
            name: k.into(),
            description: format!("{k} flag"),
            kind: MetadataKind::BooleanEqual,
        };
        let map = |s: &str, t: &str| RoleMapping {
            source: s.into(),
            target: t.into(),
        };
        Arc::new(
            RoleMap::new(
                vec![map("A", "x"), map("B", "x"), map("C", "y")],
                vec![field("x"), field("y")],
            )
            .unwrap(),
        )
    }

    fn roles(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn record(access: &str, expired: bool) -> TokenRecord {
        let offset = chrono::Duration::hours(1);
        TokenRecord {
            access_token: access.into(),
            refresh_token: "refresh-0".into(),
            expires_at: if expired {
                Utc::now() - offset
            } else {
                Utc::now() + offset
            },
            username: Some("alice".into()),
        }
    }

    struct Harness {
        pusher: Arc<MetadataPusher>,
        store: Arc<MemoryTokenStore>,
        platform: Arc<FakePlatform>,
    }

    fn harness_with(platform: FakePlatform) -> Harness {
        let store = Arc::new(MemoryTokenStore::new());
        let platform = Arc::new(platform);
        let pusher = Arc::new(MetadataPusher::new(
            store.clone(),
            platform.clone(),
            abc_map(),
            PushSettings {
                platform_name: "Rolelink".into(),
                guild_id: Some("guild-1".into()),
            },
        ));
        Harness {
            pusher,
            store,
            platform,
        }
    }

    fn harness() -> Harness {
        harness_with(FakePlatform::new())
    }

    #[tokio::test]
    async fn missing_record_is_skipped_not_failed() {
        let h = harness();
        let result = h.pusher.sync("nobody", &roles(&["A"])).await.unwrap();
        assert_eq!(result, PushResult::skipped(SkipReason::NotAuthorized));
        assert_eq!(h.platform.push_count(), 0);
    }

    #[tokio::test]
    async fn pushes_full_vector_with_identity_fields() {
        let h = harness();
        h.store.put("u1", record("live", false)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        let PushResult::Pushed { vector } = result else {
            panic!("expected push, got {result:?}");
        };
        assert_eq!(vector.get("x"), Some(1));
        assert_eq!(vector.get("y"), Some(0));

        let pushed = h.platform.pushed();
        assert_eq!(pushed.len(), 1);
        let (token, body) = &pushed[0];
        assert_eq!(token, "live");
        assert_eq!(body.platform_name, "Rolelink");
        assert_eq!(body.platform_id, "u1");
        assert_eq!(body.platform_username.as_deref(), Some("alice"));
        assert_eq!(body.metadata, vector);
    }

    #[tokio::test]
    async fn empty_roles_clear_every_flag() {
        let h = harness();
        h.store.put("u1", record("live", false)).await.unwrap();
        let result = h.pusher.sync("u1", &roles(&[])).await.unwrap();
        let PushResult::Pushed { vector } = result else {
            panic!("expected push");
        };
        assert_eq!(vector.get("x"), Some(0));
        assert_eq!(vector.get("y"), Some(0));
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let h = harness();
        h.store.put("u1", record("live", false)).await.unwrap();
        let held = roles(&["B", "C"]);

        let first = h.pusher.sync("u1", &held).await.unwrap();
        let second = h.pusher.sync("u1", &held).await.unwrap();

        assert_eq!(first, second);
        let pushed = h.platform.pushed();
        assert_eq!(pushed[0].1, pushed[1].1);
    }

    #[tokio::test]
    async fn expired_token_refreshes_once_then_pushes() {
        let h = harness();
        h.store.put("u1", record("stale", true)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["C"])).await.unwrap();

        assert!(result.is_pushed());
        assert_eq!(h.platform.refresh_count(), 1);
        let pushed = h.platform.pushed();
        assert_eq!(pushed.len(), 1);
        assert_ne!(pushed[0].0, "stale");
        let stored = h.store.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, pushed[0].0);
    }

    #[tokio::test]
    async fn rejected_refresh_removes_record_and_skips() {
        let h = harness();
        h.platform.set_refresh_mode(RefreshMode::Reject);
        h.store.put("u1", record("stale", true)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        assert_eq!(
            result,
            PushResult::skipped(SkipReason::ReauthorizationRequired)
        );
        assert_eq!(h.platform.refresh_count(), 1);
        assert_eq!(h.platform.push_count(), 0);
        assert!(h.store.get("u1").await.unwrap().is_none());

        // Subsequent syncs report the user as simply not authorized.
        let again = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();
        assert_eq!(again, PushResult::skipped(SkipReason::NotAuthorized));
    }

    #[tokio::test]
    async fn platform_rejection_is_failed_not_retried() {
        let h = harness();
        h.platform.script_pushes(&[400]);
        h.store.put("u1", record("live", false)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        assert!(matches!(
            result,
            PushResult::Failed {
                status: Some(400),
                ..
            }
        ));
        assert_eq!(h.platform.push_count(), 1);
        assert_eq!(h.platform.refresh_count(), 0);
        assert!(matches!(
            result.into_error(),
            Some(LinkError::PushFailed { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn unauthorized_push_refreshes_and_retries_exactly_once() {
        let h = harness();
        h.platform.script_pushes(&[401, 401]);
        h.store.put("u1", record("revoked", false)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        assert!(matches!(
            result,
            PushResult::Failed {
                status: Some(401),
                ..
            }
        ));
        assert_eq!(h.platform.refresh_count(), 1);
        assert_eq!(h.platform.push_count(), 2);
    }

    #[tokio::test]
    async fn unauthorized_push_succeeds_after_refresh() {
        let h = harness();
        h.platform.script_pushes(&[401]);
        h.store.put("u1", record("revoked", false)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        assert!(result.is_pushed());
        let pushed = h.platform.pushed();
        assert_eq!(pushed[0].0, "revoked");
        assert_ne!(pushed[1].0, "revoked");
    }

    #[tokio::test]
    async fn refreshed_token_is_not_refreshed_again_on_401() {
        let h = harness();
        h.platform.script_pushes(&[401]);
        h.store.put("u1", record("stale", true)).await.unwrap();

        let result = h.pusher.sync("u1", &roles(&["A"])).await.unwrap();

        assert!(result.is_failed());
        assert_eq!(h.platform.refresh_count(), 1);
        assert_eq!(h.platform.push_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_syncs_for_one_user_share_a_single_refresh() {
        let h = harness_with(FakePlatform::new().with_refresh_delay(Duration::from_millis(50)));
        h.store.put("u1", record("stale", true)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pusher = h.pusher.clone();
            tasks.push(tokio::spawn(async move {
                pusher.sync("u1", &roles(&["A"])).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_pushed());
        }

        // Serialized: the first sync refreshes, the rest see a fresh record.
        assert_eq!(h.platform.refresh_count(), 1);
        let pushed = h.platform.pushed();
        assert_eq!(pushed.len(), 4);
        assert!(pushed.iter().all(|(token, _)| token != "stale"));
        assert!(h.pusher.locks.is_empty());
    }

    #[tokio::test]
    async fn sync_from_platform_uses_guild_roles() {
        let h = harness();
        *h.platform.guild_roles.lock().unwrap() = Some(roles(&["C", "unrelated"]));
        h.store.put("u1", record("live", false)).await.unwrap();

        let result = h.pusher.sync_from_platform("u1").await.unwrap();

        let PushResult::Pushed { vector } = result else {
            panic!("expected push");
        };
        assert_eq!(vector.get("x"), Some(0));
        assert_eq!(vector.get("y"), Some(1));
    }

    #[tokio::test]
    async fn non_member_gets_cleared_vector() {
        let h = harness();
        *h.platform.guild_roles.lock().unwrap() = None;
        h.store.put("u1", record("live", false)).await.unwrap();

        let result = h.pusher.sync_from_platform("u1").await.unwrap();
        let PushResult::Pushed { vector } = result else {
            panic!("expected push");
        };
        assert!(vector.iter().all(|(_, v)| *v == 0));
    }

    #[tokio::test]
    async fn register_schema_sends_role_map_schema() {
        let h = harness();
        h.pusher.register_schema().await.unwrap();
        h.pusher.register_schema().await.unwrap();
        assert_eq!(
            h.platform
                .register_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }
}
