//! OAuth2 authorization-code flow with CSRF-safe state verification.
//!
//! `begin_authorization` issues a single-use nonce (the `state` parameter)
//! that the HTTP layer also binds to the browser through a signed cookie.
//! `complete_authorization` accepts the callback only when the query `state`
//! equals the cookie value and names an unexpired, unconsumed nonce.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use crate::LinkError;
use crate::platform::{PlatformApi, PlatformUser};
use crate::tokens::{TokenRecord, TokenStore};

/// TTL for authorization state entries (5 minutes).
pub const STATE_TTL: Duration = Duration::from_secs(300);

/// Default platform authorization endpoint.
pub const DEFAULT_AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";

/// Scope for writing role-connection metadata.
pub const SCOPE_ROLE_CONNECTIONS_WRITE: &str = "role_connections.write";
/// Scope for reading the user's identity.
pub const SCOPE_IDENTIFY: &str = "identify";
/// Scope for reading the user's guild membership.
pub const SCOPE_GUILD_MEMBERS_READ: &str = "guilds.members.read";

// =============================================================================
// State
// =============================================================================

/// Generate a cryptographic state parameter (CSRF nonce).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A pending authorization, keyed by its nonce.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationState {
    pub created_at: Instant,
}

/// In-memory store of issued, not yet consumed nonces.
pub struct AuthorizationStateStore {
    states: DashMap<String, AuthorizationState>,
    ttl: Duration,
}

impl AuthorizationStateStore {
    pub fn new() -> Self {
        Self::with_ttl(STATE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, nonce: String, state: AuthorizationState) {
        self.states.insert(nonce, state);
    }

    /// Consume a nonce. Returns `false` if unknown, already used, or expired.
    pub fn take(&self, nonce: &str) -> bool {
        match self.states.remove(nonce) {
            Some((_, state)) => state.created_at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Evict expired entries.
    pub fn cleanup(&self) {
        let ttl = self.ttl;
        self.states.retain(|_, s| s.created_at.elapsed() < ttl);
    }

    /// Spawn a periodic cleanup task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                store.cleanup();
            }
        })
    }
}

impl Default for AuthorizationStateStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Flow
// =============================================================================

/// Client-side OAuth2 settings.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub scopes: Vec<String>,
}

impl OAuthSettings {
    /// Settings with the default endpoint and the scopes the engine needs.
    ///
    /// `guilds.members.read` is requested only when roles are read from a guild.
    pub fn new(client_id: String, redirect_uri: String, read_guild_roles: bool) -> Self {
        let mut scopes = vec![
            SCOPE_ROLE_CONNECTIONS_WRITE.to_string(),
            SCOPE_IDENTIFY.to_string(),
        ];
        if read_guild_roles {
            scopes.push(SCOPE_GUILD_MEMBERS_READ.to_string());
        }
        Self {
            client_id,
            redirect_uri,
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            scopes,
        }
    }
}

/// Redirect target plus the nonce to bind to the browser.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Outcome of a completed authorization.
#[derive(Debug, Clone)]
pub struct LinkedAccount {
    pub user: PlatformUser,
    pub record: TokenRecord,
}

/// Drives authorize → callback → token exchange.
pub struct OAuthFlow {
    settings: OAuthSettings,
    states: Arc<AuthorizationStateStore>,
    store: Arc<dyn TokenStore>,
    platform: Arc<dyn PlatformApi>,
}

impl OAuthFlow {
    pub fn new(
        settings: OAuthSettings,
        states: Arc<AuthorizationStateStore>,
        store: Arc<dyn TokenStore>,
        platform: Arc<dyn PlatformApi>,
    ) -> Self {
        Self {
            settings,
            states,
            store,
            platform,
        }
    }

    pub fn states(&self) -> &Arc<AuthorizationStateStore> {
        &self.states
    }

    /// Issue a nonce and build the authorization URL embedding it.
    pub fn begin_authorization(&self) -> Result<AuthorizationRequest, LinkError> {
        let state = generate_state();
        let mut url = Url::parse(&self.settings.authorize_url)
            .map_err(|e| LinkError::Config(format!("invalid authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", &state)
            .append_pair("scope", &self.settings.scopes.join(" "))
            .append_pair("prompt", "consent");

        self.states.insert(
            state.clone(),
            AuthorizationState {
                created_at: Instant::now(),
            },
        );
        debug!(pending = self.states.len(), "authorization state issued");

        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// Verify the callback state, exchange the code, and store the tokens.
    ///
    /// `cookie_state` is the nonce read from the signed cookie, if present.
    /// Any state failure returns [`LinkError::StateMismatch`] before any
    /// network call is made.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        cookie_state: Option<&str>,
    ) -> Result<LinkedAccount, LinkError> {
        let Some(cookie_state) = cookie_state else {
            warn!("callback without state cookie");
            return Err(LinkError::StateMismatch);
        };
        if !constant_time_eq(state, cookie_state) {
            warn!("callback state does not match cookie");
            return Err(LinkError::StateMismatch);
        }
        if !self.states.take(state) {
            warn!("callback state unknown, consumed, or expired");
            return Err(LinkError::StateMismatch);
        }

        let grant = self
            .platform
            .exchange_code(code, &self.settings.redirect_uri)
            .await
            .map_err(|e| LinkError::TokenExchangeFailed(e.to_string()))?;

        let user = self
            .platform
            .current_user(&grant.access_token)
            .await
            .map_err(|e| LinkError::TokenExchangeFailed(format!("identity fetch: {e}")))?;

        let record = TokenRecord::from_grant(grant, None, Some(user.username.clone()), Utc::now())
            .ok_or_else(|| LinkError::TokenExchangeFailed("grant without refresh token".into()))?;
        self.store.put(&user.id, record.clone()).await?;

        info!(user_id = %user.id, "account linked");
        Ok(LinkedAccount { user, record })
    }
}

// =============================================================================
// Tests
// =============================================================================
