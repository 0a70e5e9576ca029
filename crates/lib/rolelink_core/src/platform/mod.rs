//! Platform (Discord) API boundary.
//!
//! [`PlatformApi`] is the only seam through which the engine talks to the
//! platform; [`discord::DiscordClient`] is the production implementation.

pub mod discord;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::role_map::{MetadataField, MetadataVector};

/// Platform call errors.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Platform request failed: {0}")]
    Transport(String),

    #[error("Platform returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Platform response parse error: {0}")]
    Decode(String),
}

impl PlatformError {
    /// HTTP status of a rejected request, if the platform answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            PlatformError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the platform rejected the request as a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s))
    }
}

/// Response from the OAuth2 token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// The authenticated platform user (`GET /users/@me`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
}

/// Body of a role-connection push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleConnection {
    pub platform_name: String,
    pub platform_username: Option<String>,
    pub platform_id: String,
    pub metadata: MetadataVector,
}

/// Calls the engine makes against the platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// `POST /oauth2/token` with `grant_type=authorization_code`.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, PlatformError>;

    /// `POST /oauth2/token` with `grant_type=refresh_token`.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError>;

    /// `GET /users/@me` with the user's bearer token.
    async fn current_user(&self, access_token: &str) -> Result<PlatformUser, PlatformError>;

    /// Role ids the user holds in `guild_id`; `None` when not a member.
    async fn guild_member_roles(
        &self,
        access_token: &str,
        guild_id: &str,
    ) -> Result<Option<HashSet<String>>, PlatformError>;

    /// `PUT /applications/{id}/role-connections/metadata` (full replace).
    async fn register_metadata(&self, schema: &[MetadataField]) -> Result<(), PlatformError>;

    /// `PUT /users/@me/applications/{id}/role-connection`.
    async fn push_role_connection(
        &self,
        access_token: &str,
        connection: &RoleConnection,
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
pub(crate) mod fake;
