//! Discord REST client for the linked-roles wire contract.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PlatformApi, PlatformError, PlatformUser, RoleConnection, TokenGrant};
use crate::role_map::MetadataField;

/// Default Discord API base.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application credentials and endpoint settings.
#[derive(Debug, Clone)]
pub struct DiscordSettings {
    /// API base URL without trailing slash.
    pub api_base: String,
    /// OAuth2 application (client) id.
    pub client_id: String,
    pub client_secret: String,
    /// Bot token, used only for metadata schema registration.
    pub bot_token: String,
    pub timeout: Duration,
}

/// Wire shape of one metadata record.
#[derive(Debug, Serialize)]
struct MetadataRecordBody<'a> {
    key: &'a str,
    name: &'a str,
    description: &'a str,
    #[serde(rename = "type")]
    kind: u8,
}

/// Subset of a guild member object.
#[derive(Debug, Deserialize)]
struct GuildMemberBody {
    roles: Vec<String>,
}

/// Discord implementation of [`PlatformApi`].
#[derive(Clone)]
pub struct DiscordClient {
    settings: DiscordSettings,
    http: Client,
}

impl DiscordClient {
    pub fn new(settings: DiscordSettings) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| PlatformError::Transport(format!("HTTP client init failed: {e}")))?;
        Ok(Self { settings, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.api_base.trim_end_matches('/'))
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, PlatformError> {
        let resp = send(self.http.post(self.url("/oauth2/token")).form(params)).await?;
        resp.json::<TokenGrant>()
            .await
            .map_err(|e| PlatformError::Decode(format!("token response: {e}")))
    }
}

/// Send a request and turn non-2xx answers into [`PlatformError::Status`].
async fn send(request: RequestBuilder) -> Result<Response, PlatformError> {
    let resp = request
        .send()
        .await
        .map_err(|e| PlatformError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(PlatformError::Status { status, body });
    }
    Ok(resp)
}

#[async_trait]
impl PlatformApi for DiscordClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, PlatformError> {
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        self.token_request(&params).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&params).await
    }

    async fn current_user(&self, access_token: &str) -> Result<PlatformUser, PlatformError> {
        let resp = send(self.http.get(self.url("/users/@me")).bearer_auth(access_token)).await?;
        resp.json::<PlatformUser>()
            .await
            .map_err(|e| PlatformError::Decode(format!("user response: {e}")))
    }

    async fn guild_member_roles(
        &self,
        access_token: &str,
        guild_id: &str,
    ) -> Result<Option<HashSet<String>>, PlatformError> {
        let url = self.url(&format!("/users/@me/guilds/{guild_id}/member"));
        let resp = match send(self.http.get(url).bearer_auth(access_token)).await {
            Ok(resp) => resp,
            Err(PlatformError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                debug!(guild_id, "user is not a guild member");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let member = resp
            .json::<GuildMemberBody>()
            .await
            .map_err(|e| PlatformError::Decode(format!("guild member response: {e}")))?;
        Ok(Some(member.roles.into_iter().collect()))
    }

    async fn register_metadata(&self, schema: &[MetadataField]) -> Result<(), PlatformError> {
        let body: Vec<MetadataRecordBody<'_>> = schema
            .iter()
            .map(|f| MetadataRecordBody {
                key: &f.key,
                name: &f.name,
                description: &f.description,
                kind: f.kind.code(),
            })
            .collect();
        let url = self.url(&format!(
            "/applications/{}/role-connections/metadata",
            self.settings.client_id
        ));
        send(
            self.http
                .put(url)
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bot {}", self.settings.bot_token),
                )
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn push_role_connection(
        &self,
        access_token: &str,
        connection: &RoleConnection,
    ) -> Result<(), PlatformError> {
        let url = self.url(&format!(
            "/users/@me/applications/{}/role-connection",
            self.settings.client_id
        ));
        send(self.http.put(url).bearer_auth(access_token).json(connection)).await?;
        Ok(())
    }
}
