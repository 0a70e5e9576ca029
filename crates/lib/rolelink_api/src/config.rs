//! API server configuration.

use std::path::PathBuf;

use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

/// Configuration for the API server.
#[derive(Clone)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3000").
    pub bind_addr: String,
    /// Discord application (client) id.
    pub client_id: String,
    pub client_secret: String,
    /// OAuth2 redirect URI registered with the application.
    pub redirect_uri: String,
    /// Bot token used to register the metadata schema.
    pub bot_token: String,
    /// Guild whose member roles are the source of truth.
    pub guild_id: Option<String>,
    /// Secret the state cookie is signed with.
    pub cookie_secret: String,
    /// Set the `Secure` attribute on cookies.
    pub cookie_secure: bool,
    /// `platform_name` shown on linked profiles.
    pub platform_name: String,
    /// Optional YAML role map; the built-in table is used when unset.
    pub role_map_path: Option<PathBuf>,
    /// PostgreSQL URL; tokens are kept in memory when unset.
    pub database_url: Option<String>,
    /// Passphrase for at-rest token encryption.
    pub token_encryption_key: Option<String>,
}

impl ApiConfig {
    /// Reads configuration from environment variables.
    ///
    /// | Variable                | Default            |
    /// |-------------------------|--------------------|
    /// | `BIND_ADDR`             | `127.0.0.1:3000`   |
    /// | `DISCORD_CLIENT_ID`     | required           |
    /// | `DISCORD_CLIENT_SECRET` | required           |
    /// | `DISCORD_REDIRECT_URI`  | required           |
    /// | `DISCORD_TOKEN`         | required           |
    /// | `DISCORD_GUILD_ID`      | unset              |
    /// | `COOKIE_SECRET`         | required           |
    /// | `COOKIE_SECURE`         | `false`            |
    /// | `PLATFORM_NAME`         | `Rolelink`         |
    /// | `ROLE_MAP_PATH`         | built-in table     |
    /// | `DATABASE_URL`          | unset (in-memory)  |
    /// | `TOKEN_ENCRYPTION_KEY`  | required with DB   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let cookie_secure = match optional("COOKIE_SECURE").as_deref() {
            None | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "COOKIE_SECURE",
                    message: format!("expected true/false, got '{other}'"),
                });
            }
        };

        let cookie_secret = required("COOKIE_SECRET")?;
        if cookie_secret.len() < 16 {
            return Err(ConfigError::Invalid {
                name: "COOKIE_SECRET",
                message: "must be at least 16 characters".into(),
            });
        }

        let database_url = optional("DATABASE_URL");
        let token_encryption_key = optional("TOKEN_ENCRYPTION_KEY");
        if database_url.is_some() && token_encryption_key.is_none() {
            return Err(ConfigError::Missing("TOKEN_ENCRYPTION_KEY"));
        }

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".into()),
            client_id: required("DISCORD_CLIENT_ID")?,
            client_secret: required("DISCORD_CLIENT_SECRET")?,
            redirect_uri: required("DISCORD_REDIRECT_URI")?,
            bot_token: required("DISCORD_TOKEN")?,
            guild_id: optional("DISCORD_GUILD_ID"),
            cookie_secret,
            cookie_secure,
            platform_name: optional("PLATFORM_NAME").unwrap_or_else(|| "Rolelink".into()),
            role_map_path: optional("ROLE_MAP_PATH").map(PathBuf::from),
            database_url,
            token_encryption_key,
        })
    }

    /// Signing key for cookies, stretched from `cookie_secret`.
    pub fn cookie_key(&self) -> Key {
        Key::from(Sha512::digest(self.cookie_secret.as_bytes()).as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DISCORD_CLIENT_ID", "123"),
            ("DISCORD_CLIENT_SECRET", "secret"),
            ("DISCORD_REDIRECT_URI", "http://localhost:3000/discord-oauth-callback"),
            ("DISCORD_TOKEN", "bot-token"),
            ("COOKIE_SECRET", "a-long-enough-cookie-secret"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<ApiConfig, ConfigError> {
        ApiConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_for_optional_values() {
        let config = load(&base()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.platform_name, "Rolelink");
        assert!(!config.cookie_secure);
        assert!(config.guild_id.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn missing_required_value_is_reported_by_name() {
        let mut vars = base();
        vars.remove("DISCORD_CLIENT_SECRET");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Missing("DISCORD_CLIENT_SECRET"))
        ));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut vars = base();
        vars.insert("DISCORD_TOKEN", "  ");
        assert!(matches!(load(&vars), Err(ConfigError::Missing("DISCORD_TOKEN"))));
    }

    #[test]
    fn database_requires_encryption_key() {
        let mut vars = base();
        vars.insert("DATABASE_URL", "postgres://localhost/rolelink");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Missing("TOKEN_ENCRYPTION_KEY"))
        ));
        vars.insert("TOKEN_ENCRYPTION_KEY", "k");
        assert!(load(&vars).is_ok());
    }

    #[test]
    fn short_cookie_secret_is_rejected() {
        let mut vars = base();
        vars.insert("COOKIE_SECRET", "short");
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn cookie_secure_parses_booleans() {
        let mut vars = base();
        vars.insert("COOKIE_SECURE", "true");
        assert!(load(&vars).unwrap().cookie_secure);
        vars.insert("COOKIE_SECURE", "maybe");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn cookie_key_is_stable_for_same_secret() {
        let config = load(&base()).unwrap();
        assert_eq!(config.cookie_key().master(), config.cookie_key().master());
    }
}
