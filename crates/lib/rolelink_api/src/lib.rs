//! # rolelink_api
//!
//! HTTP API library for Rolelink.

pub mod config;
pub mod error;
pub mod handlers;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRef;
use axum::routing::{get, post};
use axum_extra::extract::cookie::Key;
use rolelink_core::oauth::{AuthorizationStateStore, OAuthFlow, OAuthSettings};
use rolelink_core::platform::PlatformApi;
use rolelink_core::pusher::{MetadataPusher, PushSettings};
use rolelink_core::role_map::RoleMap;
use rolelink_core::tokens::TokenStore;
use rolelink_core::watcher::{RoleChangeEvent, RoleChangeWatcher};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{health, metadata, oauth};

/// Route paths.
pub mod routes {
    pub const GET_ROOT: &str = "/";
    pub const GET_LINKED_ROLE: &str = "/linked-role";
    pub const GET_LOGIN: &str = "/login";
    pub const GET_OAUTH_CALLBACK: &str = "/discord-oauth-callback";
    pub const POST_UPDATE_METADATA: &str = "/update-metadata";
    pub const POST_ROLE_CHANGE: &str = "/role-change";
}

/// Capacity of the role-change event queue.
const ROLE_EVENT_BUFFER: usize = 256;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// API configuration.
    pub config: ApiConfig,
    pub oauth: Arc<OAuthFlow>,
    pub pusher: Arc<MetadataPusher>,
    /// Sender side of the watcher's event queue.
    pub role_events: mpsc::Sender<RoleChangeEvent>,
    cookie_key: Key,
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Key {
        state.cookie_key.clone()
    }
}

/// Everything the server needs to run: handler state plus the watcher and
/// the receiving end of its queue.
pub struct Services {
    pub state: AppState,
    pub watcher: Arc<RoleChangeWatcher>,
    pub role_events: mpsc::Receiver<RoleChangeEvent>,
}

impl Services {
    /// Wire the engine components around one token store and platform client.
    pub fn build(
        config: ApiConfig,
        store: Arc<dyn TokenStore>,
        platform: Arc<dyn PlatformApi>,
        role_map: Arc<RoleMap>,
    ) -> Self {
        let oauth = Arc::new(OAuthFlow::new(
            OAuthSettings::new(
                config.client_id.clone(),
                config.redirect_uri.clone(),
                config.guild_id.is_some(),
            ),
            Arc::new(AuthorizationStateStore::new()),
            store.clone(),
            platform.clone(),
        ));
        let pusher = Arc::new(MetadataPusher::new(
            store,
            platform,
            role_map,
            PushSettings {
                platform_name: config.platform_name.clone(),
                guild_id: config.guild_id.clone(),
            },
        ));
        let watcher = Arc::new(RoleChangeWatcher::new(pusher.clone()));
        let (tx, rx) = mpsc::channel(ROLE_EVENT_BUFFER);

        let cookie_key = config.cookie_key();
        Self {
            state: AppState {
                config,
                oauth,
                pusher,
                role_events: tx,
                cookie_key,
            },
            watcher,
            role_events: rx,
        }
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(routes::GET_ROOT, get(health::root))
        .route(routes::GET_LINKED_ROLE, get(oauth::linked_role_handler))
        .route(routes::GET_LOGIN, get(oauth::linked_role_handler))
        .route(routes::GET_OAUTH_CALLBACK, get(oauth::oauth_callback_handler))
        .route(
            routes::POST_UPDATE_METADATA,
            post(metadata::update_metadata_handler),
        )
        .route(routes::POST_ROLE_CHANGE, post(metadata::role_change_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
