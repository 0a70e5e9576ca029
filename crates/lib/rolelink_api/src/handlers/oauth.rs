//! Linked-role OAuth2 endpoints.

use axum::extract::{Query, State};
use axum::response::Redirect;
use axum_extra::extract::SignedCookieJar;
use rolelink_core::LinkError;
use serde::Deserialize;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::services::cookies::{STATE_COOKIE, clear_state_cookie, state_cookie};

/// Page shown after a successful link.
pub const SUCCESS_PAGE: &str = "You did it!  Now go back to Discord.";

/// Query parameters of the OAuth callback.
#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the platform when the user denies consent.
    pub error: Option<String>,
}

/// `GET /linked-role`: start authorization: set the signed state cookie and
/// redirect to the platform's consent screen.
pub async fn linked_role_handler(
    State(state): State<AppState>,
    jar: SignedCookieJar,
) -> AppResult<(SignedCookieJar, Redirect)> {
    let request = state.oauth.begin_authorization()?;
    let jar = jar.add(state_cookie(&request.state, state.config.cookie_secure));
    Ok((jar, Redirect::to(&request.url)))
}

/// `GET /discord-oauth-callback`: verify state, exchange the code, store the
/// tokens, and push the user's first metadata vector.
pub async fn oauth_callback_handler(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(params): Query<OAuthCallbackParams>,
) -> AppResult<(SignedCookieJar, &'static str)> {
    let cookie_state = jar.get(STATE_COOKIE).map(|c| c.value().to_string());
    let jar = jar.remove(clear_state_cookie());

    let query_state = params.state.ok_or(LinkError::StateMismatch)?;
    if let Some(error) = params.error {
        warn!(error = %error, "authorization denied by user");
        return Err(AppError::Validation(format!("Authorization denied: {error}")));
    }
    let code = params
        .code
        .ok_or_else(|| AppError::Validation("Missing authorization code".into()))?;

    let linked = state
        .oauth
        .complete_authorization(&code, &query_state, cookie_state.as_deref())
        .await?;

    if state.config.guild_id.is_some() {
        match state.pusher.sync_from_platform(&linked.user.id).await {
            Ok(result) => info!(user_id = %linked.user.id, ?result, "initial metadata sync"),
            Err(e) => warn!(user_id = %linked.user.id, error = %e, "initial metadata sync failed"),
        }
    }

    Ok((jar, SUCCESS_PAGE))
}
