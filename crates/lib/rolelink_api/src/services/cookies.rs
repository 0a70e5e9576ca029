//! State cookie: binds an authorization nonce to the browser that started it.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

/// Cookie name for the signed authorization nonce.
pub const STATE_COOKIE: &str = "clientState";

/// Lifetime of the state cookie; matches the server-side nonce TTL.
pub const STATE_COOKIE_MAX_AGE_SECS: i64 = 5 * 60;

/// Build the httpOnly state cookie. `Lax` so it survives the top-level
/// redirect back from the platform.
pub fn state_cookie(nonce: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((STATE_COOKIE.to_string(), nonce.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/".to_string())
        .max_age(Duration::seconds(STATE_COOKIE_MAX_AGE_SECS))
        .build()
}

/// Removal cookie for the state cookie.
pub fn clear_state_cookie() -> Cookie<'static> {
    Cookie::build((STATE_COOKIE.to_string(), String::new()))
        .path("/".to_string())
        .build()
}
