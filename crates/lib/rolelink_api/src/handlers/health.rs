//! Liveness endpoint.

/// `GET /`: shows the server is up.
pub async fn root() -> &'static str {
    "👋"
}
