//! Request handlers.

pub mod health;
pub mod metadata;
pub mod oauth;
