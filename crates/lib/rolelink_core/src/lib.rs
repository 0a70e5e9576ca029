//! # rolelink_core
//!
//! Role-to-metadata synchronization engine for Rolelink.
//!
//! A user authorizes once through [`oauth::OAuthFlow`]; afterwards every
//! relevant role change observed by [`watcher::RoleChangeWatcher`] is pushed
//! to the platform's role-connection endpoint by [`pusher::MetadataPusher`].

pub mod error;
pub mod migrate;
pub mod oauth;
pub mod platform;
pub mod pusher;
pub mod role_map;
pub mod secrets;
pub mod tokens;
pub mod watcher;

pub use error::LinkError;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
