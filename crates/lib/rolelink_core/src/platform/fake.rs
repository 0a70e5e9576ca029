//! Scriptable in-process [`PlatformApi`] used by unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{PlatformApi, PlatformError, PlatformUser, RoleConnection, TokenGrant};
use crate::role_map::MetadataField;

/// How the fake answers refresh requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Succeed,
    /// 400 `invalid_grant`: the refresh token is revoked.
    Reject,
    /// 503 from the platform.
    Unavailable,
}

pub struct FakePlatform {
    pub user: PlatformUser,
    pub refresh_mode: Mutex<RefreshMode>,
    pub refresh_delay: Duration,
    pub guild_roles: Mutex<Option<HashSet<String>>>,
    /// Statuses returned by successive pushes; empty means 204.
    pub push_script: Mutex<VecDeque<u16>>,
    pub exchange_status: Mutex<Option<u16>>,
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    /// `(access_token, body)` of every push attempt.
    pub pushes: Mutex<Vec<(String, RoleConnection)>>,
    issued: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            user: PlatformUser {
                id: "user-1".into(),
                username: "alice".into(),
                global_name: None,
            },
            refresh_mode: Mutex::new(RefreshMode::Succeed),
            refresh_delay: Duration::ZERO,
            guild_roles: Mutex::new(Some(HashSet::new())),
            push_script: Mutex::new(VecDeque::new()),
            exchange_status: Mutex::new(None),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            pushes: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.refresh_mode.lock().unwrap() = mode;
    }

    pub fn script_pushes(&self, statuses: &[u16]) {
        self.push_script.lock().unwrap().extend(statuses);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> Vec<(String, RoleConnection)> {
        self.pushes.lock().unwrap().clone()
    }

    fn grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("access-{n}"),
            token_type: "Bearer".into(),
            expires_in: 604_800,
            refresh_token: Some(format!("refresh-{n}")),
            scope: Some("role_connections.write identify".into()),
        }
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, PlatformError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.exchange_status.lock().unwrap() {
            return Err(PlatformError::Status {
                status,
                body: r#"{"error":"invalid_grant"}"#.into(),
            });
        }
        Ok(self.grant())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let mode = *self.refresh_mode.lock().unwrap();
        match mode {
            RefreshMode::Succeed => Ok(self.grant()),
            RefreshMode::Reject => Err(PlatformError::Status {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.into(),
            }),
            RefreshMode::Unavailable => Err(PlatformError::Status {
                status: 503,
                body: "upstream unavailable".into(),
            }),
        }
    }

    async fn current_user(&self, _access_token: &str) -> Result<PlatformUser, PlatformError> {
        Ok(self.user.clone())
    }

    async fn guild_member_roles(
        &self,
        _access_token: &str,
        _guild_id: &str,
    ) -> Result<Option<HashSet<String>>, PlatformError> {
        Ok(self.guild_roles.lock().unwrap().clone())
    }

    async fn register_metadata(&self, _schema: &[MetadataField]) -> Result<(), PlatformError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_role_connection(
        &self,
        access_token: &str,
        connection: &RoleConnection,
    ) -> Result<(), PlatformError> {
        self.pushes
            .lock()
            .unwrap()
            .push((access_token.to_string(), connection.clone()));
        match self.push_script.lock().unwrap().pop_front() {
            Some(status) if !(200..300).contains(&status) => Err(PlatformError::Status {
                status,
                body: format!("scripted {status}"),
            }),
            _ => Ok(()),
        }
    }
}
