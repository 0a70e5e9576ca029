//! In-memory token store for single-process deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{TokenRecord, TokenStore};
use crate::LinkError;

/// Token store backed by a concurrent map. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: DashMap<String, TokenRecord>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, LinkError> {
        Ok(self.records.get(user_id).map(|r| r.value().clone()))
    }

    async fn put(&self, user_id: &str, record: TokenRecord) -> Result<(), LinkError> {
        self.records.insert(user_id.to_string(), record);
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<(), LinkError> {
        self.records.remove(user_id);
        Ok(())
    }
}
