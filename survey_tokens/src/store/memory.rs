//! An in-memory token store

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, TokenSlot, TokenStore};

/// A token store that lives only as long as the process
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    access: RwLock<Option<String>>,
    refresh: RwLock<Option<String>>,
}

impl InMemoryTokenStore {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: TokenSlot) -> &RwLock<Option<String>> {
        match slot {
            TokenSlot::Access => &self.access,
            TokenSlot::Refresh => &self.refresh,
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>, StoreError> {
        Ok(self.slot(slot).read().await.clone())
    }

    async fn set(&self, slot: TokenSlot, value: &str) -> Result<(), StoreError> {
        *self.slot(slot).write().await = Some(value.to_owned());
        Ok(())
    }

    async fn remove(&self, slot: TokenSlot) -> Result<(), StoreError> {
        self.slot(slot).write().await.take();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
