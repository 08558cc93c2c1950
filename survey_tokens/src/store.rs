//! Persistent storage for session tokens
//!
//! A store holds at most one access token and one refresh token, each under
//! its own key. It applies no policy of its own: expiry is judged only by
//! inspecting the token claims.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "file")]
mod file;
mod memory;

#[cfg(feature = "file")]
pub use file::FileTokenStore;
pub use memory::InMemoryTokenStore;

/// The two entries held by a token store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenSlot {
    /// The short-lived access token
    Access,
    /// The longer-lived refresh token
    Refresh,
}

impl TokenSlot {
    /// The storage key for this slot
    pub const fn key(self) -> &'static str {
        match self {
            Self::Access => "accessToken",
            Self::Refresh => "refreshToken",
        }
    }
}

impl fmt::Display for TokenSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// An error reading from or writing to a token store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium could not be accessed
    #[error("unable to access token store")]
    Io(#[from] io::Error),
    /// The backing medium held data that could not be understood
    #[error("token store contents are malformed")]
    Format(#[from] serde_json::Error),
}

/// A key-value store for the session's tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Reads the token held in `slot`, if any
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>, StoreError>;

    /// Replaces the token held in `slot`
    async fn set(&self, slot: TokenSlot, value: &str) -> Result<(), StoreError>;

    /// Clears `slot`; clearing an empty slot is not an error
    async fn remove(&self, slot: TokenSlot) -> Result<(), StoreError>;

    /// A short name for this store, used in diagnostics
    fn name(&self) -> &str {
        "unknown"
    }
}

#[async_trait]
impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>, StoreError> {
        (**self).get(slot).await
    }

    async fn set(&self, slot: TokenSlot, value: &str) -> Result<(), StoreError> {
        (**self).set(slot, value).await
    }

    async fn remove(&self, slot: TokenSlot) -> Result<(), StoreError> {
        (**self).remove(slot).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
