//! A token store backed by a local file

use std::{io, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{StoreError, TokenSlot, TokenStore};

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoredTokens {
    #[serde(rename = "accessToken", default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl StoredTokens {
    fn slot_mut(&mut self, slot: TokenSlot) -> &mut Option<String> {
        match slot {
            TokenSlot::Access => &mut self.access_token,
            TokenSlot::Refresh => &mut self.refresh_token,
        }
    }
}

/// A token store that persists tokens as a JSON object in a local file
///
/// Tokens survive process restarts. A missing file is treated as an empty
/// store; the file is created on the first write.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStore {
    /// Constructs a new file token store
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_tokens(&self) -> Result<StoredTokens, StoreError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoredTokens::default())
            }
            Err(err) => return Err(err.into()),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(StoredTokens::default());
        }

        Ok(serde_json::from_str(&data)?)
    }

    async fn write_tokens(&self, tokens: &StoredTokens) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(tokens)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn update(&self, slot: TokenSlot, value: Option<&str>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.read_tokens().await?;
        *tokens.slot_mut(slot) = value.map(str::to_owned);
        self.write_tokens(&tokens).await
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, slot: TokenSlot) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.read_tokens().await?;
        Ok(tokens.slot_mut(slot).take())
    }

    async fn set(&self, slot: TokenSlot, value: &str) -> Result<(), StoreError> {
        self.update(slot, Some(value)).await
    }

    async fn remove(&self, slot: TokenSlot) -> Result<(), StoreError> {
        self.update(slot, None).await
    }

    fn name(&self) -> &str {
        "file"
    }
}
