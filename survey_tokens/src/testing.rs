//! Helpers for testing code that depends on a session
//!
//! Available with the `testing` feature.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use survey_clock::UnixTime;

use crate::{
    refresh::{BoxError, RefreshExchange, RenewedTokens},
    AccessToken, RefreshToken, RefreshTokenRef,
};

/// Mints an unsigned token that expires at `exp`
///
/// The token has the shape of a JWT, but its signature is meaningless.
pub fn mint_token(exp: UnixTime) -> String {
    mint_token_with_claims(&serde_json::json!({ "sub": "test-user", "exp": exp.0 }))
}

/// Mints an unsigned token carrying arbitrary claims
pub fn mint_token_with_claims(claims: &serde_json::Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"unsigned"),
    )
}

/// A refresh exchange with a scripted result that counts its calls
#[derive(Debug)]
pub struct ScriptedExchange {
    renewed: Option<RenewedTokens>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_refresh_token: Mutex<Option<RefreshToken>>,
}

impl ScriptedExchange {
    /// An exchange that always issues `access_token`
    pub fn renewing(access_token: impl Into<String>) -> Self {
        Self::scripted(Some(RenewedTokens {
            access_token: AccessToken::new(access_token.into()),
            refresh_token: None,
        }))
    }

    /// An exchange that always fails
    pub fn failing() -> Self {
        Self::scripted(None)
    }

    fn scripted(renewed: Option<RenewedTokens>) -> Self {
        Self {
            renewed,
            delay: None,
            calls: AtomicUsize::new(0),
            last_refresh_token: Mutex::new(None),
        }
    }

    /// Also issues a replacement refresh token on success
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        if let Some(renewed) = &mut self.renewed {
            renewed.refresh_token = Some(RefreshToken::new(refresh_token.into()));
        }
        self
    }

    /// Waits for `delay` before answering each exchange
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The number of exchanges attempted so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// The refresh token presented in the most recent exchange
    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.as_str().to_owned())
    }
}

#[async_trait]
impl RefreshExchange for ScriptedExchange {
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<RenewedTokens, BoxError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        *self
            .last_refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(refresh_token.to_owned());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.renewed
            .clone()
            .ok_or_else(|| "refresh token rejected".into())
    }
}
