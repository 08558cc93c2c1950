use async_trait::async_trait;
use thiserror::Error;

use super::{dto, BoxError, RefreshExchange, RenewedTokens};
use crate::RefreshTokenRef;

/// The path of the refresh endpoint, relative to the API origin
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Exchanges refresh tokens with the API's refresh endpoint over HTTP
///
/// Sends `POST <refresh_url>?refreshToken=<token>` with no body and expects a
/// JSON body carrying at least a non-empty `accessToken`.
///
/// The client given here should be a plain `reqwest::Client`, not one routed
/// through the session middleware, so that a rejected refresh cannot itself
/// trigger another refresh.
#[derive(Debug, Clone)]
pub struct HttpRefreshExchange {
    client: reqwest::Client,
    refresh_url: reqwest::Url,
}

impl HttpRefreshExchange {
    /// Constructs an exchange against the given refresh endpoint
    pub fn new(client: reqwest::Client, refresh_url: reqwest::Url) -> Self {
        Self {
            client,
            refresh_url,
        }
    }

    /// Constructs an exchange against `path` on the API at `base`
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be joined onto `base`.
    pub fn from_base_url(
        client: reqwest::Client,
        base: &reqwest::Url,
        path: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self::new(client, base.join(path)?))
    }

    /// The endpoint this exchange posts to
    pub fn refresh_url(&self) -> &reqwest::Url {
        &self.refresh_url
    }
}

#[async_trait]
impl RefreshExchange for HttpRefreshExchange {
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<RenewedTokens, BoxError> {
        Ok(request_refresh(&self.client, self.refresh_url.clone(), refresh_token).await?)
    }
}

/// An error while attempting to renew tokens with the refresh endpoint
#[derive(Debug, Error)]
pub enum RefreshRequestError {
    /// The endpoint rejected the request
    #[error("error renewing session tokens: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing refresh response body")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send the refresh request
    #[error("error sending refresh request")]
    RequestSend(reqwest::Error),
    /// The response did not carry a new access token
    #[error("refresh response did not include an access token")]
    MissingAccessToken,
}

#[tracing::instrument(err, skip(client, refresh_url, refresh_token), fields(refresh_url = %refresh_url))]
async fn request_refresh(
    client: &reqwest::Client,
    refresh_url: reqwest::Url,
    refresh_token: &RefreshTokenRef,
) -> Result<RenewedTokens, RefreshRequestError> {
    tracing::trace!("requesting renewed tokens");

    let resp = client
        .post(refresh_url)
        .query(&dto::RefreshQuery { refresh_token })
        .send()
        .await
        .map_err(RefreshRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received refresh response"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(RefreshRequestError::BodyReadError)?;
        return Err(RefreshRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(RefreshRequestError::BodyReadError)?;
    let resp: dto::RefreshResponse = serde_json::from_slice(&body)?;

    let access_token = resp
        .access_token
        .filter(|t| !t.as_str().is_empty())
        .ok_or(RefreshRequestError::MissingAccessToken)?;
    let refresh_token = resp.refresh_token.filter(|t| !t.as_str().is_empty());

    tracing::debug!(
        has_refresh_token = refresh_token.is_some(),
        "received renewed tokens"
    );

    Ok(RenewedTokens {
        access_token,
        refresh_token,
    })
}
