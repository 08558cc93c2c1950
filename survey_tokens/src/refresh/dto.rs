//! DTOs for the session refresh endpoint

use serde::{Deserialize, Serialize};

use crate::{AccessToken, RefreshToken, RefreshTokenRef};

/// Query parameters sent to the refresh endpoint
///
/// The refresh token travels as the `refreshToken` query parameter; the
/// request has no body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshQuery<'a> {
    /// The refresh token being exchanged
    pub refresh_token: &'a RefreshTokenRef,
}

/// A successful response from the refresh endpoint
///
/// Any additional fields in the body are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    /// The newly issued access token
    #[serde(default)]
    pub access_token: Option<AccessToken>,

    /// A replacement refresh token, if the server rotates them
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
}
