//! Claim inspection for session tokens
//!
//! Tokens are JWTs: three `.`-separated base64url segments holding a header,
//! a payload of claims, and a signature. Only the payload is examined here,
//! and only to learn when the token expires.
//!
//! **No signature verification is performed.** The authority that issued the
//! token verifies it on every request; the client only needs to know whether
//! presenting the token is still worthwhile. Nothing read from the payload
//! should be treated as authenticated.
//!
//! Every predicate in this module is total: a token that cannot be decoded
//! is reported as invalid and as expiring soon.
//!
//! ```
//! use survey_clock::{DurationSecs, UnixTime};
//! use survey_tokens::inspect;
//!
//! // {"alg":"none"} . {"exp":1700000000} . sig
//! let token = "eyJhbGciOiJub25lIn0.eyJleHAiOjE3MDAwMDAwMDB9.c2ln";
//!
//! let claims = inspect::decode(token).unwrap();
//! assert_eq!(claims.exp(), UnixTime(1_700_000_000));
//!
//! let now = UnixTime(1_700_000_000 - 30);
//! assert!(inspect::is_valid_at(token, now));
//! assert!(inspect::is_expiring_soon_at(token, DurationSecs(120), now));
//!
//! assert!(!inspect::is_valid_at("not-a-jwt", now));
//! assert!(inspect::is_expiring_soon_at("not-a-jwt", DurationSecs(120), now));
//! ```

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use survey_clock::{Clock, DurationSecs, System, UnixTime};
use thiserror::Error;

/// Base64url, tolerant of issuers that leave padding on
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The claims this client cares about from a token's payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    exp: UnixTime,
}

impl TokenClaims {
    /// The time at which the token expires
    #[inline]
    pub fn exp(&self) -> UnixTime {
        self.exp
    }
}

/// The token could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The token was an empty string
    #[error("token is empty")]
    Empty,
    /// The token did not consist of exactly three segments
    #[error("expected 3 token segments, found {0}")]
    SegmentCount(usize),
    /// The payload segment was not valid base64url
    #[error("token payload is not valid base64url")]
    Base64(#[source] base64::DecodeError),
    /// The payload segment was not a JSON object
    #[error("token payload is not a JSON object")]
    Json(#[source] serde_json::Error),
    /// The payload carried no numeric `exp` claim
    #[error("token payload has no expiration")]
    MissingExpiration,
}

#[derive(serde::Deserialize)]
struct RawClaims {
    #[serde(default)]
    exp: Option<serde_json::Value>,
}

/// Decodes the claims from a token's payload without verifying its signature
///
/// # Errors
///
/// Returns an error if the token is not a three-segment JWT, if the payload
/// is not base64url-encoded JSON, or if the payload lacks a numeric `exp`.
pub fn decode(token: &str) -> Result<TokenClaims, DecodeError> {
    if token.is_empty() {
        return Err(DecodeError::Empty);
    }

    let segments: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(DecodeError::SegmentCount(segments.len()));
    };

    let raw = PAYLOAD_ENGINE
        .decode(payload)
        .map_err(DecodeError::Base64)?;
    let claims: RawClaims = serde_json::from_slice(&raw).map_err(DecodeError::Json)?;

    // NumericDate may be fractional; negative values are long past.
    let exp = match claims.exp {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0).floor() as u64))
            .ok_or(DecodeError::MissingExpiration)?,
        _ => return Err(DecodeError::MissingExpiration),
    };

    Ok(TokenClaims {
        exp: UnixTime(exp),
    })
}

/// A token's lifecycle status relative to a refresh lead time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid for longer than the lead time
    Valid,
    /// The token is still valid, but expires within the lead time
    ExpiringSoon,
    /// The token has expired or cannot be decoded
    Expired,
}

/// Whether the token decodes and has not yet expired
#[inline]
pub fn is_valid(token: &str) -> bool {
    is_valid_with_clock(token, &System)
}

/// Whether the token decodes and has not yet expired according to `clock`
#[inline]
pub fn is_valid_with_clock<C: Clock + ?Sized>(token: &str, clock: &C) -> bool {
    is_valid_at(token, clock.now())
}

/// Whether the token decodes and has not expired as of `now`
pub fn is_valid_at(token: &str, now: UnixTime) -> bool {
    decode(token).map_or(false, |claims| claims.exp > now)
}

/// Whether fewer than `threshold` seconds remain before the token expires
///
/// Tokens that cannot be decoded are always expiring soon.
#[inline]
pub fn is_expiring_soon(token: &str, threshold: DurationSecs) -> bool {
    is_expiring_soon_with_clock(token, threshold, &System)
}

/// Whether fewer than `threshold` seconds remain before the token expires,
/// according to `clock`
#[inline]
pub fn is_expiring_soon_with_clock<C: Clock + ?Sized>(
    token: &str,
    threshold: DurationSecs,
    clock: &C,
) -> bool {
    is_expiring_soon_at(token, threshold, clock.now())
}

/// Whether fewer than `threshold` seconds remain before the token expires,
/// as of `now`
pub fn is_expiring_soon_at(token: &str, threshold: DurationSecs, now: UnixTime) -> bool {
    match decode(token) {
        Ok(claims) => i128::from(claims.exp.0) - i128::from(now.0) < i128::from(threshold.0),
        Err(_) => true,
    }
}

/// Classifies the token as of the current system time
#[inline]
pub fn token_status(token: &str, lead: DurationSecs) -> TokenStatus {
    token_status_with_clock(token, lead, &System)
}

/// Classifies the token as of the time reported by `clock`
#[inline]
pub fn token_status_with_clock<C: Clock + ?Sized>(
    token: &str,
    lead: DurationSecs,
    clock: &C,
) -> TokenStatus {
    token_status_at(token, lead, clock.now())
}

/// Classifies the token as of `now`
pub fn token_status_at(token: &str, lead: DurationSecs, now: UnixTime) -> TokenStatus {
    if !is_valid_at(token, now) {
        TokenStatus::Expired
    } else if is_expiring_soon_at(token, lead, now) {
        TokenStatus::ExpiringSoon
    } else {
        TokenStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use color_eyre::Result;

    use super::*;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn token_with_payload(payload: &str) -> String {
        format!(
            "{}.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload),
        )
    }

    fn token_expiring_in(secs: i64) -> String {
        token_with_payload(&format!(r#"{{"sub":"alice","exp":{}}}"#, NOW.0 as i64 + secs))
    }

    #[test]
    fn decodes_expiration_claim() -> Result<()> {
        let claims = decode(&token_expiring_in(3600))?;
        assert_eq!(claims.exp(), UnixTime(NOW.0 + 3600));
        Ok(())
    }

    #[test]
    fn decodes_padded_payloads() -> Result<()> {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"exp":17}"#);
        assert!(payload.ends_with('='));
        let claims = decode(&format!("e30.{}.sig", payload))?;
        assert_eq!(claims.exp(), UnixTime(17));
        Ok(())
    }

    #[test]
    fn floors_fractional_expirations() -> Result<()> {
        let claims = decode(&token_with_payload(r#"{"exp":1700000000.75}"#))?;
        assert_eq!(claims.exp(), NOW);
        Ok(())
    }

    #[test]
    fn token_valid_for_an_hour_is_valid_and_not_expiring() {
        let token = token_expiring_in(3600);
        assert!(is_valid_at(&token, NOW));
        assert!(!is_expiring_soon_at(&token, DurationSecs(120), NOW));
        assert_eq!(
            token_status_at(&token, DurationSecs(120), NOW),
            TokenStatus::Valid
        );
    }

    #[test]
    fn token_valid_for_thirty_seconds_is_expiring_soon() {
        let token = token_expiring_in(30);
        assert!(is_valid_at(&token, NOW));
        assert!(is_expiring_soon_at(&token, DurationSecs(120), NOW));
        assert_eq!(
            token_status_at(&token, DurationSecs(120), NOW),
            TokenStatus::ExpiringSoon
        );
    }

    #[test]
    fn token_expiring_now_is_not_valid() {
        let token = token_expiring_in(0);
        assert!(!is_valid_at(&token, NOW));
        assert_eq!(
            token_status_at(&token, DurationSecs(120), NOW),
            TokenStatus::Expired
        );
    }

    #[test]
    fn expired_token_is_expiring_soon_even_with_zero_threshold() {
        let token = token_expiring_in(-10);
        assert!(is_expiring_soon_at(&token, DurationSecs(0), NOW));
    }

    #[test]
    fn clock_variants_agree_with_explicit_time() {
        let clock = survey_clock::TestClock::new(NOW);
        let token = token_expiring_in(30);
        assert!(is_valid_with_clock(&token, &clock));
        assert!(is_expiring_soon_with_clock(&token, DurationSecs(60), &clock));
        assert!(!is_expiring_soon_with_clock(&token, DurationSecs(10), &clock));
    }

    mod malformed_tokens {
        use super::*;

        fn assert_fails_closed(token: &str) {
            assert!(!is_valid_at(token, NOW), "{:?} reported valid", token);
            assert!(
                is_expiring_soon_at(token, DurationSecs(120), NOW),
                "{:?} not reported as expiring",
                token
            );
        }

        #[test]
        fn empty_token_fails_closed() {
            assert!(matches!(decode(""), Err(DecodeError::Empty)));
            assert_fails_closed("");
        }

        #[test]
        fn wrong_segment_counts_fail_closed() {
            let good = token_expiring_in(3600);
            let four = format!("{}.extra", good);
            let two = good.rsplitn(2, '.').nth(1).unwrap().to_owned();

            assert!(matches!(decode(&four), Err(DecodeError::SegmentCount(4))));
            assert!(matches!(decode(&two), Err(DecodeError::SegmentCount(2))));
            assert!(matches!(
                decode("opaque-bearer"),
                Err(DecodeError::SegmentCount(1))
            ));

            for token in [four.as_str(), two.as_str(), "opaque-bearer", ".."] {
                assert_fails_closed(token);
            }
        }

        #[test]
        fn payload_that_is_not_base64url_fails_closed() {
            let token = "e30.***.sig";
            assert!(matches!(decode(token), Err(DecodeError::Base64(_))));
            assert_fails_closed(token);
        }

        #[test]
        fn payload_that_is_not_json_fails_closed() {
            let token = format!("e30.{}.sig", URL_SAFE_NO_PAD.encode("not json"));
            assert!(matches!(decode(&token), Err(DecodeError::Json(_))));
            assert_fails_closed(&token);
        }

        #[test]
        fn payload_without_numeric_expiration_fails_closed() {
            for payload in [r#"{"sub":"alice"}"#, r#"{"exp":"soon"}"#, r#"{"exp":null}"#] {
                let token = token_with_payload(payload);
                assert!(matches!(
                    decode(&token),
                    Err(DecodeError::MissingExpiration)
                ));
                assert_fails_closed(&token);
            }
        }
    }
}
