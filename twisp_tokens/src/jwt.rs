//! Unverified inspection of compact JWS tokens
//!
//! Only the `exp` claim is read. Signatures are never checked here; the issuer and
//! the relying party own that concern.

use aliri_base64::Base64Url;
use serde::{de, Deserialize, Deserializer};
use std::error::Error as StdError;
use thiserror::Error;
use twisp_clock::UnixTime;

/// The token could not be understood as a JWT with an expiry
#[derive(Debug, Error)]
pub enum MalformedToken {
    /// The token does not have a header, payload, and signature section
    #[error("malformed JWT, expected 3 segments but found {0}")]
    SegmentCount(usize),

    /// The payload section is not valid base64url
    #[error("malformed JWT payload")]
    Payload(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The payload does not hold a usable `exp` claim
    #[error("unable to read JWT claims")]
    Claims(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    #[serde(deserialize_with = "numeric_date")]
    exp: UnixTime,
}

/// Reads a NumericDate, which may carry fractional seconds, rounding down
fn numeric_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixTime, D::Error> {
    let n = serde_json::Number::deserialize(deserializer)?;
    if let Some(secs) = n.as_u64() {
        return Ok(UnixTime(secs));
    }

    match n.as_f64() {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(UnixTime(secs.floor() as u64)),
        _ => Err(de::Error::invalid_value(
            de::Unexpected::Other("negative or out-of-range number"),
            &"a non-negative NumericDate",
        )),
    }
}

/// Reads the `exp` claim out of a compact JWS without verifying it
///
/// # Errors
///
/// Returns an error if the token does not have exactly three sections, if the
/// payload is not base64url, or if the claims lack a non-negative numeric `exp`.
pub fn unverified_expiry(token: &str) -> Result<UnixTime, MalformedToken> {
    let segments: Vec<&str> = token.split('.').collect();
    let payload = match segments[..] {
        [_, payload, _] => payload,
        _ => return Err(MalformedToken::SegmentCount(segments.len())),
    };

    let raw = Base64Url::from_encoded(payload).map_err(|e| MalformedToken::Payload(e.into()))?;
    let claims: ExpiryClaim =
        serde_json::from_slice(raw.as_slice()).map_err(MalformedToken::Claims)?;

    Ok(claims.exp)
}
