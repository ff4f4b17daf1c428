//! Request signing for the ingestion API.
//!
//! A caller sends `X-Base58-Timestamp` (epoch seconds) and an
//! `Authorization` token: lowercase hex SHA-256 over
//! `secret || timestamp || path || method`.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Header names are case-insensitive on the wire; `http` wants lowercase.
pub const TIMESTAMP_HEADER: &str = "x-base58-timestamp";

/// Accepted clock skew either side of now.
pub const MAX_SKEW_SECS: i64 = 30 * 60;

/// Compute the token a caller must send.
pub fn sign(secret: &str, timestamp: &str, path: &str, method: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(method.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a request's timestamp window and token as of `now`.
pub fn verify(
    secret: &SecretString,
    headers: &HeaderMap,
    path: &str,
    method: &str,
    now: i64,
) -> Result<(), AuthError> {
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingTimestamp)?;

    let made_at: i64 = timestamp
        .parse()
        .map_err(|_| AuthError::InvalidTimestamp)?;
    if made_at.abs_diff(now) > MAX_SKEW_SECS.unsigned_abs() {
        return Err(AuthError::InvalidTimestamp);
    }

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = sign(secret.expose_secret(), timestamp, path, method);

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn secret() -> SecretString {
        SecretString::from("s3cret".to_string())
    }

    fn headers(timestamp: i64, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            TIMESTAMP_HEADER,
            HeaderValue::from_str(&timestamp.to_string()).unwrap(),
        );
        headers.insert(AUTHORIZATION, HeaderValue::from_str(token).unwrap());
        headers
    }

    #[test]
    fn sign_matches_manual_digest() {
        let mut hasher = Sha256::new();
        hasher.update(b"s3cret1700000000/jobPUT");
        assert_eq!(
            sign("s3cret", "1700000000", "/job", "PUT"),
            hex::encode(hasher.finalize())
        );
    }

    #[test]
    fn valid_signature_passes() {
        let token = sign("s3cret", &NOW.to_string(), "/job", "PUT");
        assert_eq!(verify(&secret(), &headers(NOW, &token), "/job", "PUT", NOW), Ok(()));
    }

    #[test]
    fn signature_is_bound_to_path_and_method() {
        let token = sign("s3cret", &NOW.to_string(), "/job", "PUT");
        let h = headers(NOW, &token);
        assert_eq!(
            verify(&secret(), &h, "/job", "DELETE", NOW),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            verify(&secret(), &h, "/sub", "PUT", NOW),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn timestamp_window_is_thirty_minutes() {
        for skew in [-MAX_SKEW_SECS, MAX_SKEW_SECS] {
            let ts = NOW + skew;
            let token = sign("s3cret", &ts.to_string(), "/job", "PUT");
            assert!(verify(&secret(), &headers(ts, &token), "/job", "PUT", NOW).is_ok());
        }
        for skew in [-MAX_SKEW_SECS - 1, MAX_SKEW_SECS + 1] {
            let ts = NOW + skew;
            let token = sign("s3cret", &ts.to_string(), "/job", "PUT");
            assert_eq!(
                verify(&secret(), &headers(ts, &token), "/job", "PUT", NOW),
                Err(AuthError::InvalidTimestamp)
            );
        }
    }

    #[test]
    fn missing_or_garbled_timestamp() {
        assert_eq!(
            verify(&secret(), &HeaderMap::new(), "/job", "PUT", NOW),
            Err(AuthError::MissingTimestamp)
        );

        let mut h = HeaderMap::new();
        h.insert(TIMESTAMP_HEADER, HeaderValue::from_static("yesterday"));
        assert_eq!(
            verify(&secret(), &h, "/job", "PUT", NOW),
            Err(AuthError::InvalidTimestamp)
        );
    }
}
