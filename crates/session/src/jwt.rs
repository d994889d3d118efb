//! Expiry extraction from JWT-style bearer tokens.
//!
//! Only the `exp` claim is read; signatures are the backend's business.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Returns the `exp` claim of a three-part token, or `None` if the token is
/// opaque or carries no expiry.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

/// Remaining validity of `token` at `now`. Zero once expired.
pub fn remaining_validity(token: &str, now: DateTime<Utc>) -> Option<Duration> {
    let exp = token_expiry(token)?;
    Some((exp - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_exp_claim() {
        let token = make_token(1_700_000_000);
        assert_eq!(token_expiry(&token).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn opaque_tokens_have_no_expiry() {
        assert!(token_expiry("opaque-token").is_none());
        assert!(token_expiry("a.b").is_none());
        assert!(token_expiry("a.!!!.c").is_none());
        assert!(token_expiry("a.b.c.d").is_none());
    }

    #[test]
    fn remaining_validity_saturates_at_zero() {
        let now = Utc::now();
        let future = make_token(now.timestamp() + 120);
        let past = make_token(now.timestamp() - 120);

        let left = remaining_validity(&future, now).unwrap();
        assert!(left > Duration::from_secs(100) && left <= Duration::from_secs(120));
        assert_eq!(remaining_validity(&past, now), Some(Duration::ZERO));
    }
}
