//! Credential model.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair issued by the server.
///
/// Timestamps are informational. Nothing in the session core schedules a
/// renewal from them; renewal is driven by 401 responses only. They are not
/// persisted either, and are recomputed from the JWT claims on load.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(
        rename = "accessTokenIssuedAt",
        default,
        with = "lenient_datetime"
    )]
    pub access_issued_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "accessTokenExpiredAt",
        default,
        with = "lenient_datetime"
    )]
    pub access_expires_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "refreshTokenIssuedAt",
        default,
        with = "lenient_datetime"
    )]
    pub refresh_issued_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "refreshTokenExpiredAt",
        default,
        with = "lenient_datetime"
    )]
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential from raw tokens, deriving timestamps from their claims.
    pub fn from_tokens(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_issued_at: None,
            access_expires_at: None,
            refresh_issued_at: None,
            refresh_expires_at: None,
        }
        .with_claims_fallback()
    }

    /// Fill any missing timestamp from the `iat`/`exp` claims of the matching token.
    pub fn with_claims_fallback(mut self) -> Self {
        if self.access_issued_at.is_none() || self.access_expires_at.is_none() {
            let claims = TokenClaims::parse(&self.access_token);
            self.access_issued_at = self.access_issued_at.or(claims.issued_at);
            self.access_expires_at = self.access_expires_at.or(claims.expires_at);
        }
        if self.refresh_issued_at.is_none() || self.refresh_expires_at.is_none() {
            let claims = TokenClaims::parse(&self.refresh_token);
            self.refresh_issued_at = self.refresh_issued_at.or(claims.issued_at);
            self.refresh_expires_at = self.refresh_expires_at.or(claims.expires_at);
        }
        self
    }

    /// Check if the access token is past its known expiry at `now`.
    ///
    /// Returns `false` when the expiry is unknown.
    pub fn is_access_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.access_expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_refresh_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at.is_some_and(|exp| exp <= now)
    }
}

// Tokens never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Registered time claims of a JWT.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawClaims {
    iat: Option<i64>,
    exp: Option<i64>,
}

impl TokenClaims {
    /// Read `iat`/`exp` from a JWT payload without verifying the signature.
    ///
    /// Opaque or malformed tokens yield empty claims.
    pub fn parse(token: &str) -> Self {
        let Some(payload) = token.split('.').nth(1) else {
            return Self::default();
        };
        let Ok(decoded) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
            return Self::default();
        };
        let Ok(raw) = serde_json::from_slice::<RawClaims>(&decoded) else {
            return Self::default();
        };
        Self {
            issued_at: raw.iat.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            expires_at: raw.exp.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}

/// Accepts RFC 3339 timestamps and offset-less local date-times (read as UTC).
mod lenient_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod tests {
    use super::test_tokens::jwt;
    use super::*;

    #[test]
    fn claims_are_read_from_jwt_payload() {
        let claims = TokenClaims::parse(&jwt("user-1", 1_700_000_000, 1_700_003_600));
        assert_eq!(claims.issued_at, DateTime::from_timestamp(1_700_000_000, 0));
        assert_eq!(claims.expires_at, DateTime::from_timestamp(1_700_003_600, 0));
    }

    #[test]
    fn opaque_tokens_have_no_claims() {
        assert_eq!(TokenClaims::parse("opaque-token"), TokenClaims::default());
        assert_eq!(TokenClaims::parse("a.!!!.c"), TokenClaims::default());
    }

    #[test]
    fn from_tokens_recomputes_timestamps() {
        let credential = Credential::from_tokens(
            jwt("u", 1_700_000_000, 1_700_003_600),
            jwt("u", 1_700_000_000, 1_701_209_600),
        );
        let expiry = DateTime::from_timestamp(1_700_003_600, 0).unwrap();
        assert_eq!(credential.access_expires_at, Some(expiry));
        assert!(credential.is_access_expired_at(expiry));
        assert!(!credential.is_refresh_expired_at(expiry));
    }

    #[test]
    fn wire_payload_accepts_local_datetimes() {
        let json = r#"{
            "accessToken": "a",
            "refreshToken": "r",
            "accessTokenIssuedAt": "2025-03-01T10:00:00",
            "accessTokenExpiredAt": "2025-03-01T11:00:00.250",
            "refreshTokenExpiredAt": "2025-03-15T10:00:00Z"
        }"#;
        let credential: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(credential.access_token, "a");
        assert_eq!(
            credential.access_issued_at.map(|ts| ts.to_rfc3339()),
            Some("2025-03-01T10:00:00+00:00".to_string())
        );
        assert!(credential.access_expires_at.is_some());
        assert!(credential.refresh_issued_at.is_none());
        assert!(credential.refresh_expires_at.is_some());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let credential = Credential::from_tokens("secret-access", "secret-refresh");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("secret"));
    }
}
