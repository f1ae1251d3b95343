use crate::clock::Clock;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Authentication failures, each mapped to 401 at the router boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("Authorization header is not of the form 'Bearer <token>'")]
    MalformedHeader,

    #[error("token signature verification failed")]
    InvalidSignature,

    #[error("token is expired")]
    Expired,

    #[error("token is missing required claim: {0}")]
    MissingClaim(&'static str),
}

impl AuthError {
    /// Stable reason code for the JSON error body.
    pub const fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeader => "missing_header",
            AuthError::MalformedHeader => "malformed_header",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::Expired => "expired",
            AuthError::MissingClaim(_) => "missing_claim",
        }
    }
}

/// Verified identity facts extracted from a bearer token.
///
/// `subject_id` and `org_id` are always present and non-empty; a token
/// without them never produces a `Claims` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject_id: String,
    pub org_id: String,
    pub roles: HashSet<String>,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
}

/// Claims as they appear on the wire. Presence checks happen after decode
/// so a missing claim is reported as `MissingClaim` rather than a parse
/// failure.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    org_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    iat: Option<u64>,
    exp: Option<u64>,
}

/// Verifies bearer tokens and extracts [`Claims`].
///
/// Pure computation: no I/O, no suspension points. Expiry is checked
/// against the injected clock, not the library's system-time check.
pub struct ClaimsValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl ClaimsValidator {
    pub fn new(
        secret: &[u8],
        issuer: Option<&str>,
        audience: Option<&str>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        match issuer {
            Some(iss) => validation.set_issuer(&[iss]),
            None => {}
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        ClaimsValidator {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            clock,
        }
    }

    /// Validate straight from the raw `Authorization` header value.
    pub fn validate_header(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let value = header.ok_or(AuthError::MissingHeader)?;
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MalformedHeader)?;
        self.validate(token)
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data =
            decode::<RawClaims>(token, &self.decoding_key, &self.validation).map_err(|err| {
                match err.kind() {
                    ErrorKind::InvalidToken
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => AuthError::MalformedHeader,
                    // Issuer/audience mismatch means the token is not one of
                    // ours; treat it like a failed verification.
                    _ => AuthError::InvalidSignature,
                }
            })?;

        let raw = data.claims;
        let subject_id = raw
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingClaim("sub"))?;
        let org_id = raw
            .org_id
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingClaim("org_id"))?;
        let exp = raw.exp.ok_or(AuthError::MissingClaim("exp"))?;

        let expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        if self.clock.now() >= expires_at {
            return Err(AuthError::Expired);
        }

        Ok(Claims {
            subject_id,
            org_id,
            roles: raw.roles.into_iter().collect(),
            issued_at: UNIX_EPOCH + Duration::from_secs(raw.iat.unwrap_or(0)),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn sign(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn validator_at(unix_secs: u64) -> ClaimsValidator {
        ClaimsValidator::new(SECRET, None, None, Arc::new(ManualClock::at_unix(unix_secs)))
    }

    #[test]
    fn test_valid_token() {
        let token = sign(&json!({
            "sub": "user-1",
            "org_id": "org-9",
            "roles": ["admin", "viewer"],
            "iat": 1000,
            "exp": 2000,
        }));

        let claims = validator_at(1500).validate(&token).unwrap();
        assert_eq!(claims.subject_id, "user-1");
        assert_eq!(claims.org_id, "org-9");
        assert!(claims.roles.contains("admin"));
        assert_eq!(claims.expires_at, UNIX_EPOCH + Duration::from_secs(2000));
    }

    #[test]
    fn test_expired_token() {
        let token = sign(&json!({"sub": "u", "org_id": "o", "exp": 1000}));
        assert_eq!(
            validator_at(1000).validate(&token),
            Err(AuthError::Expired)
        );
        assert_eq!(
            validator_at(5000).validate(&token),
            Err(AuthError::Expired)
        );
        assert!(validator_at(999).validate(&token).is_ok());
    }

    #[test]
    fn test_missing_claims() {
        let no_org = sign(&json!({"sub": "u", "exp": 2000}));
        assert_eq!(
            validator_at(100).validate(&no_org),
            Err(AuthError::MissingClaim("org_id"))
        );

        let empty_org = sign(&json!({"sub": "u", "org_id": "", "exp": 2000}));
        assert_eq!(
            validator_at(100).validate(&empty_org),
            Err(AuthError::MissingClaim("org_id"))
        );

        let no_sub = sign(&json!({"org_id": "o", "exp": 2000}));
        assert_eq!(
            validator_at(100).validate(&no_sub),
            Err(AuthError::MissingClaim("sub"))
        );

        let no_exp = sign(&json!({"sub": "u", "org_id": "o"}));
        assert_eq!(
            validator_at(100).validate(&no_exp),
            Err(AuthError::MissingClaim("exp"))
        );
    }

    #[test]
    fn test_bad_signature() {
        let token = encode(
            &Header::default(),
            &json!({"sub": "u", "org_id": "o", "exp": 2000}),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();

        assert_eq!(
            validator_at(100).validate(&token),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_issuer_and_audience_mismatch() {
        let clock = Arc::new(ManualClock::at_unix(100));
        let validator =
            ClaimsValidator::new(SECRET, Some("https://issuer.example.com"), None, clock.clone());

        let good = sign(&json!({
            "sub": "u",
            "org_id": "o",
            "exp": 2000,
            "iss": "https://issuer.example.com",
        }));
        assert!(validator.validate(&good).is_ok());

        // Wrong or absent issuer is not one of our tokens.
        let wrong_iss = sign(&json!({
            "sub": "u",
            "org_id": "o",
            "exp": 2000,
            "iss": "https://spoofed.example.com",
        }));
        assert_eq!(
            validator.validate(&wrong_iss),
            Err(AuthError::InvalidSignature)
        );
        let no_iss = sign(&json!({"sub": "u", "org_id": "o", "exp": 2000}));
        assert_eq!(
            validator.validate(&no_iss),
            Err(AuthError::InvalidSignature)
        );

        let validator = ClaimsValidator::new(SECRET, None, Some("gateway"), clock);
        let wrong_aud = sign(&json!({
            "sub": "u",
            "org_id": "o",
            "exp": 2000,
            "aud": "billing",
        }));
        assert_eq!(
            validator.validate(&wrong_aud),
            Err(AuthError::InvalidSignature)
        );
        let right_aud = sign(&json!({
            "sub": "u",
            "org_id": "o",
            "exp": 2000,
            "aud": "gateway",
        }));
        assert!(validator.validate(&right_aud).is_ok());
    }

    #[test]
    fn test_header_shapes() {
        let validator = validator_at(100);

        assert_eq!(
            validator.validate_header(None),
            Err(AuthError::MissingHeader)
        );
        assert_eq!(
            validator.validate_header(Some("Basic dXNlcjpwdw==")),
            Err(AuthError::MalformedHeader)
        );
        assert_eq!(
            validator.validate_header(Some("Bearer ")),
            Err(AuthError::MalformedHeader)
        );
        assert_eq!(
            validator.validate_header(Some("Bearer not-a-jwt")),
            Err(AuthError::MalformedHeader)
        );

        let token = sign(&json!({"sub": "u", "org_id": "o", "exp": 2000}));
        assert!(
            validator
                .validate_header(Some(&format!("Bearer {token}")))
                .is_ok()
        );
    }
}
