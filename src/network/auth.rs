//! Credential Verification
//!
//! Validates session tokens issued by the external login flow. The server
//! does NOT issue tokens - only validates them and extracts the stable user
//! identity from the `sub` claim.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// HS256 secret shared with the token issuer.
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Build a config with a fixed secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

/// Claims expected in a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the stable user identity.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Verify a credential token and return the stable user identity.
pub fn verify_credential(token: &str, config: &AuthConfig) -> Result<String, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_aud = false;

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let key = DecodingKey::from_secret(secret.as_bytes());
    let token_data: TokenData<TokenClaims> =
        decode(token, &key, &validation).map_err(map_jwt_error)?;

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // Manual expiry check (in case validation was skipped upstream)
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims.sub)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: "user123".into(),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
        }
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let secret = "test-secret-key-256-bits-long!!";
        let token = create_test_token(&test_claims(), secret);

        let config = AuthConfig::with_secret(secret);
        let identity = verify_credential(&token, &config).unwrap();
        assert_eq!(identity, "user123");
    }

    #[test]
    fn test_expired_token_rejected() {
        let secret = "test-secret-key-256-bits-long!!";
        let mut claims = test_claims();
        claims.exp = 1; // Expired in 1970

        let token = create_test_token(&claims, secret);
        let config = AuthConfig::with_secret(secret);

        let result = verify_credential(&token, &config);
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");

        let config = AuthConfig::with_secret("wrong-secret-key-here!!!!!!");
        let result = verify_credential(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let secret = "test-secret-key-256-bits-long!!";
        let mut claims = test_claims();
        claims.sub = String::new();

        let token = create_test_token(&claims, secret);
        let config = AuthConfig::with_secret(secret);

        let result = verify_credential(&token, &config);
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let secret = "test-secret-key-256-bits-long!!";
        let token = create_test_token(&test_claims(), secret);

        let config = AuthConfig {
            secret: Some(secret.into()),
            issuer: Some("wrong-issuer".into()),
            ..Default::default()
        };

        let result = verify_credential(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_not_configured_error() {
        let config = AuthConfig::default();
        let result = verify_credential("some.jwt.token", &config);
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_skip_expiry_for_testing() {
        let secret = "test-secret-key-256-bits-long!!";
        let mut claims = test_claims();
        claims.exp = 1;

        let token = create_test_token(&claims, secret);
        let config = AuthConfig {
            secret: Some(secret.into()),
            skip_expiry: true,
            ..Default::default()
        };

        assert!(verify_credential(&token, &config).is_ok());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let config = AuthConfig::with_secret("test-secret-key-256-bits-long!!");
        let result = verify_credential("not-a-jwt", &config);
        assert!(matches!(result, Err(AuthError::InvalidFormat)));
    }
}
