//! Identity-Provider Credential Intake
//!
//! Decodes provider-issued JWTs (Firebase, Auth0, Supabase, etc.) into the
//! claims that populate the identity correlation cache. This server does NOT
//! issue tokens and does not re-validate them on the game channel: cryptographic
//! validation happens here, once, in front of [`IdentityCache::put`], and the
//! registration cascade trusts the cached result.
//!
//! [`IdentityCache::put`]: crate::auth::cache::IdentityCache::put

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::auth::cache::IdentityCache;
use crate::net::protocol::UserId;

/// Credential intake configuration.
#[derive(Clone, Debug, Default)]
pub struct IdpConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl IdpConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("IDP_ISSUER").ok(),
            audience: std::env::var("IDP_AUDIENCE").ok(),
            public_key_pem: std::env::var("IDP_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("IDP_SECRET").ok(),
            skip_expiry: std::env::var("IDP_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if credential intake is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims expected from the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderClaims {
    /// Subject: the persistent user id.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Display name, if the provider carries one.
    #[serde(default)]
    pub name: Option<String>,
    /// Stable friend code, if the provider carries one.
    #[serde(default)]
    pub friend_code: Option<String>,
}

/// Credential intake errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No intake configured on server.
    #[error("credential intake not configured")]
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
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Decode and validate a provider JWT.
pub fn decode_credential(
    token: &str,
    config: &IdpConfig,
) -> Result<ProviderClaims, CredentialError> {
    if !config.is_configured() {
        return Err(CredentialError::NotConfigured);
    }

    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<ProviderClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| CredentialError::DecodeError(format!("invalid public key: {e}")))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(CredentialError::NotConfigured);
    };

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(CredentialError::MissingClaim("sub".into()));
    }

    // Manual expiry check (in case validation was skipped).
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(CredentialError::Expired);
        }
    }

    Ok(claims)
}

/// Validate a credential and admit it into the correlation cache.
///
/// The token string itself becomes the cache's primary key; the game channel
/// later presents the same opaque string (or a nonce bound to it).
pub async fn admit_credential(
    cache: &IdentityCache,
    config: &IdpConfig,
    token: &str,
    address: Option<IpAddr>,
) -> Result<UserId, CredentialError> {
    let claims = decode_credential(token, config)?;
    let user_id = UserId(claims.sub);
    cache
        .put(
            user_id.clone(),
            token.to_owned(),
            claims.friend_code,
            address,
            claims.name,
        )
        .await;
    Ok(user_id)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> CredentialError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => CredentialError::Expired,
        ErrorKind::InvalidSignature => CredentialError::InvalidSignature,
        ErrorKind::InvalidIssuer => CredentialError::InvalidIssuer,
        ErrorKind::InvalidAudience => CredentialError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => CredentialError::InvalidFormat,
        _ => CredentialError::DecodeError(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &ProviderClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> ProviderClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        ProviderClaims {
            sub: "user123".into(),
            exp: now + 3600,
            iat: now,
            name: Some("Bob".into()),
            friend_code: Some("BOB#1234".into()),
        }
    }

    fn test_config() -> IdpConfig {
        IdpConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_credential_decodes() {
        let token = create_test_token(&test_claims(), SECRET);
        let claims = decode_credential(&token, &test_config()).unwrap();
        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.friend_code.as_deref(), Some("BOB#1234"));
    }

    #[test]
    fn test_expired_credential_rejected() {
        let mut claims = test_claims();
        claims.exp = 1;
        let token = create_test_token(&claims, SECRET);

        let result = decode_credential(&token, &test_config());
        assert!(matches!(result, Err(CredentialError::Expired)));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let token = create_test_token(&test_claims(), "some-other-secret-key!!!!!!!");
        let result = decode_credential(&token, &test_config());
        assert!(matches!(result, Err(CredentialError::InvalidSignature)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let mut claims = test_claims();
        claims.sub = String::new();
        let token = create_test_token(&claims, SECRET);

        let result = decode_credential(&token, &test_config());
        assert!(matches!(result, Err(CredentialError::MissingClaim(_))));
    }

    #[test]
    fn test_not_configured_error() {
        let result = decode_credential("some.jwt.token", &IdpConfig::default());
        assert!(matches!(result, Err(CredentialError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_admit_credential_populates_cache() {
        let cache = IdentityCache::new();
        let token = create_test_token(&test_claims(), SECRET);

        let user_id = admit_credential(&cache, &test_config(), &token, None)
            .await
            .unwrap();
        assert_eq!(user_id, UserId("user123".into()));

        let record = cache.lookup_by_token(&token).await.expect("hit");
        assert_eq!(record.user_id, user_id);
        assert_eq!(record.name.as_deref(), Some("Bob"));
        assert!(cache.lookup_by_friend_code("BOB#1234").await.is_some());
    }
}
