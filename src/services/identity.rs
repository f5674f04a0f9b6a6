//! Bearer token verification
//!
//! Tokens are issued elsewhere; this side only validates them and resolves
//! the `sub` claim to a user id. Either a shared HS256 secret or an RS256
//! public key is configured, never both.

use crate::config::Config;
use crate::error::AppError;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims this service reads; anything else in the token is ignored
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a bearer credential to the authenticated user id
    async fn verify(&self, token: &str) -> Result<Uuid, AppError>;
}

pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn hs256(secret: &str, issuer: Option<&str>) -> Self {
        Self::with_key(DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256, issuer)
    }

    pub fn rs256(public_key_pem: &str, issuer: Option<&str>) -> Result<Self, AppError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AppError::Config(format!("failed to parse RSA public key: {e}")))?;
        Ok(Self::with_key(key, Algorithm::RS256, issuer))
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let issuer = config.jwt_issuer.as_deref();
        match (&config.jwt_public_key_pem, &config.jwt_secret) {
            (Some(pem), _) => Self::rs256(pem, issuer),
            (None, Some(secret)) => Ok(Self::hs256(secret, issuer)),
            (None, None) => Err(AppError::Config(
                "JWT_SECRET or JWT_PUBLIC_KEY_PEM must be set".into(),
            )),
        }
    }

    fn with_key(key: DecodingKey, algorithm: Algorithm, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self { key, validation }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Uuid, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            AppError::Unauthorized
        })?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)
    }
}

/// Pull a bearer credential out of an `Authorization` header value
pub fn extract_bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_resolves_user() {
        let verifier = JwtIdentityVerifier::hs256("s3cret", None);
        let user = Uuid::new_v4();
        let resolved = verifier
            .verify(&token("s3cret", &user.to_string(), 3600))
            .await
            .unwrap();
        assert_eq!(resolved, user);
    }

    #[tokio::test]
    async fn test_rejects_wrong_secret_expired_and_bad_subject() {
        let verifier = JwtIdentityVerifier::hs256("s3cret", None);
        let user = Uuid::new_v4().to_string();

        assert!(verifier.verify(&token("other", &user, 3600)).await.is_err());
        assert!(verifier.verify(&token("s3cret", &user, -3600)).await.is_err());
        assert!(verifier
            .verify(&token("s3cret", "not-a-uuid", 3600))
            .await
            .is_err());
        assert!(verifier.verify("garbage").await.is_err());
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }
}
