//! Caller identity.
//!
//! The coordinator only needs to know *who* is calling: every upload is
//! owned by the principal that planned it.  Tokens are HS256 JWTs carrying
//! `{user_id, username, sub, iat, exp}`; with `auth.mode = none` every
//! caller is the configured default owner.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::errors::UploadError;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

/// JWT claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies bearer tokens.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Resolve the caller from the bearer token, if one was sent.
    fn verify(&self, token: Option<&str>) -> Result<Principal, UploadError>;
}

/// Build the provider selected by `auth.mode`.
pub fn from_config(config: &AuthConfig) -> anyhow::Result<Arc<dyn IdentityProvider>> {
    match config.mode.as_str() {
        "jwt" => {
            if config.jwt_secret.is_empty() {
                anyhow::bail!("auth.mode is 'jwt' but auth.jwt_secret is empty");
            }
            if config.uses_dev_secret() {
                warn!(
                    "auth.jwt_secret is the built-in development secret; \
                     set it before exposing this service"
                );
            }
            Ok(Arc::new(JwtIdentityProvider::new(
                &config.jwt_secret,
                Duration::from_secs(config.token_ttl_secs),
            )))
        }
        "none" => Ok(Arc::new(AnonymousIdentityProvider::new(&config.default_owner))),
        other => anyhow::bail!("unknown auth.mode '{other}' (expected 'jwt' or 'none')"),
    }
}

// -- JWT ---------------------------------------------------------------------

pub struct JwtIdentityProvider {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    /// Mint a token for `principal`, valid for the configured TTL.
    pub fn issue_token(&self, principal: &Principal) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: principal.user_id.clone(),
            username: principal.username.clone(),
            sub: principal.user_id.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn verify(&self, token: Option<&str>) -> Result<Principal, UploadError> {
        let token = token.ok_or_else(|| UploadError::Unauthorized {
            message: "Authorization header required".to_string(),
        })?;

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("JWT validation failed: {}", e);
            let message = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token has expired",
                _ => "Invalid token",
            };
            UploadError::Unauthorized {
                message: message.to_string(),
            }
        })?;

        let claims = data.claims;
        if claims.user_id.is_empty() {
            return Err(UploadError::Unauthorized {
                message: "Token carries no user".to_string(),
            });
        }
        Ok(Principal {
            user_id: claims.user_id,
            username: claims.username,
        })
    }
}

// -- Anonymous ---------------------------------------------------------------

pub struct AnonymousIdentityProvider {
    owner: String,
}

impl AnonymousIdentityProvider {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
        }
    }
}

impl IdentityProvider for AnonymousIdentityProvider {
    fn verify(&self, _token: Option<&str>) -> Result<Principal, UploadError> {
        Ok(Principal {
            user_id: self.owner.clone(),
            username: self.owner.clone(),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal {
            user_id: "u-123".to_string(),
            username: "alice".to_string(),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let provider = JwtIdentityProvider::new("secret", Duration::from_secs(3600));
        let token = provider.issue_token(&alice()).unwrap();
        assert_eq!(provider.verify(Some(&token)).unwrap(), alice());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtIdentityProvider::new("secret", Duration::from_secs(3600));
        let verifier = JwtIdentityProvider::new("other", Duration::from_secs(3600));
        let token = issuer.issue_token(&alice()).unwrap();
        let err = verifier.verify(Some(&token)).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn test_expired_token_rejected() {
        let provider = JwtIdentityProvider::new("secret", Duration::from_secs(3600));
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: "u-1".into(),
            username: "old".into(),
            sub: "u-1".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &provider.encoding).unwrap();
        let err = provider.verify(Some(&token)).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_missing_token_rejected() {
        let provider = JwtIdentityProvider::new("secret", Duration::from_secs(3600));
        assert!(provider.verify(None).is_err());
    }

    #[test]
    fn test_anonymous_uses_default_owner() {
        let provider = AnonymousIdentityProvider::new("default-user");
        let principal = provider.verify(None).unwrap();
        assert_eq!(principal.user_id, "default-user");
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(Some("bearer  xyz ")), Some("xyz"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn test_from_config_modes() {
        let mut config = AuthConfig::default();
        assert!(config.uses_dev_secret());
        assert!(from_config(&config).is_ok());
        config.jwt_secret = "s3cr3t-from-vault".into();
        assert!(!config.uses_dev_secret());
        assert!(from_config(&config).is_ok());
        config.mode = "none".into();
        assert!(from_config(&config).is_ok());
        config.mode = "ldap".into();
        assert!(from_config(&config).is_err());
    }
}
