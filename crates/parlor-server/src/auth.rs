//! JWT identity tokens.
//!
//! Tokens carry the whole public identity so a reconnecting client can be
//! reinstated without a storage round trip.

use crate::config::AuthConfig;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parlor_core::{Identity, TokenError, TokenIssuer};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Claims embedded in every token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    iat: u64,
    exp: u64,
}

/// HS256 token issuer.
#[derive(Clone)]
pub struct JwtIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl std::fmt::Debug for JwtIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIssuer")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl JwtIssuer {
    /// Create an issuer from auth configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 5; // clock skew

        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            ttl_secs: config.token_ttl_secs,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl TokenIssuer for JwtIssuer {
    fn issue(&self, identity: &Identity) -> Result<String, TokenError> {
        let now = now_secs();
        let claims = Claims {
            sub: identity.user_id.clone(),
            name: identity.name.clone(),
            email: identity.email.clone(),
            avatar: identity.avatar_url.clone(),
            iat: now,
            exp: now + self.ttl_secs,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Issue(e.to_string()))
    }

    fn verify(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(Identity {
                user_id: data.claims.sub,
                name: data.claims.name,
                email: data.claims.email,
                avatar_url: data.claims.avatar,
            }),
            Err(e) => {
                debug!(error = %e, "Rejected token");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: "user_1".to_string(),
            name: "alice".to_string(),
            email: "alice@example.com".to_string(),
            avatar_url: Some("/assets/images/a.png".to_string()),
        }
    }

    fn config(secret: &str) -> AuthConfig {
        AuthConfig {
            jwt_secret: secret.to_string(),
            token_ttl_secs: 3600,
        }
    }

    #[test]
    fn test_issued_token_verifies() {
        let issuer = JwtIssuer::new(&config("secret"));
        let token = issuer.issue(&identity()).unwrap();
        assert_eq!(issuer.verify(&token), Some(identity()));
    }

    #[test]
    fn test_foreign_or_garbage_tokens_are_rejected() {
        let issuer = JwtIssuer::new(&config("secret"));
        let other = JwtIssuer::new(&config("other-secret"));
        let token = other.issue(&identity()).unwrap();

        assert_eq!(issuer.verify(&token), None);
        assert_eq!(issuer.verify("not.a.token"), None);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let issuer = JwtIssuer::new(&config("secret"));
        let claims = Claims {
            sub: "user_1".to_string(),
            name: "alice".to_string(),
            email: "alice@example.com".to_string(),
            avatar: None,
            iat: 1,
            exp: 2,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &issuer.encoding_key).unwrap();
        assert_eq!(issuer.verify(&token), None);
    }
}
