//! Token issuing and verification
//!
//! One verification contract serves both transports: the WebSocket handshake
//! carries the token as a query parameter, HTTP calls carry it in the
//! `Authorization` header. Expired or tampered tokens resolve to no identity.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Token lifetime: 24 hours
const TOKEN_VALIDITY_SECS: i64 = 60 * 60 * 24;

/// Signing configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    aud: String,
    exp: i64,
    id: String,
    email: String,
}

/// Issues and verifies the bearer tokens used by both transports
pub struct TokenAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
}

impl TokenAuth {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        }
    }

    /// Issue a token for an authenticated account
    pub fn generate(&self, user_id: Uuid, email: &str) -> Result<String, TokenError> {
        let claims = Claims {
            sub: "Authentication".to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: Utc::now().timestamp() + TOKEN_VALIDITY_SECS,
            id: user_id.to_string(),
            email: email.to_string(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Resolve a bearer token to an identity. Rejects expired or tampered
    /// tokens and tokens minted for another issuer/audience.
    pub fn verify(&self, token: &str) -> Option<Uuid> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).ok()?;
        Uuid::parse_str(&data.claims.id).ok()
    }
}

/// SHA-256 hex digest used for stored password hashes
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth() -> TokenAuth {
        TokenAuth::new(&JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "relaychat".to_string(),
            audience: "relaychat-clients".to_string(),
        })
    }

    #[test]
    fn test_roundtrip() {
        let auth = test_auth();
        let user_id = Uuid::new_v4();

        let token = auth.generate(user_id, "ada@example.com").unwrap();
        assert_eq!(auth.verify(&token), Some(user_id));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = test_auth();
        let token = auth.generate(Uuid::new_v4(), "ada@example.com").unwrap();

        let mut tampered = token.clone();
        tampered.pop();
        assert_eq!(auth.verify(&tampered), None);
        assert_eq!(auth.verify("not-a-token"), None);
        assert_eq!(auth.verify(""), None);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = test_auth();
        let other = TokenAuth::new(&JwtConfig {
            secret: "other-secret".to_string(),
            issuer: "relaychat".to_string(),
            audience: "relaychat-clients".to_string(),
        });

        let token = other.generate(Uuid::new_v4(), "ada@example.com").unwrap();
        assert_eq!(auth.verify(&token), None);
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let auth = test_auth();
        let other = TokenAuth::new(&JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "relaychat".to_string(),
            audience: "someone-else".to_string(),
        });

        let token = other.generate(Uuid::new_v4(), "ada@example.com").unwrap();
        assert_eq!(auth.verify(&token), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = test_auth();
        // Mint a token whose expiry is well past the validation leeway.
        let claims = Claims {
            sub: "Authentication".to_string(),
            iss: "relaychat".to_string(),
            aud: "relaychat-clients".to_string(),
            exp: Utc::now().timestamp() - 3600,
            id: Uuid::new_v4().to_string(),
            email: "ada@example.com".to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert_eq!(auth.verify(&token), None);
    }

    #[test]
    fn test_password_hash_is_stable_hex() {
        let h = hash_password("hunter2");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_password("hunter2"));
        assert_ne!(h, hash_password("hunter3"));
    }
}
