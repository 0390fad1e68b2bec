//! Handshake credential verification
//!
//! Every connection presents a token before any other frame. The token's
//! claims carry the stable user id and display name; unauthenticated
//! handshakes are dropped.

use crate::session::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid or expired token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Token missing subject claim")]
    MissingSubject,
}

/// The identity a verified credential resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: UserId,
    pub name: String,
}

/// Verifies a handshake credential and resolves it to an identity
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// JWT claims issued by the account service
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Stable user id
    pub sub: String,
    /// Display name shown in rooms and chat
    #[serde(default)]
    pub name: String,
    pub exp: u64,
}

/// HS256 JWT verifier
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        let name = if data.claims.name.is_empty() {
            data.claims.sub.clone()
        } else {
            data.claims.name
        };
        Ok(Identity {
            user: UserId::new(data.claims.sub),
            name,
        })
    }
}
