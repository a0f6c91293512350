//! Credential issuer: HS256 JSON Web Tokens carrying subject id, role and expiry.
//!
//! Verification is pure computation. Expiry is checked with zero leeway and an
//! `exp` equal to the current second already counts as expired, so a token
//! minted with a zero TTL never verifies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::principal::{Principal, Role, UserId};
use crate::error::AppError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("signing secret is missing or empty")]
    MissingSecret,
    #[error("credentials cannot be issued for role {0}")]
    UnissuableRole(Role),
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::MissingSecret | TokenError::UnissuableRole(_) | TokenError::Signing(_) => {
                AppError::internal("token_issue", "failed to generate token")
            }
            TokenError::Malformed | TokenError::BadSignature | TokenError::Expired => {
                AppError::auth("invalid_token", "invalid token")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub role: Role,
    pub iat: u64,
    pub exp: u64,
    /// Unique per issued token so that revocation targets one session.
    pub jti: String,
}

impl Claims {
    pub fn principal(&self) -> Principal { Principal { user_id: self.user_id, role: self.role } }
}

/// Holds the process-wide signing secret; read-only after construction.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    header: Header,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").field("alg", &self.header.alg).field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self, TokenError> {
        if secret.trim().is_empty() {
            return Err(TokenError::MissingSecret);
        }
        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            header: Header::new(Algorithm::HS256),
            ttl,
        })
    }

    /// Validity window of every issued token; also the blacklist TTL.
    pub fn ttl(&self) -> Duration { self.ttl }

    pub fn issue(&self, user_id: UserId, role: Role) -> Result<String, TokenError> {
        self.issue_at(user_id, role, Utc::now())
    }

    pub fn issue_at(&self, user_id: UserId, role: Role, now: DateTime<Utc>) -> Result<String, TokenError> {
        if !role.is_privileged() {
            return Err(TokenError::UnissuableRole(role));
        }
        let iat = now.timestamp().max(0) as u64;
        let claims = Claims {
            user_id,
            role,
            iat,
            exp: iat + self.ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
        };
        encode(&self.header, &claims, &self.encoding_key).map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Check signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode_with(token, true)?;
        let now = Utc::now().timestamp().max(0) as u64;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Check signature only. Used by logout, where an expired token may still be blacklisted.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode_with(token, false)
    }

    fn decode_with(&self, token: &str, validate_exp: bool) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.header.alg);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_required_spec_claims(&["exp", "iat"]);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            })
    }
}
