//! Request-time verification gate and its inverse, the public-route guard.
//!
//! A request moves through token extraction, signature/expiry verification,
//! the blacklist lookup and finally the role check. Each step can reject, and
//! each rejection keeps its own `AuthRejection` variant so logs and tests can
//! tell an invalid token from a revoked one even though both answer 401.
//! The blacklist is consulted only for tokens whose signature already checks out.
//! A blacklist that cannot be reached rejects the request (fail closed).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

use super::principal::{Principal, Role};
use super::revocation::{Blacklist, RevocationError};
use super::token::{TokenError, TokenIssuer};
use crate::error::AppError;

pub const ACCESS_COOKIE: &str = "access_token";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("no token provided")]
    Unauthenticated,
    #[error("invalid token: {0}")]
    InvalidToken(TokenError),
    #[error("token is blacklisted")]
    Revoked,
    #[error("role {0} is not allowed on this route")]
    Forbidden(Role),
    #[error("public route not accessible for authorized users (role {0})")]
    AlreadyAuthenticated(Role),
    #[error("blacklist check failed: {0}")]
    StoreUnavailable(RevocationError),
}

impl From<AuthRejection> for AppError {
    fn from(r: AuthRejection) -> Self {
        match r {
            AuthRejection::Unauthenticated => AppError::auth("unauthenticated", "no token provided"),
            // Invalid and revoked tokens look the same from outside.
            AuthRejection::InvalidToken(_) | AuthRejection::Revoked => AppError::auth("invalid_token", "invalid token"),
            AuthRejection::Forbidden(_) => AppError::forbidden("forbidden", "insufficient permissions"),
            AuthRejection::AlreadyAuthenticated(_) => {
                AppError::forbidden("forbidden", "public route not accessible for authorized users")
            }
            AuthRejection::StoreUnavailable(_) => AppError::internal("revocation_store", "redis error"),
        }
    }
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all("cookie") {
        let Ok(s) = cookie.to_str() else { continue };
        for part in s.split(';') {
            let p = part.trim();
            if let Some((k, v)) = p.split_once('=') {
                if k == name && !v.is_empty() { return Some(v.to_string()); }
            }
        }
    }
    None
}

/// Cookie first, then `Authorization: Bearer`. First one found wins.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(t) = parse_cookie(headers, ACCESS_COOKIE) {
        return Some(t);
    }
    let auth = headers.get("authorization")?.to_str().ok()?;
    let token = auth.strip_prefix(BEARER_PREFIX)?.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

/// Empty allow-list admits any authenticated principal.
pub fn authorize(principal: &Principal, allowed: &[Role]) -> Result<(), AuthRejection> {
    if allowed.is_empty() || allowed.contains(&principal.role) {
        Ok(())
    } else {
        Err(AuthRejection::Forbidden(principal.role))
    }
}

#[derive(Clone)]
pub struct AuthGate {
    issuer: TokenIssuer,
    blacklist: Blacklist,
}

impl AuthGate {
    pub fn new(issuer: TokenIssuer, blacklist: Blacklist) -> Self { Self { issuer, blacklist } }

    pub fn issuer(&self) -> &TokenIssuer { &self.issuer }

    pub fn blacklist(&self) -> &Blacklist { &self.blacklist }

    /// Signature and expiry, then the blacklist.
    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthRejection> {
        let claims = self.issuer.verify(token).map_err(AuthRejection::InvalidToken)?;
        match self.blacklist.is_revoked(token).await {
            Ok(true) => Err(AuthRejection::Revoked),
            Ok(false) => Ok(claims.principal()),
            Err(e) => Err(AuthRejection::StoreUnavailable(e)),
        }
    }

    pub async fn admit(&self, headers: &HeaderMap, allowed: &[Role]) -> Result<Principal, AuthRejection> {
        let token = extract_token(headers).ok_or(AuthRejection::Unauthenticated)?;
        let principal = self.authenticate(&token).await?;
        authorize(&principal, allowed)?;
        Ok(principal)
    }

    /// Anonymous callers pass; callers holding a live privileged token do not.
    pub async fn admit_public(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        let Some(token) = extract_token(headers) else { return Ok(()) };
        let principal = self.authenticate(&token).await?;
        if principal.role.is_privileged() {
            return Err(AuthRejection::AlreadyAuthenticated(principal.role));
        }
        Ok(())
    }
}

/// Gate state for one group of routes.
#[derive(Clone)]
pub struct RoleGate {
    pub gate: AuthGate,
    pub allowed: Arc<[Role]>,
}

impl RoleGate {
    pub fn new(gate: AuthGate, allowed: &[Role]) -> Self { Self { gate, allowed: Arc::from(allowed) } }
}

fn reject(rejection: AuthRejection, path: &str) -> Response {
    match &rejection {
        AuthRejection::StoreUnavailable(e) => error!(target: "auth", path, error = %e, "blacklist unreachable, rejecting request"),
        other => debug!(target: "auth", path, reason = %other, "request rejected"),
    }
    AppError::from(rejection).into_response()
}

/// Middleware for `axum::middleware::from_fn_with_state` guarding authenticated routes.
pub async fn require_auth(State(rg): State<RoleGate>, mut req: Request, next: Next) -> Response {
    match rg.gate.admit(req.headers(), &rg.allowed).await {
        Ok(principal) => {
            debug!(target: "auth", user_id = principal.user_id, role = %principal.role, "request admitted");
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(rejection) => reject(rejection, req.uri().path()),
    }
}

/// Middleware for registration and login.
pub async fn block_authenticated(State(gate): State<AuthGate>, req: Request, next: Next) -> Response {
    match gate.admit_public(req.headers()).await {
        Ok(()) => next.run(req).await,
        Err(rejection) => reject(rejection, req.uri().path()),
    }
}
