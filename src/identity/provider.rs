use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info};

use super::gate::AuthGate;
use super::principal::{Role, UserId};
use crate::error::{AppError, AppResult};
use crate::security;
use crate::storage::{NewUser, StoreError, User, UserStore};

const MAX_LOGIN_LEN: usize = 25;
const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
}

fn invalid_request() -> AppError { AppError::user("invalid_request", "invalid request") }

fn invalid_credentials() -> AppError { AppError::auth("invalid_credentials", "invalid login or password") }

async fn hash_blocking(password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || security::hash_password(&password))
        .await
        .map_err(|e| AppError::internal("password_hash".to_string(), e.to_string()))?
        .map_err(|e| {
            error!(target: "auth", "password hashing failed: {}", e);
            AppError::internal("password_hash", "failed to hash password")
        })
}

/// Registration, login, logout and profile maintenance on top of the identity
/// store and the token gate.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    gate: AuthGate,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserStore>, gate: AuthGate) -> Self { Self { users, gate } }

    pub fn gate(&self) -> &AuthGate { &self.gate }

    pub async fn register(&self, req: RegisterRequest) -> AppResult<LoginResponse> {
        let name = req.name.trim();
        let login = req.login.trim();
        if name.is_empty() || login.is_empty() || req.password.is_empty() {
            return Err(invalid_request());
        }
        if login.chars().count() > MAX_LOGIN_LEN || name.chars().count() > MAX_NAME_LEN {
            return Err(invalid_request());
        }
        if self.users.find_by_login(login).await?.is_some() {
            return Err(AppError::conflict("login_taken", "login already exists"));
        }
        let password_hash = hash_blocking(req.password).await?;
        let new_user = NewUser { name: name.to_string(), login: login.to_string(), password_hash, role: Role::User };
        let user = match self.users.create(new_user).await {
            Ok(u) => u,
            Err(StoreError::Conflict(_)) => return Err(AppError::conflict("login_taken", "login already exists")),
            Err(e) => {
                error!(target: "auth", "failed to create user: {}", e);
                return Err(AppError::internal("user_create", "failed to create user"));
            }
        };
        let token = self.gate.issuer().issue(user.id, user.role)?;
        info!(target: "auth", user_id = user.id, "user registered");
        Ok(LoginResponse { user, token })
    }

    pub async fn login(&self, req: LoginRequest) -> AppResult<LoginResponse> {
        let Some(user) = self.users.find_by_login(req.login.trim()).await? else {
            debug!(target: "auth", "login rejected: unknown login");
            return Err(invalid_credentials());
        };
        let hash = user.password_hash.clone();
        let password = req.password;
        let ok = tokio::task::spawn_blocking(move || security::verify_password(&hash, &password))
            .await
            .map_err(|e| AppError::internal("password_verify".to_string(), e.to_string()))?;
        if !ok {
            debug!(target: "auth", user_id = user.id, "login rejected: bad password");
            return Err(invalid_credentials());
        }
        let token = self.gate.issuer().issue(user.id, user.role)?;
        info!(target: "auth", user_id = user.id, "user logged in");
        Ok(LoginResponse { user, token })
    }

    /// Blacklist `token` for the full token validity window. Expired but
    /// correctly signed tokens are still accepted here.
    pub async fn logout(&self, token: &str) -> AppResult<()> {
        let claims = self.gate.issuer().verify_ignoring_expiry(token)?;
        let ttl = self.gate.issuer().ttl();
        if let Err(e) = self.gate.blacklist().revoke(token, ttl).await {
            error!(target: "auth", user_id = claims.user_id, error = %e, "failed to blacklist token");
            return Err(AppError::internal("revocation_store", "failed to blacklist token"));
        }
        info!(target: "auth", user_id = claims.user_id, "user logged out");
        Ok(())
    }

    pub async fn profile(&self, user_id: UserId) -> AppResult<User> {
        self.users.find_by_id(user_id).await?.ok_or_else(|| AppError::not_found("user_not_found", "user not found"))
    }

    /// Empty fields leave the stored value untouched.
    pub async fn update_profile(&self, user_id: UserId, update: ProfileUpdate) -> AppResult<User> {
        let mut user = self.profile(user_id).await?;
        if let Some(name) = update.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            if name.chars().count() > MAX_NAME_LEN {
                return Err(invalid_request());
            }
            user.name = name.to_string();
        }
        if let Some(password) = update.password.filter(|p| !p.is_empty()) {
            user.password_hash = hash_blocking(password).await?;
        }
        self.users.update(&user).await.map_err(|e| match e {
            StoreError::NotFound(_) => AppError::not_found("user_not_found", "user not found"),
            other => {
                error!(target: "auth", user_id, "failed to update profile: {}", other);
                AppError::internal("profile_update", "failed to update profile")
            }
        })?;
        Ok(user)
    }
}
