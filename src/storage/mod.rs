//!
//! comet-gateway storage module
//! ----------------------------
//! Record types and the collaborator traits for relational persistence of users,
//! comets and observations, plus the photo object store.
//!
//! Two backends implement the record traits:
//! - `MemoryStore`: parking_lot maps, used by tests and by local runs without a database.
//! - `PgStore`: tokio-postgres, used when `DATABASE_URL` is configured.
//!
//! Handlers only ever see `Arc<dyn UserStore>` / `Arc<dyn CometStore>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;
use crate::identity::{Role, UserId};

mod memory;
mod pg;
pub mod photos;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use photos::{photo_object_key, FsPhotoStore, PhotoError, PhotoStore};

pub type CometId = i64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            return StoreError::Conflict("record".to_string());
        }
        StoreError::Backend(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => AppError::conflict("conflict".to_string(), format!("{} already exists", what)),
            StoreError::NotFound(what) => AppError::not_found("not_found".to_string(), format!("{} not found", what)),
            StoreError::Backend(msg) => AppError::internal("storage".to_string(), msg),
        }
    }
}

/// User account. The password hash never leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub login: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub login: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comet {
    pub id: CometId,
    pub name: String,
    pub image_url: String,
    /// Orbit epoch.
    pub epoch: DateTime<Utc>,
    /// Semi-major axis (AU).
    pub a: f64,
    pub e: f64,
    /// Inclination (deg).
    pub i: f64,
    /// Longitude of the ascending node (deg).
    pub node: f64,
    /// Argument of perihelion (deg).
    pub arg_peri: f64,
    /// Time of perihelion passage.
    pub t: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Orbital elements as written back after a successful orbit determination.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitUpdate {
    pub a: f64,
    pub e: f64,
    pub i: f64,
    pub node: f64,
    pub arg_peri: f64,
    pub t: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: i64,
    pub comet_id: CometId,
    /// Right ascension (deg).
    pub ra: f64,
    /// Declination (deg).
    pub dec: f64,
    pub observed_at: DateTime<Utc>,
    pub photo_url: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub ra: f64,
    pub dec: f64,
    pub observed_at: DateTime<Utc>,
    pub notes: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_login(&self, login: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;
    /// Fails with `StoreError::Conflict` when the login is taken.
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;
    async fn update(&self, user: &User) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CometStore: Send + Sync {
    /// New comet with zeroed elements; epoch and perihelion time default to now.
    async fn create_comet(&self, name: &str) -> Result<Comet, StoreError>;
    async fn get_comet(&self, id: CometId) -> Result<Option<Comet>, StoreError>;
    async fn set_comet_image_url(&self, id: CometId, url: &str) -> Result<(), StoreError>;
    async fn set_comet_orbit(&self, id: CometId, orbit: &OrbitUpdate) -> Result<(), StoreError>;
    async fn add_observations(&self, comet_id: CometId, obs: &[NewObservation]) -> Result<Vec<Observation>, StoreError>;
    async fn list_observations(&self, comet_id: CometId) -> Result<Vec<Observation>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_serialization_hides_password_hash() {
        let u = User { id: 1, name: "Alice".into(), login: "alice".into(), password_hash: "$argon2id$secret".into(), role: Role::User };
        let v = serde_json::to_value(&u).unwrap();
        assert!(v.get("password_hash").is_none());
        assert_eq!(v["role"], "user");
    }

    #[test]
    fn store_errors_map_to_http() {
        assert_eq!(AppError::from(StoreError::Conflict("login".into())).http_status(), 409);
        assert_eq!(AppError::from(StoreError::NotFound("user".into())).http_status(), 404);
        assert_eq!(AppError::from(StoreError::Backend("down".into())).http_status(), 500);
    }
}
