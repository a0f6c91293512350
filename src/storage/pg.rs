use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info, warn};

use super::{Comet, CometId, CometStore, NewObservation, NewUser, Observation, OrbitUpdate, StoreError, User, UserStore};
use crate::identity::{Role, UserId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(100) NOT NULL,
    login VARCHAR(25) NOT NULL UNIQUE,
    password VARCHAR(255) NOT NULL,
    role SMALLINT NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS comets (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    image_url TEXT NOT NULL DEFAULT '',
    epoch TIMESTAMPTZ NOT NULL,
    a DOUBLE PRECISION NOT NULL,
    e DOUBLE PRECISION NOT NULL,
    i DOUBLE PRECISION NOT NULL,
    node DOUBLE PRECISION NOT NULL,
    arg_peri DOUBLE PRECISION NOT NULL,
    t TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS observations (
    id BIGSERIAL PRIMARY KEY,
    comet_id BIGINT NOT NULL REFERENCES comets(id),
    ra DOUBLE PRECISION NOT NULL,
    dec DOUBLE PRECISION NOT NULL,
    observed_at TIMESTAMPTZ NOT NULL,
    photo_url TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS observations_comet_id_idx ON observations (comet_id);
CREATE TABLE IF NOT EXISTS close_approaches (
    id BIGSERIAL PRIMARY KEY,
    comet_id BIGINT NOT NULL REFERENCES comets(id),
    closest_date TIMESTAMPTZ NOT NULL,
    distance_au DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS close_approaches_comet_id_idx ON close_approaches (comet_id);
"#;

const COMET_COLUMNS: &str = "id, name, image_url, epoch, a, e, i, node, arg_peri, t, created_at, updated_at";
const OBSERVATION_COLUMNS: &str = "id, comet_id, ra, dec, observed_at, photo_url, notes, created_at";

fn role_to_i16(role: Role) -> i16 {
    match role {
        Role::Guest => 0,
        Role::User => 1,
        Role::Admin => 2,
    }
}

/// Codes outside the closed role set are a data error, never a silent downgrade.
fn role_from_i16(v: i16) -> Result<Role, StoreError> {
    match v {
        0 => Ok(Role::Guest),
        1 => Ok(Role::User),
        2 => Ok(Role::Admin),
        other => Err(StoreError::Backend(format!("unknown role code {}", other))),
    }
}

fn user_from_row(row: &Row) -> Result<User, StoreError> {
    let id: UserId = row.get("id");
    let role = role_from_i16(row.get("role")).map_err(|e| {
        error!(target: "storage", user_id = id, "{}", e);
        e
    })?;
    if role == Role::Guest {
        warn!(target: "storage", user_id = id, "user row carries the guest role and cannot be issued a token");
    }
    Ok(User { id, name: row.get("name"), login: row.get("login"), password_hash: row.get("password"), role })
}

fn comet_from_row(row: &Row) -> Comet {
    Comet {
        id: row.get("id"),
        name: row.get("name"),
        image_url: row.get("image_url"),
        epoch: row.get::<_, DateTime<Utc>>("epoch"),
        a: row.get("a"),
        e: row.get("e"),
        i: row.get("i"),
        node: row.get("node"),
        arg_peri: row.get("arg_peri"),
        t: row.get::<_, DateTime<Utc>>("t"),
        created_at: row.get::<_, DateTime<Utc>>("created_at"),
        updated_at: row.get::<_, DateTime<Utc>>("updated_at"),
    }
}

fn observation_from_row(row: &Row) -> Observation {
    Observation {
        id: row.get("id"),
        comet_id: row.get("comet_id"),
        ra: row.get("ra"),
        dec: row.get("dec"),
        observed_at: row.get::<_, DateTime<Utc>>("observed_at"),
        photo_url: row.get("photo_url"),
        notes: row.get("notes"),
        created_at: row.get::<_, DateTime<Utc>>("created_at"),
    }
}

/// Postgres-backed record store sharing one client connection.
#[derive(Clone)]
pub struct PgStore {
    client: Arc<Client>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "storage", "postgres connection error: {}", e);
            }
        });
        info!(target: "startup", "connected to postgres");
        Ok(Self { client: Arc::new(client) })
    }

    /// Create missing tables. Safe to run on every startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_by_login(&self, login: &str) -> Result<Option<User>, StoreError> {
        let row = self.client.query_opt("SELECT id, name, login, password, role FROM users WHERE login = $1", &[&login]).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = self.client.query_opt("SELECT id, name, login, password, role FROM users WHERE id = $1", &[&id]).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let role = role_to_i16(user.role);
        let row = self
            .client
            .query_one(
                "INSERT INTO users (name, login, password, role) VALUES ($1, $2, $3, $4) RETURNING id, name, login, password, role",
                &[&user.name, &user.login, &user.password_hash, &role],
            )
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict("login".to_string()),
                other => other,
            })?;
        user_from_row(&row)
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let role = role_to_i16(user.role);
        let n = self
            .client
            .execute(
                "UPDATE users SET name = $2, login = $3, password = $4, role = $5 WHERE id = $1",
                &[&user.id, &user.name, &user.login, &user.password_hash, &role],
            )
            .await?;
        if n == 0 { return Err(StoreError::NotFound("user".to_string())); }
        Ok(())
    }
}

#[async_trait]
impl CometStore for PgStore {
    async fn create_comet(&self, name: &str) -> Result<Comet, StoreError> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO comets (name, epoch, a, e, i, node, arg_peri, t) VALUES ($1, $2, 0, 0, 0, 0, 0, $2) RETURNING {}",
            COMET_COLUMNS
        );
        let row = self.client.query_one(sql.as_str(), &[&name, &now]).await?;
        Ok(comet_from_row(&row))
    }

    async fn get_comet(&self, id: CometId) -> Result<Option<Comet>, StoreError> {
        let sql = format!("SELECT {} FROM comets WHERE id = $1", COMET_COLUMNS);
        let row = self.client.query_opt(sql.as_str(), &[&id]).await?;
        Ok(row.as_ref().map(comet_from_row))
    }

    async fn set_comet_image_url(&self, id: CometId, url: &str) -> Result<(), StoreError> {
        let n = self.client.execute("UPDATE comets SET image_url = $2, updated_at = now() WHERE id = $1", &[&id, &url]).await?;
        if n == 0 { return Err(StoreError::NotFound("comet".to_string())); }
        Ok(())
    }

    async fn set_comet_orbit(&self, id: CometId, orbit: &OrbitUpdate) -> Result<(), StoreError> {
        let n = self
            .client
            .execute(
                "UPDATE comets SET a = $2, e = $3, i = $4, node = $5, arg_peri = $6, t = $7, updated_at = now() WHERE id = $1",
                &[&id, &orbit.a, &orbit.e, &orbit.i, &orbit.node, &orbit.arg_peri, &orbit.t],
            )
            .await?;
        if n == 0 { return Err(StoreError::NotFound("comet".to_string())); }
        Ok(())
    }

    async fn add_observations(&self, comet_id: CometId, obs: &[NewObservation]) -> Result<Vec<Observation>, StoreError> {
        let sql = format!(
            "INSERT INTO observations (comet_id, ra, dec, observed_at, notes) VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            OBSERVATION_COLUMNS
        );
        let stmt = self.client.prepare(sql.as_str()).await?;
        let mut out = Vec::with_capacity(obs.len());
        for o in obs {
            let row = self.client.query_one(&stmt, &[&comet_id, &o.ra, &o.dec, &o.observed_at, &o.notes]).await?;
            out.push(observation_from_row(&row));
        }
        Ok(out)
    }

    async fn list_observations(&self, comet_id: CometId) -> Result<Vec<Observation>, StoreError> {
        let sql = format!("SELECT {} FROM observations WHERE comet_id = $1 ORDER BY observed_at", OBSERVATION_COLUMNS);
        let rows = self.client.query(sql.as_str(), &[&comet_id]).await?;
        Ok(rows.iter().map(observation_from_row).collect())
    }
}
