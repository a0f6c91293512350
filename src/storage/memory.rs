use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{Comet, CometId, CometStore, NewObservation, NewUser, Observation, OrbitUpdate, StoreError, User, UserStore};
use crate::identity::UserId;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    comets: HashMap<CometId, Comet>,
    observations: Vec<Observation>,
    next_user_id: i64,
    next_comet_id: i64,
    next_observation_id: i64,
}

/// In-process record store. Ids start at 1 and are never reused.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_login(&self, login: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().users.values().find(|u| u.login == login).cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let mut t = self.inner.write();
        if t.users.values().any(|u| u.login == user.login) {
            return Err(StoreError::Conflict("login".to_string()));
        }
        t.next_user_id += 1;
        let created = User { id: t.next_user_id, name: user.name, login: user.login, password_hash: user.password_hash, role: user.role };
        t.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let mut t = self.inner.write();
        if t.users.values().any(|u| u.login == user.login && u.id != user.id) {
            return Err(StoreError::Conflict("login".to_string()));
        }
        match t.users.get_mut(&user.id) {
            Some(slot) => { *slot = user.clone(); Ok(()) }
            None => Err(StoreError::NotFound("user".to_string())),
        }
    }
}

#[async_trait]
impl CometStore for MemoryStore {
    async fn create_comet(&self, name: &str) -> Result<Comet, StoreError> {
        let now = Utc::now();
        let mut t = self.inner.write();
        t.next_comet_id += 1;
        let comet = Comet {
            id: t.next_comet_id,
            name: name.to_string(),
            image_url: String::new(),
            epoch: now,
            a: 0.0,
            e: 0.0,
            i: 0.0,
            node: 0.0,
            arg_peri: 0.0,
            t: now,
            created_at: now,
            updated_at: now,
        };
        t.comets.insert(comet.id, comet.clone());
        Ok(comet)
    }

    async fn get_comet(&self, id: CometId) -> Result<Option<Comet>, StoreError> {
        Ok(self.inner.read().comets.get(&id).cloned())
    }

    async fn set_comet_image_url(&self, id: CometId, url: &str) -> Result<(), StoreError> {
        let mut t = self.inner.write();
        let comet = t.comets.get_mut(&id).ok_or_else(|| StoreError::NotFound("comet".to_string()))?;
        comet.image_url = url.to_string();
        comet.updated_at = Utc::now();
        Ok(())
    }

    async fn set_comet_orbit(&self, id: CometId, orbit: &OrbitUpdate) -> Result<(), StoreError> {
        let mut t = self.inner.write();
        let comet = t.comets.get_mut(&id).ok_or_else(|| StoreError::NotFound("comet".to_string()))?;
        comet.a = orbit.a;
        comet.e = orbit.e;
        comet.i = orbit.i;
        comet.node = orbit.node;
        comet.arg_peri = orbit.arg_peri;
        comet.t = orbit.t;
        comet.updated_at = Utc::now();
        Ok(())
    }

    async fn add_observations(&self, comet_id: CometId, obs: &[NewObservation]) -> Result<Vec<Observation>, StoreError> {
        let now = Utc::now();
        let mut t = self.inner.write();
        if !t.comets.contains_key(&comet_id) {
            return Err(StoreError::NotFound("comet".to_string()));
        }
        let mut out = Vec::with_capacity(obs.len());
        for o in obs {
            t.next_observation_id += 1;
            let row = Observation {
                id: t.next_observation_id,
                comet_id,
                ra: o.ra,
                dec: o.dec,
                observed_at: o.observed_at,
                photo_url: String::new(),
                notes: o.notes.clone(),
                created_at: now,
            };
            t.observations.push(row.clone());
            out.push(row);
        }
        Ok(out)
    }

    async fn list_observations(&self, comet_id: CometId) -> Result<Vec<Observation>, StoreError> {
        Ok(self.inner.read().observations.iter().filter(|o| o.comet_id == comet_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn new_user(login: &str) -> NewUser {
        NewUser { name: login.to_uppercase(), login: login.to_string(), password_hash: "h".into(), role: Role::User }
    }

    #[tokio::test]
    async fn duplicate_login_conflicts() {
        let store = MemoryStore::new();
        let a = store.create(new_user("alice")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(store.create(new_user("alice")).await, Err(StoreError::Conflict("login".into())));
        assert_eq!(store.find_by_login("alice").await.unwrap().map(|u| u.id), Some(1));
    }

    #[tokio::test]
    async fn update_missing_user_is_not_found() {
        let store = MemoryStore::new();
        let ghost = User { id: 99, name: "x".into(), login: "x".into(), password_hash: String::new(), role: Role::User };
        assert_eq!(store.update(&ghost).await, Err(StoreError::NotFound("user".into())));
    }

    #[tokio::test]
    async fn comet_lifecycle() {
        let store = MemoryStore::new();
        let c = store.create_comet("Halley").await.unwrap();
        assert_eq!(c.a, 0.0);
        store.set_comet_image_url(c.id, "http://img/comet-halley.png").await.unwrap();
        let obs = vec![NewObservation { ra: 10.0, dec: -5.0, observed_at: Utc::now(), notes: String::new() }; 3];
        let rows = store.add_observations(c.id, &obs).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(store.list_observations(c.id).await.unwrap().len(), 3);
        let got = store.get_comet(c.id).await.unwrap().unwrap();
        assert_eq!(got.image_url, "http://img/comet-halley.png");
        assert!(store.add_observations(c.id + 1, &obs).await.is_err());
    }
}
