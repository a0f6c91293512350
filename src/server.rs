//!
//! comet-gateway HTTP server
//! -------------------------
//! Axum router, request handlers and process wiring for the gateway.
//!
//! Route groups:
//! - Public (`/api/users/registration`, `/api/users/login`): behind the
//!   public-route guard, so a caller holding a live session is turned away.
//! - Session (`/api/users/logout`): any authenticated principal.
//! - Members (`/api/users/profile`, `/api/comets/orbit`): `user` or `admin`.
//!
//! Issued tokens travel both as `Authorization: Bearer` and as the
//! `access_token` cookie. Store handles are built once in `build_state` and
//! shared through `AppState`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{
    block_authenticated, extract_token, require_auth, AuthGate, AuthService, Blacklist, LoginRequest, LoginResponse,
    MemoryRevocationStore, Principal, ProfileUpdate, RedisRevocationStore, RegisterRequest, RevocationStore, Role,
    RoleGate, TokenIssuer, ACCESS_COOKIE,
};
use crate::orbit::{parse_time, ObservationReq, OrbitClient, OrbitElements, MIN_OBSERVATIONS};
use crate::storage::{
    photo_object_key, Comet, CometId, CometStore, FsPhotoStore, MemoryStore, NewObservation, PgStore, PhotoStore,
    UserStore,
};

const DEFAULT_COMET_NAME: &str = "Unnamed comet";
const REVOCATION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub comets: Arc<dyn CometStore>,
    pub photos: Arc<dyn PhotoStore>,
    pub orbit: OrbitClient,
}

pub fn build_router(state: AppState) -> Router {
    let gate = state.auth.gate().clone();

    let public = Router::new()
        .route("/api/users/registration", post(register))
        .route("/api/users/login", post(login))
        .route_layer(middleware::from_fn_with_state(gate.clone(), block_authenticated));

    let session = Router::new()
        .route("/api/users/logout", post(logout))
        .route_layer(middleware::from_fn_with_state(RoleGate::new(gate.clone(), &[]), require_auth));

    let members = Router::new()
        .route("/api/users/profile", get(get_profile).put(update_profile))
        .route("/api/comets/orbit", post(calculate_orbit))
        .route_layer(middleware::from_fn_with_state(RoleGate::new(gate, &[Role::User, Role::Admin]), require_auth));

    Router::new()
        .route("/", get(|| async { "comet-gateway ok" }))
        .merge(public)
        .merge(session)
        .merge(members)
        .with_state(state)
}

/// Malformed JSON of any kind is a 400, not axum's default 415/422.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(v)| v).map_err(|e| {
        debug!(target: "http", "rejected request body: {}", e);
        AppError::user("invalid_request", "invalid request")
    })
}

fn header_value(s: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(s).map_err(|e| AppError::internal("header".to_string(), e.to_string()))
}

/// The cookie expires together with the token it carries.
fn access_cookie(token: &str, ttl: Duration) -> AppResult<HeaderValue> {
    header_value(&format!("{}={}; Max-Age={}; HttpOnly; SameSite=Strict; Path=/", ACCESS_COOKIE, token, ttl.as_secs()))
}

fn clear_access_cookie() -> HeaderValue {
    HeaderValue::from_static("access_token=; Max-Age=0; HttpOnly; SameSite=Strict; Path=/")
}

#[derive(Debug, Serialize)]
struct IssuedBody {
    id: i64,
    login: String,
    role: Role,
}

fn issued(out: LoginResponse, ttl: Duration) -> AppResult<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {}", out.token))?);
    headers.insert(header::SET_COOKIE, access_cookie(&out.token, ttl)?);
    let body = IssuedBody { id: out.user.id, login: out.user.login, role: out.user.role };
    Ok((StatusCode::OK, headers, Json(body)).into_response())
}

async fn register(State(state): State<AppState>, payload: Result<Json<RegisterRequest>, JsonRejection>) -> AppResult<Response> {
    let out = state.auth.register(json_body(payload)?).await?;
    issued(out, state.auth.gate().issuer().ttl())
}

async fn login(State(state): State<AppState>, payload: Result<Json<LoginRequest>, JsonRejection>) -> AppResult<Response> {
    let out = state.auth.login(json_body(payload)?).await?;
    issued(out, state.auth.gate().issuer().ttl())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let token = extract_token(&headers).ok_or_else(|| AppError::auth("unauthenticated", "no token provided"))?;
    state.auth.logout(&token).await?;
    let mut h = HeaderMap::new();
    h.insert(header::SET_COOKIE, clear_access_cookie());
    Ok((StatusCode::OK, h, Json(serde_json::json!({"message": "logged out"}))).into_response())
}

async fn get_profile(State(state): State<AppState>, Extension(principal): Extension<Principal>) -> AppResult<Response> {
    let user = state.auth.profile(principal.user_id).await?;
    Ok(Json(serde_json::json!({"name": user.name, "login": user.login})).into_response())
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<ProfileUpdate>, JsonRejection>,
) -> AppResult<Response> {
    let user = state.auth.update_profile(principal.user_id, json_body(payload)?).await?;
    Ok(Json(user).into_response())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoUpload {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64 (standard alphabet) file contents.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrbitRequest {
    /// Recompute for an existing comet instead of creating a new one.
    #[serde(default)]
    pub comet_id: Option<CometId>,
    #[serde(default)]
    pub name: Option<String>,
    pub observations: Vec<ObservationReq>,
    #[serde(default)]
    pub photo: Option<PhotoUpload>,
}

#[derive(Debug, Serialize)]
struct OrbitResponse {
    comet_id: CometId,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<String>,
    #[serde(flatten)]
    orbit: OrbitElements,
}

fn to_new_observations(obs: &[ObservationReq]) -> AppResult<Vec<NewObservation>> {
    obs.iter()
        .map(|o| {
            let observed_at = parse_time(&o.time)
                .ok_or_else(|| AppError::user("invalid_observation".to_string(), format!("invalid observation time: {}", o.time)))?;
            Ok(NewObservation { ra: o.ra, dec: o.dec, observed_at, notes: String::new() })
        })
        .collect()
}

/// Upload errors are logged and swallowed; the orbit request goes on without a photo.
async fn attach_photo(state: &AppState, comet: &Comet, filename: &str, content_type: &str, bytes: &[u8]) -> Option<String> {
    if let Some(old) = state.photos.key_from_url(&comet.image_url) {
        if let Err(e) = state.photos.delete(&old).await {
            warn!(target: "photos", comet_id = comet.id, key = %old, "failed to delete previous photo: {}", e);
        }
    }
    let key = photo_object_key(filename);
    let url = match state.photos.put(&key, content_type, bytes).await {
        Ok(url) => url,
        Err(e) => {
            warn!(target: "photos", comet_id = comet.id, key = %key, "photo upload failed: {}", e);
            return None;
        }
    };
    if let Err(e) = state.comets.set_comet_image_url(comet.id, &url).await {
        warn!(target: "photos", comet_id = comet.id, "failed to record photo url: {}", e);
        return None;
    }
    Some(url)
}

async fn calculate_orbit(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<OrbitRequest>, JsonRejection>,
) -> AppResult<Response> {
    let req = json_body(payload)?;
    if req.observations.len() < MIN_OBSERVATIONS {
        return Err(AppError::user(
            "not_enough_observations".to_string(),
            format!("at least {} observations are required", MIN_OBSERVATIONS),
        ));
    }
    let observations = to_new_observations(&req.observations)?;
    let photo = match &req.photo {
        Some(p) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(p.data.trim())
                .map_err(|_| AppError::user("invalid_photo", "photo data is not valid base64"))?;
            let content_type = p.content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
            Some((p.filename.clone(), content_type, bytes))
        }
        None => None,
    };

    let comet = match req.comet_id {
        Some(id) => state.comets.get_comet(id).await?.ok_or_else(|| AppError::not_found("comet_not_found", "comet not found"))?,
        None => {
            let name = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty()).unwrap_or(DEFAULT_COMET_NAME);
            state.comets.create_comet(name).await?
        }
    };
    state.comets.add_observations(comet.id, &observations).await?;

    let mut image_url = (!comet.image_url.is_empty()).then(|| comet.image_url.clone());
    if let Some((filename, content_type, bytes)) = photo {
        if let Some(url) = attach_photo(&state, &comet, &filename, &content_type, &bytes).await {
            image_url = Some(url);
        }
    }

    let orbit = state.orbit.calculate(&req.observations).await?;
    match orbit.to_update() {
        Some(update) => state.comets.set_comet_orbit(comet.id, &update).await?,
        None => warn!(target: "orbit", comet_id = comet.id, t = %orbit.time_of_perihelion, "unparsable perihelion time, elements not stored"),
    }
    info!(target: "orbit", comet_id = comet.id, user_id = principal.user_id, "orbit calculated");
    Ok(Json(OrbitResponse { comet_id: comet.id, image_url, orbit }).into_response())
}

/// Build every store handle named by `cfg`. Falls back to in-process stores
/// when no database or redis host is configured.
pub async fn build_state(cfg: &Config) -> anyhow::Result<AppState> {
    let issuer = TokenIssuer::new(&cfg.jwt.access_secret, cfg.jwt.access_ttl).context("While creating the token issuer")?;

    let revocations: Arc<dyn RevocationStore> = if cfg.redis.is_in_memory() {
        let mem = Arc::new(MemoryRevocationStore::new());
        // Redis expires entries on its own; the in-process store needs a sweeper.
        let mem_for_sweep = mem.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REVOCATION_SWEEP_INTERVAL).await;
                let removed = mem_for_sweep.sweep();
                if removed > 0 { debug!(target: "auth", removed, "revocation_sweep"); }
            }
        });
        info!(target: "startup", "using in-process revocation store");
        mem as Arc<dyn RevocationStore>
    } else {
        let store = RedisRevocationStore::connect(&cfg.redis)
            .await
            .with_context(|| format!("While connecting to redis at {}:{}", cfg.redis.host, cfg.redis.port))?;
        Arc::new(store)
    };
    let gate = AuthGate::new(issuer, Blacklist::new(revocations, cfg.redis.op_timeout));

    let (users, comets): (Arc<dyn UserStore>, Arc<dyn CometStore>) = match &cfg.database_url {
        Some(url) => {
            let pg = Arc::new(PgStore::connect(url).await.context("While connecting to postgres")?);
            pg.migrate().await.context("While applying the schema")?;
            (pg.clone() as Arc<dyn UserStore>, pg as Arc<dyn CometStore>)
        }
        None => {
            info!(target: "startup", "DATABASE_URL not set, keeping records in memory");
            let mem = Arc::new(MemoryStore::new());
            (mem.clone() as Arc<dyn UserStore>, mem as Arc<dyn CometStore>)
        }
    };

    let photos = FsPhotoStore::open(&cfg.photos.root, &cfg.photos.bucket, &cfg.photos.public_base)
        .await
        .with_context(|| format!("While opening the photo store under {}", cfg.photos.root))?;
    let orbit = OrbitClient::new(&cfg.orbit).context("While creating the orbit service client")?;

    Ok(AppState { auth: AuthService::new(users, gate), comets, photos: Arc::new(photos), orbit })
}

pub async fn run_with_config(cfg: Config) -> anyhow::Result<()> {
    let state = build_state(&cfg).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.service_host, cfg.service_port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cfg.service_host, cfg.service_port))?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
