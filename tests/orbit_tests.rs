//! Orbit calculation integration tests against an in-process stand-in for the
//! orbit-determination service.

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

use comet_gateway::config::Config;
use comet_gateway::server::{build_router, build_state, AppState};

const HALLEY: &str = r#"{
    "a": 17.834,
    "eccentricity": 0.96714,
    "inclination": 162.26,
    "longitude_of_ascending_node": 58.42,
    "argument_of_perihelion": 111.33,
    "time_of_perihelion": "1986-02-09 11:00:00.000"
}"#;

/// Serves `reply` with `status` on `/calculate-orbit` and returns the URL.
async fn spawn_orbit_service(status: StatusCode, reply: Value) -> Result<String> {
    let app = Router::new().route(
        "/calculate-orbit",
        post(move |Json(req): Json<Value>| {
            let reply = reply.clone();
            async move {
                if req["observations"].as_array().map(|a| a.len()).unwrap_or(0) < 5 {
                    return (StatusCode::BAD_REQUEST, Json(json!({"detail": "too few observations"})));
                }
                (status, Json(reply))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{}/calculate-orbit", addr))
}

struct Env {
    app: Router,
    state: AppState,
    tmp: TempDir,
    token: String,
}

async fn setup(orbit_url: &str) -> Result<Env> {
    let tmp = tempdir()?;
    let mut cfg = Config::in_memory("orbit-secret", &tmp.path().to_string_lossy());
    cfg.orbit.url = orbit_url.to_string();
    let state = build_state(&cfg).await?;
    let app = build_router(state.clone());
    let token = state.auth.gate().issuer().issue(1, comet_gateway::identity::Role::User)?;
    Ok(Env { app, state, tmp, token })
}

fn observations(n: usize) -> Value {
    let obs: Vec<Value> = (0..n)
        .map(|i| json!({"ra": 10.0 + i as f64, "dec": -5.0 + i as f64 * 0.5, "time": format!("2024-01-{:02}T00:00:00", i + 1)}))
        .collect();
    Value::Array(obs)
}

async fn post_orbit(env: &Env, body: Value, with_token: bool) -> Result<(StatusCode, Value)> {
    let mut b = Request::builder().method("POST").uri("/api/comets/orbit").header("content-type", "application/json");
    if with_token {
        b = b.header("authorization", format!("Bearer {}", env.token));
    }
    let resp = env.app.clone().oneshot(b.body(Body::from(body.to_string()))?).await?;
    let status = resp.status();
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok((status, serde_json::from_slice(&bytes).unwrap_or(Value::Null)))
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn orbit_is_computed_and_stored() -> Result<()> {
    let url = spawn_orbit_service(StatusCode::OK, serde_json::from_str(HALLEY)?).await?;
    let env = setup(&url).await?;

    let body = json!({
        "name": "  Halley  ",
        "observations": observations(6),
        "photo": {"filename": "Halley 1P.png", "content_type": "image/png", "data": b64(b"\x89PNG-data")},
    });
    let (status, out) = post_orbit(&env, body, true).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["eccentricity"], 0.96714);
    assert_eq!(out["image_url"], "http://localhost:9000/comets/comet-halley1p.png");
    assert!(env.tmp.path().join("comets").join("comet-halley1p.png").exists());

    let id = out["comet_id"].as_i64().unwrap();
    let comet = env.state.comets.get_comet(id).await?.expect("comet stored");
    assert_eq!(comet.name, "Halley");
    assert_eq!(comet.e, 0.96714);
    assert_eq!(comet.node, 58.42);
    assert_eq!(comet.image_url, "http://localhost:9000/comets/comet-halley1p.png");
    assert_eq!(env.state.comets.list_observations(id).await?.len(), 6);
    Ok(())
}

#[tokio::test]
async fn unnamed_comet_gets_default_name() -> Result<()> {
    let url = spawn_orbit_service(StatusCode::OK, serde_json::from_str(HALLEY)?).await?;
    let env = setup(&url).await?;
    let (status, out) = post_orbit(&env, json!({"observations": observations(5)}), true).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(out.get("image_url").is_none());
    let comet = env.state.comets.get_comet(out["comet_id"].as_i64().unwrap()).await?.unwrap();
    assert_eq!(comet.name, "Unnamed comet");
    Ok(())
}

#[tokio::test]
async fn recompute_replaces_previous_photo() -> Result<()> {
    let url = spawn_orbit_service(StatusCode::OK, serde_json::from_str(HALLEY)?).await?;
    let env = setup(&url).await?;
    let first = json!({
        "name": "Encke",
        "observations": observations(5),
        "photo": {"filename": "first.jpg", "data": b64(b"one")},
    });
    let (_, out) = post_orbit(&env, first, true).await?;
    let id = out["comet_id"].as_i64().unwrap();
    let bucket = env.tmp.path().join("comets");
    assert!(bucket.join("comet-first.jpg").exists());

    let second = json!({
        "comet_id": id,
        "observations": observations(7),
        "photo": {"filename": "second.jpg", "data": b64(b"two")},
    });
    let (status, out) = post_orbit(&env, second, true).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["comet_id"], id);
    assert!(!bucket.join("comet-first.jpg").exists());
    assert!(bucket.join("comet-second.jpg").exists());
    assert_eq!(env.state.comets.list_observations(id).await?.len(), 12);

    let (status, _) = post_orbit(&env, json!({"comet_id": 9999, "observations": observations(5)}), true).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn input_errors_are_bad_requests() -> Result<()> {
    let url = spawn_orbit_service(StatusCode::OK, serde_json::from_str(HALLEY)?).await?;
    let env = setup(&url).await?;

    let (status, out) = post_orbit(&env, json!({"observations": observations(4)}), true).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(out["code"], "not_enough_observations");

    let mut obs = observations(5);
    obs[2]["time"] = json!("last tuesday");
    assert_eq!(post_orbit(&env, json!({"observations": obs}), true).await?.0, StatusCode::BAD_REQUEST);

    let bad_photo = json!({"observations": observations(5), "photo": {"filename": "x.png", "data": "***"}});
    assert_eq!(post_orbit(&env, bad_photo, true).await?.0, StatusCode::BAD_REQUEST);

    assert_eq!(post_orbit(&env, json!({"name": "no observations"}), true).await?.0, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn service_failures_are_bad_gateway() -> Result<()> {
    let url = spawn_orbit_service(StatusCode::OK, json!({"error": "orbit did not converge"})).await?;
    let env = setup(&url).await?;
    let (status, out) = post_orbit(&env, json!({"observations": observations(5)}), true).await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(out["code"], "orbit_service");

    let url = spawn_orbit_service(StatusCode::INTERNAL_SERVER_ERROR, json!({"detail": "boom"})).await?;
    let env = setup(&url).await?;
    assert_eq!(post_orbit(&env, json!({"observations": observations(5)}), true).await?.0, StatusCode::BAD_GATEWAY);

    let env = setup("http://127.0.0.1:1/calculate-orbit").await?;
    assert_eq!(post_orbit(&env, json!({"observations": observations(5)}), true).await?.0, StatusCode::BAD_GATEWAY);
    Ok(())
}

#[tokio::test]
async fn orbit_requires_a_session() -> Result<()> {
    let env = setup("http://127.0.0.1:1/calculate-orbit").await?;
    assert_eq!(post_orbit(&env, json!({"observations": observations(5)}), false).await?.0, StatusCode::UNAUTHORIZED);
    Ok(())
}
