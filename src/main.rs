use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use comet_gateway::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let cfg = Config::from_env()?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "comet-gateway starting: RUST_LOG='{}', listen={}:{}, token_ttl={}s, redis={}:{}, database={}, photos='{}/{}', orbit_service={}",
        rust_log,
        cfg.service_host,
        cfg.service_port,
        cfg.jwt.access_ttl.as_secs(),
        cfg.redis.host,
        cfg.redis.port,
        if cfg.database_url.is_some() { "postgres" } else { "memory" },
        cfg.photos.root,
        cfg.photos.bucket,
        cfg.orbit.url,
    );

    comet_gateway::server::run_with_config(cfg).await
}
