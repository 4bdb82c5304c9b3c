use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use rusty_hub::auth::{AuthProvider, JwtAuthProvider};
use rusty_hub::config::HubConfig;
use rusty_hub::core::{IdleReaper, MessageRouter};
use rusty_hub::handlers::routes;
use rusty_hub::storage::InMemoryMessageStore;

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let Some(secret) = config.jwt_secret.clone() else {
        error!("RUSTY_HUB_JWT_SECRET must be set");
        std::process::exit(1);
    };

    info!(
        "Configuration: host={}, port={}, shard {}/{}",
        config.host, config.port, config.shard_id, config.shard_count
    );

    let auth: Arc<dyn AuthProvider> = Arc::new(JwtAuthProvider::new(&secret));
    let router = match MessageRouter::builder(config.clone())
        .authorizer(auth.clone())
        .sink(Arc::new(InMemoryMessageStore::new()))
        .build()
        .await
    {
        Ok(router) => router,
        Err(e) => {
            error!("Failed to start message router: {}", e);
            std::process::exit(1);
        }
    };

    let _reaper = IdleReaper::new(router.clone(), &config).spawn();

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Rusty Hub on {} (ws path /{})", addr, config.ws_path);
    warp::serve(routes(router, auth, &config)).run(addr).await;
}
