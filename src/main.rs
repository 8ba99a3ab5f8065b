mod alloc;
mod autoconf;
mod config;
mod http;
mod models;
mod params;
mod platform;
mod probe;
mod store;
mod trees;

use crate::config::load_config;
use crate::http::AppState;
use crate::store::{new_shared, DeploymentStore};
use crate::trees::Trees;

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment from .env if present, then logging.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "clusterconf_kernel=info".to_string()),
        )
        .init();

    let cfg = load_config().await;

    if let Some(parent) = std::path::Path::new(&cfg.data_file).parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| warn!("failed to create data dir: {e}"));
    }

    let store = DeploymentStore::new(&cfg.data_file);
    store.load().await?;

    let trees = {
        let dep = store.lock();
        new_shared(Trees::rebuild(&dep))
    };

    let app_state = AppState { store, trees, cfg: cfg.clone(), started: Instant::now() };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
