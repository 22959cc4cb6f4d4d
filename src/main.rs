mod auth;
mod config;
mod middleware;

mod billing;
mod db;
mod diagnosis;
mod error;
mod extract;
mod models;
mod pagination;
mod routes;
mod scheduling;

use std::sync::Arc;

use crate::{config::Config, models::AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    if cfg.run_migrations {
        db::run_migrations(&pool).await?;
    }

    if cfg.enforce_doctor_overlap {
        tracing::info!("doctor double-booking checks enabled");
    }

    let state = AppState {
        db: pool,
        jwt_secret: Arc::from(cfg.jwt_secret.as_str()),
        file_server_base_url: Arc::from(cfg.file_server_base_url.as_str()),
        enforce_doctor_overlap: cfg.enforce_doctor_overlap,
    };

    // Browser dashboards are served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
