#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::{
  cors::{Any, CorsLayer},
  services::{ServeDir, ServeFile},
};

mod alert;
mod api;
mod backup;
mod changelog;
mod checker;
mod compose;
mod config;
mod decision;
mod deps;
mod docker;
mod engine;
mod events;
mod helpers;
mod registry;
mod restart;
mod scan;
mod schedule;
mod settings;
mod state;
mod version;
mod vulnforge;
mod ws;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let core_config = config::load_core_config()?;
  logger::init(&core_config.logging)?;

  info!(
    "TideWatch Core version: v{}",
    env!("CARGO_PKG_VERSION")
  );
  if core_config.pretty_startup_config {
    info!("{:#?}", core_config.sanitized());
  } else {
    info!("{:?}", core_config.sanitized());
  }

  // Crash here on a broken db / daemon config rather than limp.
  let state = state::AppState::new(core_config).await?;
  if let Err(e) = state.docker.ping().await {
    warn!("docker daemon not reachable on startup | {e:#}");
  }

  // Discover the fleet before any scheduler fires.
  match compose::discovery::sync_containers(&state).await {
    Ok(summary) => info!(
      "startup sync: {} added, {} updated, {} unchanged",
      summary.added, summary.updated, summary.unchanged
    ),
    Err(e) => warn!("startup container sync failed | {e:#}"),
  }

  // Spawn background tasks
  schedule::spawn_update_check_loop(state.clone());
  schedule::spawn_auto_apply_loop(state.clone());
  schedule::spawn_maintenance_loop(state.clone());
  schedule::spawn_docker_cleanup_loop(state.clone());
  restart::spawn_restart_supervisor(state.clone());
  restart::spawn_restart_cleanup_loop(state.clone());
  scan::spawn_scan_worker(state.clone());

  // Setup static frontend services
  let frontend_path = &state.config.frontend_path;
  let frontend_index =
    ServeFile::new(format!("{frontend_path}/index.html"));
  let serve_frontend = ServeDir::new(frontend_path)
    .not_found_service(frontend_index.clone());

  let app = Router::new()
    .merge(api::router(state.clone()))
    .nest("/ws", ws::router(state.clone()))
    .fallback_service(serve_frontend)
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .into_make_service();

  let addr = format!(
    "{}:{}",
    state.config.bind_ip, state.config.port
  );
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  if state.config.ssl_enabled {
    info!("🔒 Core SSL Enabled");
    info!("TideWatch Core starting on https://{socket_addr}");
    let ssl_config = RustlsConfig::from_pem_file(
      &state.config.ssl_cert_file,
      &state.config.ssl_key_file,
    )
    .await
    .context("Invalid ssl cert / key")?;
    axum_server::bind_rustls(socket_addr, ssl_config)
      .serve(app)
      .await
      .context("failed to start https server")
  } else {
    info!("🔓 Core SSL Disabled");
    info!("TideWatch Core starting on http://{socket_addr}");
    axum_server::bind(socket_addr)
      .serve(app)
      .await
      .context("failed to start http server")
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
