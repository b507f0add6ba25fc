use std::sync::Arc;

use anyhow::Context;
use cache::CloneCache;
use dashmap::DashMap;
use tidewatch_client::entities::{
  config::core::CoreConfig, container::HealthStatus,
};
use tokio::sync::Mutex;

use crate::{
  changelog::ChangelogFetcher,
  docker::DockerClient,
  events::EventBus,
  registry::{RegistryClientSet, RegistryCredentials},
};

pub type State = Arc<AppState>;

/// Every long-lived dependency, constructed once at startup and
/// passed through axum state / task arguments. Nothing in here
/// hides behind a process-global.
pub struct AppState {
  pub config: CoreConfig,
  pub db: database::Client,
  pub events: EventBus,
  pub registries: RegistryClientSet,
  pub docker: DockerClient,
  pub changelogs: ChangelogFetcher,
  /// Serializes data backup / restore per container.
  backup_locks: DashMap<String, Arc<Mutex<()>>>,
  /// Last observed health per container, for the details
  /// endpoint: (status, checked-at unix ms).
  pub health_observations: CloneCache<String, (HealthStatus, i64)>,
}

impl AppState {
  pub async fn new(config: CoreConfig) -> anyhow::Result<State> {
    let db = database::Client::new(&config.database)
      .await
      .context("failed to initialize database client")?;
    let docker = DockerClient::new(&config.docker_host)?;
    let registries =
      RegistryClientSet::new(RegistryCredentials {
        dockerhub_username: config.dockerhub_username.clone(),
        dockerhub_token: config.dockerhub_token.clone(),
        ghcr_username: config.ghcr_username.clone(),
        ghcr_token: config.ghcr_token.clone(),
      });
    let changelogs =
      ChangelogFetcher::new(config.github_token.clone());

    Ok(Arc::new(AppState {
      config,
      db,
      events: EventBus::default(),
      registries,
      docker,
      changelogs,
      backup_locks: DashMap::new(),
      health_observations: CloneCache::default(),
    }))
  }

  /// The per-container lock held across one data backup or
  /// restore operation.
  pub fn backup_lock(
    &self,
    container_name: &str,
  ) -> Arc<Mutex<()>> {
    self
      .backup_locks
      .entry(container_name.to_string())
      .or_default()
      .clone()
  }
}
