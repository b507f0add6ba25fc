use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  API_DEFAULT_VERSION, Docker,
  query_parameters::{
    InspectContainerOptions, ListContainersOptions,
  },
};
use chrono::DateTime;

pub const COMPOSE_PROJECT_LABEL: &str =
  "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str =
  "com.docker.compose.service";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read-only view of the docker daemon. Mutations (compose
/// up / pull / helper containers / exec) go through the `docker`
/// CLI via the command lib instead, so every state change leaves
/// an argv-audit trail in the logs.
pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  pub fn new(docker_host: &str) -> anyhow::Result<DockerClient> {
    let docker = if docker_host.is_empty() {
      Docker::connect_with_defaults()
        .context("failed to connect to docker daemon")?
    } else if let Some(path) =
      docker_host.strip_prefix("unix://")
    {
      Docker::connect_with_unix(
        path,
        CONNECT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to docker at {docker_host}")
      })?
    } else {
      Docker::connect_with_http(
        docker_host,
        CONNECT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("failed to connect to docker at {docker_host}")
      })?
    };
    Ok(DockerClient { docker })
  }

  pub async fn ping(&self) -> anyhow::Result<()> {
    self
      .docker
      .ping()
      .await
      .context("docker daemon did not answer ping")?;
    Ok(())
  }

  pub async fn list_containers(
    &self,
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await
      .context("failed to list containers")?;
    let summaries = containers
      .into_iter()
      .filter_map(|container| {
        let name = container
          .names
          .and_then(|mut names| names.pop())?
          .trim_start_matches('/')
          .to_string();
        let labels = container.labels.unwrap_or_default();
        Some(ContainerSummary {
          compose_project: labels
            .get(COMPOSE_PROJECT_LABEL)
            .cloned(),
          compose_service: labels
            .get(COMPOSE_SERVICE_LABEL)
            .cloned(),
          name,
          image: container.image.unwrap_or_default(),
          state: container
            .state
            .map(|state| state.to_string())
            .unwrap_or_default(),
          labels,
        })
      })
      .collect();
    Ok(summaries)
  }

  /// Runtime state for one container. `exists: false` (rather
  /// than an error) when the daemon doesn't know the name.
  pub async fn inspect(
    &self,
    container_name: &str,
  ) -> anyhow::Result<RuntimeState> {
    let inspection = match self
      .docker
      .inspect_container(
        container_name,
        Option::<InspectContainerOptions>::None,
      )
      .await
    {
      Ok(inspection) => inspection,
      Err(bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        ..
      }) => return Ok(RuntimeState::missing()),
      Err(e) => {
        return Err(e).context("failed to inspect container");
      }
    };

    let mut state = RuntimeState {
      exists: true,
      ..Default::default()
    };

    if let Some(container_state) = inspection.state {
      state.running =
        container_state.running.unwrap_or_default();
      state.status = container_state
        .status
        .map(|status| status.to_string())
        .unwrap_or_default();
      state.exit_code = container_state.exit_code;
      state.oom_killed =
        container_state.oom_killed.unwrap_or_default();
      state.started_at = container_state
        .started_at
        .as_deref()
        .and_then(parse_docker_timestamp);
      state.finished_at = container_state
        .finished_at
        .as_deref()
        .and_then(parse_docker_timestamp);
    }

    if let Some(config) = inspection.config {
      state.image = config.image.unwrap_or_default();
      state.env = config.env.unwrap_or_default();
      state.labels = config.labels.unwrap_or_default();
    }

    state.mounts = inspection
      .mounts
      .unwrap_or_default()
      .into_iter()
      .map(|mount| MountInfo {
        kind: mount
          .typ
          .map(|typ| typ.to_string())
          .unwrap_or_default(),
        volume_name: mount.name,
        source: mount.source.unwrap_or_default(),
        destination: mount.destination.unwrap_or_default(),
        read_only: !mount.rw.unwrap_or(true),
      })
      .collect();

    Ok(state)
  }

  /// The compose project label of a running container, used to
  /// backfill `container.compose_project`.
  pub async fn compose_project(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Option<String>> {
    let state = self.inspect(container_name).await?;
    Ok(state.labels.get(COMPOSE_PROJECT_LABEL).cloned())
  }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
  pub name: String,
  pub image: String,
  pub state: String,
  pub compose_project: Option<String>,
  pub compose_service: Option<String>,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
  pub exists: bool,
  pub running: bool,
  pub status: String,
  pub exit_code: Option<i64>,
  pub oom_killed: bool,
  /// Unix ms, parsed from the daemon's RFC3339 timestamp.
  pub started_at: Option<i64>,
  pub finished_at: Option<i64>,
  pub image: String,
  pub env: Vec<String>,
  pub labels: HashMap<String, String>,
  pub mounts: Vec<MountInfo>,
}

impl RuntimeState {
  fn missing() -> RuntimeState {
    RuntimeState::default()
  }

  /// Value of an environment variable baked into the container.
  pub fn env_var(&self, key: &str) -> Option<&str> {
    let prefix = format!("{key}=");
    self
      .env
      .iter()
      .find_map(|entry| entry.strip_prefix(&prefix))
  }
}

#[derive(Debug, Clone, Default)]
pub struct MountInfo {
  /// `volume` or `bind`.
  pub kind: String,
  pub volume_name: Option<String>,
  pub source: String,
  pub destination: String,
  pub read_only: bool,
}

fn parse_docker_timestamp(ts: &str) -> Option<i64> {
  // The daemon reports zero-value timestamps for never-started
  // containers.
  if ts.is_empty() || ts.starts_with("0001-") {
    return None;
  }
  DateTime::parse_from_rfc3339(ts)
    .ok()
    .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn docker_timestamps() {
    let expected = DateTime::parse_from_rfc3339(
      "2026-07-01T10:00:00.5Z",
    )
    .unwrap()
    .timestamp_millis();
    assert_eq!(
      parse_docker_timestamp("2026-07-01T10:00:00.5Z"),
      Some(expected)
    );
    assert_eq!(
      parse_docker_timestamp("0001-01-01T00:00:00Z"),
      None
    );
    assert_eq!(parse_docker_timestamp(""), None);
  }

  #[test]
  fn env_var_lookup() {
    let state = RuntimeState {
      env: vec![
        "POSTGRES_USER=app".to_string(),
        "POSTGRES_PASSWORD=x".to_string(),
      ],
      ..Default::default()
    };
    assert_eq!(state.env_var("POSTGRES_USER"), Some("app"));
    assert_eq!(state.env_var("MISSING"), None);
  }
}
