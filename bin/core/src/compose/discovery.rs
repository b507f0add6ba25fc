use std::{path::PathBuf, str::FromStr};

use anyhow::Context;
use indexmap::IndexMap;
use mungos::mongodb::bson::doc;
use tidewatch_client::{
  api::SyncSummary,
  entities::{
    container::{
      Container, DiscoveredContainer, HealthCheckMethod,
      Registry, UpdatePolicy, UpdateScope, sanitize_labels,
      valid_container_name,
    },
    tidewatch_timestamp,
  },
};
use tokio::fs;

use crate::{
  docker::ContainerSummary, helpers::oid, state::State,
};

/// Walks the compose directory, parses every service, merges in
/// daemon state, and upserts the container fleet.
pub async fn sync_containers(
  state: &State,
) -> anyhow::Result<SyncSummary> {
  let compose_files =
    collect_compose_files(&state.config.compose_dir).await?;

  let running = state
    .docker
    .list_containers()
    .await
    .unwrap_or_else(|e| {
      warn!("daemon unavailable during sync | {e:#}");
      Vec::new()
    });

  let mut discovered = Vec::new();
  for file in &compose_files {
    match parse_compose_file(file, &running).await {
      Ok(mut containers) => discovered.append(&mut containers),
      Err(e) => {
        warn!("failed to parse {file:?} | {e:#}");
      }
    }
  }

  let mut summary = SyncSummary {
    total: discovered.len(),
    ..Default::default()
  };

  for record in discovered {
    match upsert_container(state, record).await {
      Ok(UpsertResult::Added) => summary.added += 1,
      Ok(UpsertResult::Updated) => summary.updated += 1,
      Ok(UpsertResult::Unchanged) => summary.unchanged += 1,
      Err(e) => {
        warn!("failed to sync container | {e:#}");
      }
    }
  }

  Ok(summary)
}

async fn collect_compose_files(
  root: &std::path::Path,
) -> anyhow::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut stack = vec![root.to_path_buf()];
  while let Some(dir) = stack.pop() {
    let mut entries = match fs::read_dir(&dir).await {
      Ok(entries) => entries,
      Err(e) => {
        warn!("cannot read {dir:?} | {e}");
        continue;
      }
    };
    while let Some(entry) = entries
      .next_entry()
      .await
      .context("failed to walk compose directory")?
    {
      let path = entry.path();
      if path.is_dir() {
        stack.push(path);
      } else if matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml") | Some("yaml")
      ) {
        files.push(path);
      }
    }
  }
  files.sort();
  Ok(files)
}

async fn parse_compose_file(
  path: &std::path::Path,
  running: &[ContainerSummary],
) -> anyhow::Result<Vec<DiscoveredContainer>> {
  let contents = fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read {path:?}"))?;
  let parsed: serde_yaml_ng::Value =
    serde_yaml_ng::from_str(&contents)
      .with_context(|| format!("{path:?} is not valid yaml"))?;

  let Some(serde_yaml_ng::Value::Mapping(services)) =
    parsed.get("services")
  else {
    return Ok(Vec::new());
  };

  let mut discovered = Vec::new();

  for (key, service) in services {
    let Some(service_name) = key.as_str() else {
      continue;
    };
    let Some(image) =
      service.get("image").and_then(|image| image.as_str())
    else {
      continue;
    };

    let labels = super::service_labels(service)
      .into_iter()
      .filter_map(|label| {
        label
          .split_once('=')
          .map(|(k, v)| (k.to_string(), v.to_string()))
      })
      .collect::<IndexMap<_, _>>();

    if labels
      .get("tidewatch.enabled")
      .map(|v| v == "false")
      .unwrap_or(false)
    {
      continue;
    }

    let name = service
      .get("container_name")
      .and_then(|name| name.as_str())
      .unwrap_or(service_name)
      .to_string();
    if !valid_container_name(&name) {
      warn!("skipping service with invalid name: {name}");
      continue;
    }

    let (registry, repository, tag) =
      Registry::parse_image(image);

    // The running container wins for project and current tag.
    let daemon = running.iter().find(|summary| {
      summary.name == name
        || summary.compose_service.as_deref()
          == Some(service_name)
          && summary.image.starts_with(&repository)
    });
    let compose_project = daemon
      .and_then(|summary| summary.compose_project.clone())
      .unwrap_or_default();
    let current_tag = daemon
      .map(|summary| {
        Registry::parse_image(&summary.image).2
      })
      .unwrap_or(tag);

    let policy = labels
      .get("tidewatch.policy")
      .and_then(|v| UpdatePolicy::from_str(v).ok());
    let scope = labels
      .get("tidewatch.scope")
      .and_then(|v| UpdateScope::from_str(v).ok());
    let include_prereleases = labels
      .get("tidewatch.include_prereleases")
      .and_then(|v| v.parse::<bool>().ok());
    let vulnforge_enabled = labels
      .get("tidewatch.vulnforge")
      .and_then(|v| v.parse::<bool>().ok());
    let health_check_url = labels
      .get("tidewatch.health_check_url")
      .cloned()
      .or_else(|| {
        super::extract_health_url(service, service_name)
      });
    let health_check_method = labels
      .get("tidewatch.health_check_method")
      .and_then(|v| HealthCheckMethod::from_str(v).ok());

    discovered.push(DiscoveredContainer {
      name,
      image: repository,
      current_tag,
      registry,
      compose_file: path.display().to_string(),
      compose_project,
      service_name: service_name.to_string(),
      policy_from_compose: policy.is_some(),
      scope_from_compose: scope.is_some(),
      policy,
      scope,
      include_prereleases,
      vulnforge_enabled,
      enabled: None,
      health_check_url,
      health_check_method,
      labels: sanitize_labels(labels),
    });
  }

  Ok(discovered)
}

enum UpsertResult {
  Added,
  Updated,
  Unchanged,
}

async fn upsert_container(
  state: &State,
  record: DiscoveredContainer,
) -> anyhow::Result<UpsertResult> {
  let existing = state
    .db
    .containers
    .find_one(doc! { "name": &record.name })
    .await
    .context("failed to query container by name")?;

  let Some(existing) = existing else {
    let container = container_from_record(&record);
    state
      .db
      .containers
      .insert_one(&container)
      .await
      .context("failed to insert discovered container")?;
    info!("discovered new container {}", record.name);
    return Ok(UpsertResult::Added);
  };

  // Fields the compose file / daemon own outright.
  let mut set = mungos::mongodb::bson::Document::new();
  if existing.image != record.image {
    set.insert("image", &record.image);
  }
  if existing.current_tag != record.current_tag {
    set.insert("current_tag", &record.current_tag);
  }
  if existing.compose_file != record.compose_file {
    set.insert("compose_file", &record.compose_file);
  }
  if existing.service_name != record.service_name {
    set.insert("service_name", &record.service_name);
  }
  if !record.compose_project.is_empty()
    && existing.compose_project != record.compose_project
  {
    set.insert("compose_project", &record.compose_project);
  }
  if existing.registry != record.registry {
    set.insert("registry", record.registry.as_ref());
  }

  // Label-sourced settings override stored config only while
  // the label is present in the compose file.
  if record.policy_from_compose
    && let Some(policy) = record.policy
    && existing.policy != policy
  {
    set.insert("policy", policy.as_ref());
  }
  if record.scope_from_compose
    && let Some(scope) = record.scope
    && existing.scope != scope
  {
    set.insert("scope", scope.as_ref());
  }
  if let Some(vulnforge) = record.vulnforge_enabled
    && existing.vulnforge_enabled != vulnforge
  {
    set.insert("vulnforge_enabled", vulnforge);
  }
  if let Some(include) = record.include_prereleases
    && existing.include_prereleases != Some(include)
  {
    set.insert("include_prereleases", include);
  }
  if existing.health_check_url.is_none()
    && let Some(url) = &record.health_check_url
  {
    set.insert("health_check_url", url);
  }

  let labels = mungos::mongodb::bson::to_bson(&record.labels)
    .context("labels are not valid bson")?;
  if existing.labels != record.labels {
    set.insert("labels", labels);
  }

  if set.is_empty() {
    return Ok(UpsertResult::Unchanged);
  }

  set.insert("updated_at", tidewatch_timestamp());
  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&existing.id)? },
      doc! { "$set": set },
    )
    .await
    .context("failed to update container from sync")?;
  Ok(UpsertResult::Updated)
}

fn container_from_record(
  record: &DiscoveredContainer,
) -> Container {
  Container::builder()
    .name(record.name.clone())
    .image(record.image.clone())
    .current_tag(record.current_tag.clone())
    .registry(record.registry)
    .compose_file(record.compose_file.clone())
    .compose_project(record.compose_project.clone())
    .service_name(record.service_name.clone())
    .policy(record.policy.unwrap_or_default())
    .scope(record.scope.unwrap_or_default())
    .include_prereleases(record.include_prereleases)
    .vulnforge_enabled(
      record.vulnforge_enabled.unwrap_or_default(),
    )
    .health_check_url(record.health_check_url.clone())
    .health_check_method(
      record.health_check_method.unwrap_or_default(),
    )
    .labels(record.labels.clone())
    .created_at(tidewatch_timestamp())
    .updated_at(tidewatch_timestamp())
    .build()
    .expect("container builder covers required fields")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn parses_services_and_tidewatch_labels() {
    let dir =
      std::env::temp_dir().join("tidewatch-discovery-test");
    fs::create_dir_all(&dir).await.unwrap();
    let file = dir.join("stack.yml");
    fs::write(
      &file,
      r#"
services:
  web:
    image: nginx:1.25.0
    labels:
      - tidewatch.policy=auto
      - tidewatch.scope=minor
      - tidewatch.vulnforge=true
  hidden:
    image: redis:7
    labels:
      - tidewatch.enabled=false
  plain:
    container_name: custom-name
    image: ghcr.io/owner/app:v2.1
"#,
    )
    .await
    .unwrap();

    let discovered =
      parse_compose_file(&file, &[]).await.unwrap();
    assert_eq!(discovered.len(), 2);

    let web = &discovered[0];
    assert_eq!(web.name, "web");
    assert_eq!(web.image, "nginx");
    assert_eq!(web.current_tag, "1.25.0");
    assert_eq!(web.policy, Some(UpdatePolicy::Auto));
    assert!(web.policy_from_compose);
    assert_eq!(web.scope, Some(UpdateScope::Minor));
    assert_eq!(web.vulnforge_enabled, Some(true));

    let plain = &discovered[1];
    assert_eq!(plain.name, "custom-name");
    assert_eq!(plain.registry, Registry::Ghcr);
    assert_eq!(plain.image, "owner/app");
    assert_eq!(plain.current_tag, "v2.1");
    assert!(!plain.policy_from_compose);
  }

  #[tokio::test]
  async fn daemon_state_wins_for_current_tag() {
    let dir =
      std::env::temp_dir().join("tidewatch-discovery-test2");
    fs::create_dir_all(&dir).await.unwrap();
    let file = dir.join("web.yml");
    fs::write(
      &file,
      "services:\n  web:\n    image: nginx:1.25.0\n",
    )
    .await
    .unwrap();

    let running = vec![ContainerSummary {
      name: "web".to_string(),
      image: "nginx:1.25.3".to_string(),
      state: "running".to_string(),
      compose_project: Some("edge".to_string()),
      compose_service: Some("web".to_string()),
      labels: Default::default(),
    }];
    let discovered =
      parse_compose_file(&file, &running).await.unwrap();
    assert_eq!(discovered[0].current_tag, "1.25.3");
    assert_eq!(discovered[0].compose_project, "edge");
  }
}
