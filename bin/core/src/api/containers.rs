use std::time::Duration;

use anyhow::{Context, anyhow};
use axum::{
  Json, Router,
  extract::{Path, Query, State},
  routing::{get, post, put},
};
use mungos::{
  by_id::find_one_by_id,
  find::find_collect,
  mongodb::{
    bson::{Bson, Regex, doc},
    options::FindOptions,
  },
};
use reqwest::StatusCode;
use serror::AddStatusCode;
use tidewatch_client::{
  api::{
    ActionResponse, ContainerDetails, ListContainersQuery,
    SyncSummary, UpdateDependenciesBody,
  },
  entities::{
    container::{
      Container, PartialContainer, valid_container_name,
    },
    tidewatch_timestamp,
  },
};

use crate::{
  compose::{self, discovery},
  engine::{compose_exec, health},
  helpers::oid,
  state::State as AppState,
};

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const DETAILS_HISTORY_LIMIT: i64 = 20;

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/", get(list_containers))
    .route("/sync", post(sync))
    .route(
      "/{id}",
      get(get_container)
        .put(update_container)
        .delete(delete_container),
    )
    .route("/{id}/details", get(container_details))
    .route("/{id}/dependencies", put(update_dependencies))
    .route("/{id}/restart", post(restart_container))
}

async fn list_containers(
  State(state): State<AppState>,
  Query(query): Query<ListContainersQuery>,
) -> serror::Result<Json<Vec<Container>>> {
  let mut filter = doc! {};
  if let Some(policy) = query.policy {
    filter.insert("policy", policy.as_ref());
  }
  if let Some(name) = &query.name {
    filter.insert(
      "name",
      Bson::RegularExpression(Regex {
        pattern: regex::escape(name),
        options: "i".to_string(),
      }),
    );
  }
  if let Some(image) = &query.image {
    filter.insert(
      "image",
      Bson::RegularExpression(Regex {
        pattern: regex::escape(image),
        options: "i".to_string(),
      }),
    );
  }
  let containers = find_collect(
    &state.db.containers,
    filter,
    FindOptions::builder()
      .sort(doc! { "name": 1 })
      .skip(query.skip.unwrap_or(0))
      .limit(query.limit.unwrap_or(100).clamp(1, 500))
      .build(),
  )
  .await
  .context("failed to list containers")?;
  Ok(Json(containers))
}

async fn get_container(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<Container>> {
  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to query container")?
    .context("no container with given id")
    .status_code(StatusCode::NOT_FOUND)?;
  Ok(Json(container))
}

async fn update_container(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(partial): Json<PartialContainer>,
) -> serror::Result<Json<Container>> {
  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to query container")?
    .context("no container with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  let mut set = mungos::mongodb::bson::Document::new();
  if let Some(policy) = partial.policy {
    set.insert("policy", policy.as_ref());
  }
  if let Some(scope) = partial.scope {
    set.insert("scope", scope.as_ref());
  }
  if let Some(include) = partial.include_prereleases {
    set.insert(
      "include_prereleases",
      include.map(Bson::Boolean).unwrap_or(Bson::Null),
    );
  }
  if let Some(vulnforge) = partial.vulnforge_enabled {
    set.insert("vulnforge_enabled", vulnforge);
  }
  if let Some(url) = partial.health_check_url {
    set.insert(
      "health_check_url",
      url.map(Bson::String).unwrap_or(Bson::Null),
    );
  }
  if let Some(method) = partial.health_check_method {
    set.insert("health_check_method", method.as_ref());
  }
  if let Some(auth) = partial.health_check_auth {
    set.insert(
      "health_check_auth",
      auth.map(Bson::String).unwrap_or(Bson::Null),
    );
  }
  if let Some(source) = partial.release_source {
    set.insert(
      "release_source",
      source.map(Bson::String).unwrap_or(Bson::Null),
    );
  }
  if let Some(window) = partial.update_window {
    if let Some(window) = &window {
      // reject unparseable windows up front
      crate::schedule::cron_matches_now(
        window,
        &state.config.timezone,
        tidewatch_timestamp(),
      )
      .status_code(StatusCode::BAD_REQUEST)?;
    }
    set.insert(
      "update_window",
      window.map(Bson::String).unwrap_or(Bson::Null),
    );
  }
  if let Some(auto_restart) = partial.auto_restart_enabled {
    set.insert("auto_restart_enabled", auto_restart);
  }

  if set.is_empty() {
    return Ok(Json(container));
  }
  set.insert("updated_at", tidewatch_timestamp());

  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": set },
    )
    .await
    .context("failed to update container")?;

  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to re-query container")?
    .context("container vanished during update")?;
  Ok(Json(container))
}

/// Replaces the container's dependency list. Every name must
/// follow docker naming rules, refer to a tracked container, and
/// not be the container itself. Cycles are allowed here: the
/// auto-apply ordering detects them and falls back to creation
/// order, so a half-entered graph never bricks the endpoint.
async fn update_dependencies(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(body): Json<UpdateDependenciesBody>,
) -> serror::Result<Json<Container>> {
  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to query container")?
    .context("no container with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  let mut dependencies = Vec::new();
  for name in &body.dependencies {
    if !valid_container_name(name) {
      return Err(anyhow!(
        "'{name}' is not a valid container name"
      ))
      .status_code(StatusCode::BAD_REQUEST);
    }
    if name == &container.name {
      return Err(anyhow!(
        "container cannot depend on itself"
      ))
      .status_code(StatusCode::BAD_REQUEST);
    }
    let known = state
      .db
      .containers
      .find_one(doc! { "name": name })
      .await
      .context("failed to query dependency")?;
    if known.is_none() {
      return Err(anyhow!(
        "unknown dependency container '{name}'"
      ))
      .status_code(StatusCode::BAD_REQUEST);
    }
    if !dependencies.contains(name) {
      dependencies.push(name.clone());
    }
  }

  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": {
        "dependencies": &dependencies,
        "updated_at": tidewatch_timestamp(),
      } },
    )
    .await
    .context("failed to update dependencies")?;

  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to re-query container")?
    .context("container vanished during update")?;
  Ok(Json(container))
}

async fn delete_container(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<ActionResponse>> {
  state
    .db
    .cascade_delete_container(&id)
    .await
    .context("failed to delete container")?;
  Ok(Json(ActionResponse {
    success: true,
    message: "container deleted".to_string(),
  }))
}

async fn container_details(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<ContainerDetails>> {
  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to query container")?
    .context("no container with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  let current_update = state
    .db
    .updates
    .find_one(doc! {
      "container_id": &container.id,
      "scope_violation": false,
      "status": { "$in": ["pending", "approved", "pending_retry"] },
    })
    .await
    .context("failed to query current update")?;

  let history = find_collect(
    &state.db.update_history,
    doc! { "container_id": &container.id },
    FindOptions::builder()
      .sort(doc! { "started_at": -1 })
      .limit(DETAILS_HISTORY_LIMIT)
      .build(),
  )
  .await
  .context("failed to query history")?;

  let health_status =
    health::observe_health(&state, &container).await;
  let now = tidewatch_timestamp();
  state
    .health_observations
    .insert(container.id.clone(), (health_status, now))
    .await;

  Ok(Json(ContainerDetails {
    container,
    current_update,
    history,
    health_status,
    last_health_check: Some(now),
  }))
}

async fn sync(
  State(state): State<AppState>,
) -> serror::Result<Json<SyncSummary>> {
  let summary = discovery::sync_containers(&state)
    .await
    .context("container sync failed")?;
  Ok(Json(summary))
}

async fn restart_container(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<ActionResponse>> {
  let container = find_one_by_id(&state.db.containers, &id)
    .await
    .context("failed to query container")?
    .context("no container with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  let compose_path = compose::validate_compose_path(
    &container.compose_file,
    &[state.config.compose_dir.clone()],
  )
  .status_code(StatusCode::BAD_REQUEST)?;
  let host_path = compose::translate_to_host_path(
    &compose_path,
    &state.config.compose_dir,
    &state.config.compose_host_base,
  )?;

  let log = compose_exec(
    &state,
    &container,
    &host_path,
    &["restart", &container.service_name],
    "Compose Restart",
    RESTART_TIMEOUT,
  )
  .await?;

  if log.success {
    Ok(Json(ActionResponse {
      success: true,
      message: format!("{} restarted", container.name),
    }))
  } else {
    Err(
      anyhow!("restart failed: {}", log.stderr.trim()).into(),
    )
  }
}
