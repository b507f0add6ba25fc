use std::{path::Path, time::Duration};

use anyhow::{Context, anyhow};
use command::run_tidewatch_command;
use mungos::{
  by_id::find_one_by_id,
  mongodb::bson::{Bson, doc},
};
use serde_json::json;
use tidewatch_client::{
  api::ActionResponse,
  entities::{
    Log,
    alerter::AlertData,
    container::Container,
    event::{EventKind, UpdatePhase},
    history::{
      DataBackupStatus, HistoryStatus, UpdateHistory, UpdateType,
    },
    tidewatch_timestamp,
    update::{Update, UpdateStatus},
  },
};

use crate::{
  alert, backup, compose,
  helpers::{is_duplicate_key_error, oid},
  scan, settings,
  state::{AppState, State},
};

pub mod health;
pub mod rollback;

const PULL_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const UP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DATA_BACKUP_BUDGET: Duration = Duration::from_secs(300);

/// Minutes before retry n (1-based): a fixed 5 / 15 / 60 ladder,
/// then multiplied out per extra attempt.
pub fn retry_delay_minutes(
  retry_count: i64,
  backoff_multiplier: i64,
) -> i64 {
  match retry_count {
    ..=1 => 5,
    2 => 15,
    3 => 60,
    n => {
      60 * backoff_multiplier.max(1).pow((n - 3) as u32)
    }
  }
}

/// Runs one compose subcommand against the container's compose
/// file, translated to its host-visible path.
pub async fn compose_exec(
  state: &AppState,
  container: &Container,
  host_path: &Path,
  subcommand: &[&str],
  stage: &str,
  timeout: Duration,
) -> anyhow::Result<Log> {
  let mut argv = settings::docker_compose_argv(state).await?;
  argv.push("-f".to_string());
  argv.push(host_path.display().to_string());
  if !container.compose_project.is_empty() {
    argv.push("-p".to_string());
    argv.push(container.compose_project.clone());
  }
  if let Some(parent) = host_path.parent() {
    let env_file = parent.join(".env");
    if std::fs::metadata(&env_file).is_ok() {
      argv.push("--env-file".to_string());
      argv.push(env_file.display().to_string());
    }
  }
  argv.extend(subcommand.iter().map(|s| s.to_string()));

  let envs = [(
    "DOCKER_HOST".to_string(),
    state.config.docker_host.clone(),
  )];
  Ok(run_tidewatch_command(stage, &argv, &envs, timeout).await)
}

/// Backfills `compose_project` from the running container's
/// compose label when the row doesn't carry one yet.
async fn ensure_compose_project(
  state: &AppState,
  container: &mut Container,
) -> anyhow::Result<()> {
  if !container.compose_project.is_empty() {
    return Ok(());
  }
  let Some(project) =
    state.docker.compose_project(&container.name).await?
  else {
    return Ok(());
  };
  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": { "compose_project": &project } },
    )
    .await
    .context("failed to persist compose project")?;
  container.compose_project = project;
  Ok(())
}

/// The concurrency guard: inserting the in_progress row claims
/// the container. The partial unique index turns a race into a
/// duplicate-key error, mapped to a clean rejection.
async fn claim_container(
  state: &AppState,
  update: &Update,
  container: &Container,
  triggered_by: &str,
  update_type: UpdateType,
) -> anyhow::Result<Option<UpdateHistory>> {
  let existing = state
    .db
    .update_history
    .find_one(doc! {
      "container_id": &container.id,
      "status": "in_progress",
    })
    .await
    .context("failed to query in-progress history")?;
  if existing.is_some() {
    return Ok(None);
  }

  let history = UpdateHistory::builder()
    .container_id(container.id.clone())
    .update_id(Some(update.id.clone()))
    .from_tag(update.from_tag.clone())
    .to_tag(update.to_tag.clone())
    .update_type(update_type)
    .event_type("image_update".to_string())
    .status(HistoryStatus::InProgress)
    .started_at(tidewatch_timestamp())
    .triggered_by(triggered_by.to_string())
    .build()
    .context("failed to build history row")?;

  match state.db.update_history.insert_one(&history).await {
    Ok(inserted) => {
      let id = inserted
        .inserted_id
        .as_object_id()
        .map(|id| id.to_hex())
        .unwrap_or_default();
      let mut history = history;
      history.id = id;
      Ok(Some(history))
    }
    Err(e) if is_duplicate_key_error(&e) => Ok(None),
    Err(e) => {
      Err(e).context("failed to insert history row")
    }
  }
}

/// Applies an approved update end to end: backups, compose
/// rewrite, pull, recreate, health check, commit. Every phase
/// publishes progress; any failure lands in
/// [handle_update_failure].
pub async fn apply_update(
  state: &State,
  update_id: &str,
  triggered_by: &str,
  update_type: UpdateType,
) -> anyhow::Result<ActionResponse> {
  let update = find_one_by_id(&state.db.updates, update_id)
    .await
    .context("failed to query update")?
    .context("no update with given id")?;

  if !matches!(
    update.status,
    UpdateStatus::Approved | UpdateStatus::PendingRetry
  ) {
    return Ok(ActionResponse {
      success: false,
      message: format!(
        "update is {}, only approved updates can be applied",
        update.status
      ),
    });
  }

  let mut container =
    find_one_by_id(&state.db.containers, &update.container_id)
      .await
      .context("failed to query container")?
      .context("container for update no longer exists")?;

  ensure_compose_project(state, &mut container).await?;

  let Some(history) = claim_container(
    state,
    &update,
    &container,
    triggered_by,
    update_type,
  )
  .await?
  else {
    return Ok(ActionResponse {
      success: false,
      message: "Another operation is already in progress"
        .to_string(),
    });
  };

  state.events.publish_progress(
    &container.id,
    &container.name,
    UpdatePhase::Starting,
    "in_progress",
    &format!(
      "updating {} from {} to {}",
      container.name, update.from_tag, update.to_tag
    ),
  );

  match run_apply(state, &update, &container, &history).await {
    Ok(()) => {
      commit_success(state, &update, &container, &history).await?;
      Ok(ActionResponse {
        success: true,
        message: format!(
          "{} updated to {}",
          container.name, update.to_tag
        ),
      })
    }
    Err(e) => {
      let message = handle_update_failure(
        state, &update, &container, &history, &e,
      )
      .await?;
      Ok(ActionResponse {
        success: false,
        message,
      })
    }
  }
}

/// The fallible middle of the state machine. Returns Err on the
/// first failed phase; the caller owns cleanup.
async fn run_apply(
  state: &State,
  update: &Update,
  container: &Container,
  history: &UpdateHistory,
) -> anyhow::Result<()> {
  let progress = |phase: UpdatePhase, message: &str| {
    state.events.publish_progress(
      &container.id,
      &container.name,
      phase,
      "in_progress",
      message,
    );
  };

  // Compose file backup.
  progress(UpdatePhase::BackupCompose, "backing up compose file");
  let compose_path = compose::validate_compose_path(
    &container.compose_file,
    &[state.config.compose_dir.clone()],
  )?;
  let backup_path = compose::backup_compose_file(
    &compose_path,
    &state.config.data_dir.join("backups"),
  )
  .await?;
  state
    .db
    .update_history
    .update_one(
      doc! { "_id": oid(&history.id)? },
      doc! { "$set": {
        "backup_path": backup_path.display().to_string(),
      } },
    )
    .await
    .context("failed to store backup path")?;

  // Best-effort data backup. Failure is recorded, not fatal.
  progress(UpdatePhase::DataBackup, "backing up data volumes");
  let (data_backup_id, data_backup_status) =
    match backup::create_backup(
      state,
      &container.name,
      Some(DATA_BACKUP_BUDGET),
    )
    .await
    {
      Ok(outcome) => (outcome.backup_id, outcome.status),
      Err(e) => {
        warn!(
          "data backup failed for {} | {e:#}",
          container.name
        );
        (String::new(), DataBackupStatus::Failed)
      }
    };
  state
    .db
    .update_history
    .update_one(
      doc! { "_id": oid(&history.id)? },
      doc! { "$set": {
        "data_backup_id": &data_backup_id,
        "data_backup_status": data_backup_status.as_ref(),
      } },
    )
    .await
    .context("failed to store data backup result")?;

  // Mutate the compose file.
  progress(
    UpdatePhase::ComposeMutated,
    &format!("setting image tag to {}", update.to_tag),
  );
  compose::rewrite_compose_file(
    &compose_path,
    &container.service_name,
    &update.to_tag,
  )
  .await?;

  let host_path = compose::translate_to_host_path(
    &compose_path,
    &state.config.compose_dir,
    &state.config.compose_host_base,
  )?;

  // Pull the new image.
  progress(UpdatePhase::Pulling, "pulling image");
  let pull_log = compose_exec(
    state,
    container,
    &host_path,
    &["pull", &container.service_name],
    "Compose Pull",
    PULL_TIMEOUT,
  )
  .await?;
  if !pull_log.success {
    return Err(anyhow!(
      "compose pull failed: {}",
      pull_log.stderr.trim()
    ));
  }

  // Recreate the service. Stop failures are ignored, the
  // container may simply not be running.
  progress(UpdatePhase::Deploying, "recreating service");
  let stop_log = compose_exec(
    state,
    container,
    &host_path,
    &["stop", &container.service_name],
    "Compose Stop",
    UP_TIMEOUT,
  )
  .await?;
  if !stop_log.success {
    debug!(
      "compose stop reported failure for {} (ignored): {}",
      container.name,
      stop_log.stderr.trim()
    );
  }
  let up_log = compose_exec(
    state,
    container,
    &host_path,
    &[
      "up",
      "-d",
      "--no-deps",
      "--force-recreate",
      &container.service_name,
    ],
    "Compose Up",
    UP_TIMEOUT,
  )
  .await?;
  if !up_log.success {
    return Err(anyhow!(
      "compose up failed: {}",
      up_log.stderr.trim()
    ));
  }

  // Verify the new container is healthy.
  progress(UpdatePhase::HealthCheck, "verifying health");
  let exponential = settings::get_bool(
    state,
    "health_check_use_exponential_backoff",
    true,
  )
  .await?;
  let outcome =
    health::check_health(state, container, exponential).await;
  info!(
    "health check for {} via {}: {}",
    container.name, outcome.method, outcome.message
  );
  if !outcome.healthy {
    return Err(anyhow!(
      "health check failed via {}: {}",
      outcome.method,
      outcome.message
    ));
  }

  Ok(())
}

async fn commit_success(
  state: &State,
  update: &Update,
  container: &Container,
  history: &UpdateHistory,
) -> anyhow::Result<()> {
  state.events.publish_progress(
    &container.id,
    &container.name,
    UpdatePhase::Committing,
    "in_progress",
    "recording update",
  );

  // Digest-kind updates keep the `latest` tag but track the new
  // manifest digest.
  let new_digest = if container.current_tag == "latest" {
    state
      .registries
      .tag_metadata(container.registry, &container.image, "latest")
      .await
      .ok()
      .and_then(|metadata| metadata.digest)
  } else {
    None
  };

  let mut set = doc! {
    "current_tag": &update.to_tag,
    "update_available": false,
    "latest_tag": Bson::Null,
    "last_updated": tidewatch_timestamp(),
    "updated_at": tidewatch_timestamp(),
  };
  if let Some(digest) = &new_digest {
    set.insert("current_digest", digest);
  }
  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": set },
    )
    .await
    .context("failed to commit container tag")?;

  state
    .db
    .update_history
    .update_one(
      doc! { "_id": oid(&history.id)? },
      doc! { "$set": {
        "status": "success",
        "can_rollback": true,
        "completed_at": tidewatch_timestamp(),
      } },
    )
    .await
    .context("failed to finalize history")?;

  state
    .db
    .updates
    .update_one(
      doc! { "_id": oid(&update.id)? },
      doc! {
        "$set": {
          "status": "applied",
          "updated_at": tidewatch_timestamp(),
        },
        "$inc": { "version": 1 },
      },
    )
    .await
    .context("failed to mark update applied")?;

  alert::send_alert(
    state,
    AlertData::UpdateApplied {
      container_id: container.id.clone(),
      container_name: container.name.clone(),
      from_tag: update.from_tag.clone(),
      to_tag: update.to_tag.clone(),
    },
  )
  .await;

  if container.vulnforge_enabled {
    if let Err(e) =
      scan::enqueue_scan(state, &container.name, &update.id).await
    {
      warn!(
        "failed to enqueue post-update scan for {} | {e:#}",
        container.name
      );
    }
  }

  if let Err(e) = backup::prune_backups(
    &container.name,
    state.config.data_backup_keep,
  )
  .await
  {
    warn!(
      "failed to prune data backups for {} | {e:#}",
      container.name
    );
  }

  state.events.publish_kind(
    EventKind::UpdateComplete,
    &container.id,
    &container.name,
    json!({
      "status": "success",
      "from_tag": update.from_tag,
      "to_tag": update.to_tag,
    }),
  );

  Ok(())
}

/// The single failure path: restore compose, then either
/// schedule a retry on the 5 / 15 / 60 minute ladder, or (once
/// retries are spent) finalize the history and auto-rollback.
async fn handle_update_failure(
  state: &State,
  update: &Update,
  container: &Container,
  history: &UpdateHistory,
  error: &anyhow::Error,
) -> anyhow::Result<String> {
  let error_text =
    formatting::sanitize_log_text(&format!("{error:#}"));
  error!(
    "update of {} to {} failed | {error_text}",
    container.name, update.to_tag
  );

  // Put the compose file back. One attempt; if this fails the
  // rollback path will try again from the same backup.
  let history_row =
    find_one_by_id(&state.db.update_history, &history.id)
      .await
      .ok()
      .flatten();
  if let Some(backup_path) = history_row
    .as_ref()
    .and_then(|row| row.backup_path.as_deref())
    && let Ok(compose_path) = compose::validate_compose_path(
      &container.compose_file,
      &[state.config.compose_dir.clone()],
    )
  {
    if let Err(e) = compose::restore_compose_file(
      &compose_path,
      Path::new(backup_path),
    )
    .await
    {
      warn!(
        "failed to restore compose file for {} | {e:#}",
        container.name
      );
    }
  }

  let retry_count = update.retry_count + 1;
  let message;

  if retry_count < update.max_retries {
    let delay_minutes = retry_delay_minutes(
      retry_count,
      update.backoff_multiplier,
    );
    let next_retry_at =
      tidewatch_timestamp() + delay_minutes * 60 * 1000;
    state
      .db
      .updates
      .update_one(
        doc! { "_id": oid(&update.id)? },
        doc! { "$set": {
          "status": "pending_retry",
          "retry_count": retry_count,
          "next_retry_at": next_retry_at,
          "last_error": &error_text,
          "updated_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to schedule retry")?;
    state
      .db
      .update_history
      .update_one(
        doc! { "_id": oid(&history.id)? },
        doc! { "$set": {
          "status": "failed",
          "completed_at": tidewatch_timestamp(),
          "error_message": &error_text,
        } },
      )
      .await
      .context("failed to finalize history")?;
    message = format!(
      "update failed, retry {retry_count}/{} in {delay_minutes} minutes",
      update.max_retries
    );
  } else {
    // Exhausted. Finalize the history row FIRST so the
    // concurrency guard opens for the rollback's own compose
    // operations.
    state
      .db
      .update_history
      .update_one(
        doc! { "_id": oid(&history.id)? },
        doc! { "$set": {
          "status": "failed",
          "completed_at": tidewatch_timestamp(),
          "error_message": &error_text,
        } },
      )
      .await
      .context("failed to finalize history")?;

    // The persisted row carries the backup ids written during
    // the apply; the in-memory claim does not.
    let persisted_history =
      history_row.clone().unwrap_or_else(|| history.clone());
    let rolled_back = match rollback::auto_rollback(
      state,
      container,
      &persisted_history,
    )
    .await
    {
      Ok(()) => true,
      Err(e) => {
        error!(
          "auto-rollback failed for {} | {e:#}",
          container.name
        );
        false
      }
    };

    let final_status =
      if rolled_back { "rolled_back" } else { "failed" };
    state
      .db
      .updates
      .update_one(
        doc! { "_id": oid(&update.id)? },
        doc! { "$set": {
          "status": final_status,
          "retry_count": retry_count,
          "last_error": &error_text,
          "updated_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to finalize update")?;
    message = format!(
      "update failed after {} attempts, {}",
      update.max_retries,
      if rolled_back {
        "rolled back"
      } else {
        "rollback also failed"
      }
    );
  }

  alert::send_alert(
    state,
    AlertData::UpdateFailed {
      container_id: container.id.clone(),
      container_name: container.name.clone(),
      from_tag: update.from_tag.clone(),
      to_tag: update.to_tag.clone(),
      error: error_text.clone(),
    },
  )
  .await;

  state.events.publish_kind(
    EventKind::UpdateComplete,
    &container.id,
    &container.name,
    json!({
      "status": "failed",
      "error": error_text,
    }),
  );

  Ok(message)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retry_ladder_5_15_60_then_multiplied() {
    assert_eq!(retry_delay_minutes(1, 3), 5);
    assert_eq!(retry_delay_minutes(2, 3), 15);
    assert_eq!(retry_delay_minutes(3, 3), 60);
    assert_eq!(retry_delay_minutes(4, 3), 180);
    assert_eq!(retry_delay_minutes(5, 3), 540);
    assert_eq!(retry_delay_minutes(4, 2), 120);
  }
}
