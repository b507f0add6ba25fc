use anyhow::{Context, anyhow};
use mungos::{
  by_id::find_one_by_id,
  mongodb::bson::doc,
};
use serde_json::json;
use tidewatch_client::{
  api::ActionResponse,
  entities::{
    alerter::AlertData,
    container::Container,
    event::EventKind,
    history::{DataBackupStatus, HistoryStatus, UpdateHistory},
    tidewatch_timestamp,
  },
};

use super::{UP_TIMEOUT, compose_exec};
use crate::{
  alert, backup, compose,
  helpers::oid,
  state::State,
};

/// Rollback invoked by the engine itself after retries are
/// exhausted. The compose file was already restored; this
/// re-pins the tag, restores data when a good backup exists,
/// and recreates the service.
pub async fn auto_rollback(
  state: &State,
  container: &Container,
  history: &UpdateHistory,
) -> anyhow::Result<()> {
  run_rollback(state, container, history).await
}

/// Operator-requested rollback of a completed update. Guards:
/// the history row must be rollbackable, not already rolled
/// back, and the container must still run the tag that apply
/// produced (drift guard).
pub async fn rollback_update(
  state: &State,
  history_id: &str,
) -> anyhow::Result<ActionResponse> {
  let history =
    find_one_by_id(&state.db.update_history, history_id)
      .await
      .context("failed to query history")?
      .context("no history record with given id")?;

  if !history.can_rollback {
    return Ok(ActionResponse {
      success: false,
      message: "this update cannot be rolled back".to_string(),
    });
  }
  if history.status == HistoryStatus::RolledBack {
    return Ok(ActionResponse {
      success: false,
      message: "update was already rolled back".to_string(),
    });
  }

  let container =
    find_one_by_id(&state.db.containers, &history.container_id)
      .await
      .context("failed to query container")?
      .context("container no longer exists")?;

  if container.current_tag != history.to_tag {
    return Ok(ActionResponse {
      success: false,
      message: format!(
        "container drifted: running {} but rollback expects {}",
        container.current_tag, history.to_tag
      ),
    });
  }

  // The in-progress guard applies to rollbacks too.
  let in_progress = state
    .db
    .update_history
    .find_one(doc! {
      "container_id": &container.id,
      "status": "in_progress",
    })
    .await
    .context("failed to query in-progress history")?;
  if in_progress.is_some() {
    return Ok(ActionResponse {
      success: false,
      message: "Another operation is already in progress"
        .to_string(),
    });
  }

  run_rollback(state, &container, &history).await?;
  Ok(ActionResponse {
    success: true,
    message: format!(
      "{} rolled back to {}",
      container.name, history.from_tag
    ),
  })
}

async fn run_rollback(
  state: &State,
  container: &Container,
  history: &UpdateHistory,
) -> anyhow::Result<()> {
  state.events.publish_kind(
    EventKind::RollbackStarted,
    &container.id,
    &container.name,
    json!({
      "from_tag": history.to_tag,
      "to_tag": history.from_tag,
    }),
  );

  let compose_path = compose::validate_compose_path(
    &container.compose_file,
    &[state.config.compose_dir.clone()],
  )?;
  compose::rewrite_compose_file(
    &compose_path,
    &container.service_name,
    &history.from_tag,
  )
  .await
  .context("failed to re-pin compose file")?;

  let host_path = compose::translate_to_host_path(
    &compose_path,
    &state.config.compose_dir,
    &state.config.compose_host_base,
  )?;

  let restore_data = history.data_backup_status
    == Some(DataBackupStatus::Success)
    && history
      .data_backup_id
      .as_ref()
      .map(|id| !id.is_empty())
      .unwrap_or(false);

  if restore_data {
    let backup_id = history.data_backup_id.as_deref().unwrap();

    // Data restore requires the target stopped.
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
        "compose stop reported failure during rollback of {} \
         (ignored): {}",
        container.name,
        stop_log.stderr.trim()
      );
    }

    let restored = backup::restore::restore_backup(
      state,
      &container.name,
      backup_id,
    )
    .await
    .context("staged data restore failed")?;
    info!(
      "restored {restored} mounts for {} from backup {backup_id}",
      container.name
    );
  }

  let up_log = compose_exec(
    state,
    container,
    &host_path,
    &["up", "-d", "--force-recreate", &container.service_name],
    "Compose Up",
    UP_TIMEOUT,
  )
  .await?;
  if !up_log.success {
    return Err(anyhow!(
      "compose up failed during rollback: {}",
      up_log.stderr.trim()
    ));
  }

  // PostgreSQL restore runs against the recreated container.
  if restore_data {
    let backup_id = history.data_backup_id.as_deref().unwrap();
    match backup::restore::restore_postgres(
      state,
      &container.name,
      backup_id,
    )
    .await
    {
      Ok(true) => {
        info!("postgres dump restored for {}", container.name)
      }
      Ok(false) => {}
      Err(e) => {
        warn!(
          "postgres restore failed for {} | {e:#}",
          container.name
        );
      }
    }
  }

  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": {
        "current_tag": &history.from_tag,
        "updated_at": tidewatch_timestamp(),
      } },
    )
    .await
    .context("failed to reset container tag")?;

  state
    .db
    .update_history
    .update_one(
      doc! { "_id": oid(&history.id)? },
      doc! { "$set": {
        "status": "rolled_back",
        "rolled_back_at": tidewatch_timestamp(),
      } },
    )
    .await
    .context("failed to finalize history")?;

  alert::send_alert(
    state,
    AlertData::RolledBack {
      container_id: container.id.clone(),
      container_name: container.name.clone(),
      from_tag: history.to_tag.clone(),
      to_tag: history.from_tag.clone(),
    },
  )
  .await;

  state.events.publish_kind(
    EventKind::RollbackComplete,
    &container.id,
    &container.name,
    json!({
      "restored_tag": history.from_tag,
    }),
  );

  Ok(())
}
