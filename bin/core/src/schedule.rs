use std::{
  collections::{HashMap, HashSet},
  str::FromStr,
  time::Duration,
};

use anyhow::{Context, anyhow};
use async_timing_util::Timelength;
use chrono::{DateTime, Local};
use command::run_tidewatch_command;
use futures::future::join_all;
use mungos::{
  find::find_collect,
  mongodb::bson::doc,
};
use serde_json::json;
use tidewatch_client::entities::{
  container::Container, history::UpdateType,
  tidewatch_timestamp, update::Update,
};

use crate::{
  backup, checker, deps, engine, settings, state::State,
};

const AUTO_APPLY_OFFSET_MS: u128 = 500;

/// Parses a 5-field cron expression and returns the next
/// occurrence in unix ms, honoring the configured timezone.
pub fn find_next_occurrence(
  schedule: &str,
  timezone: &str,
) -> anyhow::Result<i64> {
  let cron = croner::Cron::from_str(schedule)
    .with_context(|| {
      format!("Failed to parse CRON schedule '{schedule}'")
    })?;
  let next = if timezone.is_empty() {
    let now = Local::now();
    cron
      .find_next_occurrence(&now, false)
      .context("Failed to find next run time")?
      .timestamp_millis()
  } else {
    let tz: chrono_tz::Tz = timezone
      .parse()
      .map_err(|e| anyhow!("Failed to parse timezone | {e:?}"))?;
    let now = Local::now().with_timezone(&tz);
    cron
      .find_next_occurrence(&now, false)
      .context("Failed to find next run time")?
      .timestamp_millis()
  };
  Ok(next)
}

/// Whether a cron expression matches the given instant, used for
/// per-container update windows.
pub fn cron_matches_now(
  schedule: &str,
  timezone: &str,
  now_ms: i64,
) -> anyhow::Result<bool> {
  let cron = croner::Cron::from_str(schedule)
    .with_context(|| {
      format!("Failed to parse CRON window '{schedule}'")
    })?;
  let now = DateTime::from_timestamp_millis(now_ms)
    .context("invalid timestamp")?;
  if timezone.is_empty() {
    Ok(cron.is_time_matching(&now.with_timezone(&Local))?)
  } else {
    let tz: chrono_tz::Tz = timezone
      .parse()
      .map_err(|e| anyhow!("Failed to parse timezone | {e:?}"))?;
    Ok(cron.is_time_matching(&now.with_timezone(&tz))?)
  }
}

/// The cron-driven update check. Re-reads the schedule every
/// minute so a settings change takes effect without restart:
/// when the string differs, the next occurrence is simply
/// recomputed (the old schedule is dropped).
pub fn spawn_update_check_loop(state: State) {
  tokio::spawn(async move {
    let mut active_schedule = String::new();
    let mut next_run: Option<i64> = None;

    loop {
      let now = async_timing_util::wait_until_timelength(
        Timelength::OneMinute,
        0,
      )
      .await as i64;

      let schedule =
        match settings::update_check_schedule(&state).await {
          Ok(schedule) => schedule,
          Err(e) => {
            error!("failed to read update schedule | {e:#}");
            continue;
          }
        };

      if schedule != active_schedule || next_run.is_none() {
        match find_next_occurrence(
          &schedule,
          &state.config.timezone,
        ) {
          Ok(next) => {
            info!(
              "update check scheduled '{schedule}', next run in {}s",
              (next - now) / 1000
            );
            active_schedule = schedule.clone();
            next_run = Some(next);
          }
          Err(e) => {
            error!("invalid update check schedule | {e:#}");
            continue;
          }
        }
      }

      if next_run.map(|next| now >= next).unwrap_or(false) {
        info!("running scheduled update check");
        let summary = checker::check_all_containers(&state).await;
        info!(
          "update check complete: {} checked, {} updates, {} errors",
          summary.checked, summary.updates_found, summary.errors
        );
        if let Err(e) = settings::set(
          &state,
          "scheduler_last_check",
          json!(tidewatch_timestamp()),
          "scheduler",
        )
        .await
        {
          warn!("failed to persist last check time | {e:#}");
        }
        next_run = find_next_occurrence(
          &active_schedule,
          &state.config.timezone,
        )
        .ok();
      }
    }
  });
}

/// The 5-minute auto-apply pass.
pub fn spawn_auto_apply_loop(state: State) {
  tokio::spawn(async move {
    loop {
      async_timing_util::wait_until_timelength(
        Timelength::FiveMinutes,
        AUTO_APPLY_OFFSET_MS,
      )
      .await;
      if let Err(e) = auto_apply_tick(&state).await {
        error!("auto apply tick failed | {e:#}");
      }
    }
  });
}

/// Collects approved updates (plus retries that came due),
/// orders the batch along the container dependency graph, honors
/// per-container update windows, and applies up to the
/// configured concurrency per tick.
pub async fn auto_apply_tick(state: &State) -> anyhow::Result<()> {
  if !settings::auto_update_enabled(state).await? {
    return Ok(());
  }

  let now = tidewatch_timestamp();
  let mut due: Vec<Update> = find_collect(
    &state.db.updates,
    doc! {
      "scope_violation": false,
      "$or": [
        { "status": "approved" },
        {
          "status": "pending_retry",
          "next_retry_at": { "$lte": now },
        },
      ],
    },
    None,
  )
  .await
  .context("failed to collect due updates")?;

  if due.is_empty() {
    return Ok(());
  }

  // Oldest decision first; this is also the fallback order when
  // the dependency sort fails.
  due.sort_by_key(|update| update.created_at);

  // Load the batch's containers up front: the dependency sort
  // needs the whole graph slice before windows and the
  // concurrency cap trim it.
  let mut containers: HashMap<String, Container> = HashMap::new();
  for update in &due {
    if containers.contains_key(&update.container_id) {
      continue;
    }
    if let Ok(Some(container)) = mungos::by_id::find_one_by_id(
      &state.db.containers,
      &update.container_id,
    )
    .await
    {
      containers.insert(update.container_id.clone(), container);
    }
  }
  due.retain(|update| {
    containers.contains_key(&update.container_id)
  });

  // Dependencies update before their dependents. A cycle keeps
  // the creation order instead of skipping the tick.
  let graph = containers
    .values()
    .map(|container| {
      (container.name.clone(), container.dependencies.clone())
    })
    .collect::<Vec<_>>();
  match deps::update_order(&graph) {
    Ok(order) => {
      let position = order
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), index))
        .collect::<HashMap<_, _>>();
      due.sort_by_key(|update| {
        containers
          .get(&update.container_id)
          .and_then(|container| position.get(&container.name))
          .copied()
          .unwrap_or(usize::MAX)
      });
    }
    Err(e) => {
      warn!(
        "dependency ordering failed, keeping creation order | {e:#}"
      );
    }
  }

  let updating_names = containers
    .values()
    .map(|container| container.name.clone())
    .collect::<HashSet<_>>();

  let max_concurrent =
    settings::auto_update_max_concurrent(state).await?;
  let mut batch: Vec<(Update, UpdateType)> = Vec::new();

  for update in due {
    if batch.len() >= max_concurrent {
      break;
    }
    let container = &containers[&update.container_id];
    if let Some(window) = &container.update_window
      && !window.is_empty()
    {
      match cron_matches_now(
        window,
        &state.config.timezone,
        now,
      ) {
        Ok(true) => {}
        Ok(false) => {
          debug!(
            "skipping {} (outside update window '{window}')",
            container.name
          );
          continue;
        }
        Err(e) => {
          warn!(
            "invalid update window on {} | {e:#}",
            container.name
          );
          continue;
        }
      }
    }
    // A dependent riding the same batch as one of its
    // dependencies is recorded as a dependency update.
    let update_type = if container.dependencies.iter().any(
      |dep| {
        dep != &container.name && updating_names.contains(dep)
      },
    ) {
      UpdateType::DependencyUpdate
    } else {
      UpdateType::Auto
    };
    batch.push((update, update_type));
  }

  if batch.is_empty() {
    return Ok(());
  }
  info!("auto-applying {} updates", batch.len());

  let handles = batch.into_iter().map(|(update, update_type)| {
    let state = state.clone();
    async move {
      match engine::apply_update(
        &state,
        &update.id,
        "scheduler",
        update_type,
      )
      .await
      {
        Ok(response) if !response.success => {
          warn!(
            "auto apply of update {} declined: {}",
            update.id, response.message
          );
        }
        Ok(_) => {}
        Err(e) => {
          error!(
            "auto apply of update {} errored | {e:#}",
            update.id
          );
        }
      }
    }
  });
  join_all(handles).await;

  Ok(())
}

/// Daily housekeeping: alert retention, finished scan jobs, data
/// backup pruning, tag cache sweep.
pub fn spawn_maintenance_loop(state: State) {
  tokio::spawn(async move {
    loop {
      async_timing_util::wait_until_timelength(
        Timelength::OneDay,
        1000,
      )
      .await;
      if let Err(e) = maintenance_tick(&state).await {
        error!("maintenance tick failed | {e:#}");
      }
    }
  });
}

async fn maintenance_tick(state: &State) -> anyhow::Result<()> {
  let cutoff = tidewatch_timestamp()
    - state.config.metrics_retention_days * 24 * 60 * 60 * 1000;

  let alerts = state
    .db
    .alerts
    .delete_many(doc! { "ts": { "$lt": cutoff } })
    .await
    .context("failed to prune alerts")?;
  let scans = state
    .db
    .pending_scans
    .delete_many(doc! {
      "status": { "$in": ["completed", "failed"] },
      "created_at": { "$lt": cutoff },
    })
    .await
    .context("failed to prune scan jobs")?;
  debug!(
    "maintenance pruned {} alerts, {} scan jobs",
    alerts.deleted_count, scans.deleted_count
  );

  let containers =
    find_collect(&state.db.containers, None, None)
      .await
      .context("failed to list containers for prune")?;
  for container in containers {
    if let Err(e) = backup::prune_backups(
      &container.name,
      state.config.data_backup_keep,
    )
    .await
    {
      warn!(
        "backup prune failed for {} | {e:#}",
        container.name
      );
    }
  }

  let swept = state.registries.sweep_cache().await;
  debug!("maintenance swept {swept} expired tag cache entries");

  Ok(())
}

/// Optional host cleanup on its own cron. Disabled unless a
/// schedule is configured.
pub fn spawn_docker_cleanup_loop(state: State) {
  if state.config.docker_cleanup_schedule.is_empty() {
    return;
  }
  tokio::spawn(async move {
    let schedule = state.config.docker_cleanup_schedule.clone();
    let mut next_run =
      find_next_occurrence(&schedule, &state.config.timezone)
        .ok();
    loop {
      let now = async_timing_util::wait_until_timelength(
        Timelength::OneMinute,
        0,
      )
      .await as i64;
      if next_run.map(|next| now >= next).unwrap_or(false) {
        let log = run_tidewatch_command(
          "Docker Cleanup",
          &[
            "docker".to_string(),
            "system".to_string(),
            "prune".to_string(),
            "-f".to_string(),
          ],
          &[(
            "DOCKER_HOST".to_string(),
            state.config.docker_host.clone(),
          )],
          Duration::from_secs(10 * 60),
        )
        .await;
        if log.success {
          info!("docker cleanup complete");
        } else {
          warn!(
            "docker cleanup failed: {}",
            log.stderr.trim()
          );
        }
        next_run =
          find_next_occurrence(&schedule, &state.config.timezone)
            .ok();
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_standard_cron() {
    let next =
      find_next_occurrence("0 */6 * * *", "").unwrap();
    assert!(next > tidewatch_timestamp());
    assert!(find_next_occurrence("not a cron", "").is_err());
  }

  #[test]
  fn window_matching() {
    // A window covering every minute always matches.
    assert!(
      cron_matches_now("* * * * *", "", tidewatch_timestamp())
        .unwrap()
    );
    assert!(
      cron_matches_now(
        "bad window",
        "",
        tidewatch_timestamp()
      )
      .is_err()
    );
  }
}
