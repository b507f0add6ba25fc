use std::time::Duration;

use anyhow::Context;
use async_timing_util::Timelength;
use mungos::{find::find_collect, mongodb::bson::doc};
use serde_json::json;
use tidewatch_client::entities::{
  alerter::AlertData,
  container::Container,
  event::EventKind,
  restart::RestartState,
  tidewatch_timestamp,
};

use crate::{
  engine::compose_exec,
  helpers::{is_duplicate_key_error, oid},
  state::State,
};

const RESTART_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Whether a stopped container deserves another start. A clean
/// exit that wasn't the OOM killer is intentional and never
/// retried.
pub fn should_retry_restart(
  exit_code: Option<i64>,
  oom_killed: bool,
) -> (bool, String) {
  match (exit_code, oom_killed) {
    (Some(0), false) => (
      false,
      "exited cleanly (code 0), not restarting".to_string(),
    ),
    (Some(code), true) => (
      true,
      format!("killed by OOM (exit {code})"),
    ),
    (Some(code), false) => {
      (true, format!("crashed with exit code {code}"))
    }
    (None, _) => {
      (true, "stopped without an exit code".to_string())
    }
  }
}

/// Exponential delay before attempt `consecutive_failures + 1`,
/// clamped to the configured maximum.
pub fn restart_delay_secs(
  base: u64,
  consecutive_failures: i64,
  max: u64,
) -> u64 {
  base
    .saturating_mul(
      2u64.saturating_pow(consecutive_failures.max(0) as u32),
    )
    .min(max)
}

/// The supervisor loop: one pass over auto-restart containers
/// per configured interval (default 30s).
pub fn spawn_restart_supervisor(state: State) {
  let interval = Duration::from_secs(
    state.config.restart_check_interval_seconds.max(5),
  );
  tokio::spawn(async move {
    loop {
      tokio::time::sleep(interval).await;
      if let Err(e) = tick(&state).await {
        error!("restart supervisor tick failed | {e:#}");
      }
    }
  });
}

/// The hourly cleanup: containers that recovered and stayed up
/// past their success window get their backoff reset.
pub fn spawn_restart_cleanup_loop(state: State) {
  tokio::spawn(async move {
    loop {
      async_timing_util::wait_until_timelength(
        Timelength::OneHour,
        500,
      )
      .await;
      if let Err(e) = cleanup(&state).await {
        error!("restart cleanup failed | {e:#}");
      }
    }
  });
}

pub async fn tick(state: &State) -> anyhow::Result<()> {
  let containers = find_collect(
    &state.db.containers,
    doc! { "auto_restart_enabled": true },
    None,
  )
  .await
  .context("failed to list auto-restart containers")?;

  for container in containers {
    if let Err(e) = handle_container(state, &container).await {
      warn!(
        "restart handling failed for {} | {e:#}",
        container.name
      );
    }
  }
  Ok(())
}

async fn load_or_create_state(
  state: &State,
  container_id: &str,
) -> anyhow::Result<RestartState> {
  if let Some(existing) = state
    .db
    .restart_states
    .find_one(doc! { "container_id": container_id })
    .await
    .context("failed to query restart state")?
  {
    return Ok(existing);
  }
  let fresh = RestartState::builder()
    .container_id(container_id.to_string())
    .build()
    .context("failed to build restart state")?;
  match state.db.restart_states.insert_one(&fresh).await {
    Ok(inserted) => {
      let mut fresh = fresh;
      fresh.id = inserted
        .inserted_id
        .as_object_id()
        .map(|id| id.to_hex())
        .unwrap_or_default();
      Ok(fresh)
    }
    Err(e) if is_duplicate_key_error(&e) => state
      .db
      .restart_states
      .find_one(doc! { "container_id": container_id })
      .await
      .context("failed to re-query restart state")?
      .context("raced restart state vanished"),
    Err(e) => Err(e).context("failed to insert restart state"),
  }
}

async fn handle_container(
  state: &State,
  container: &Container,
) -> anyhow::Result<()> {
  let restart_state =
    load_or_create_state(state, &container.id).await?;

  if !restart_state.enabled || restart_state.max_retries_reached
  {
    return Ok(());
  }
  let now = tidewatch_timestamp();
  if restart_state
    .next_retry_at
    .map(|at| at > now)
    .unwrap_or(false)
  {
    // A restart job is already scheduled.
    return Ok(());
  }

  let runtime = state.docker.inspect(&container.name).await?;
  if !runtime.exists {
    return Ok(());
  }

  if runtime.running {
    let sustained = runtime
      .started_at
      .map(|started| {
        now - started
          > restart_state.success_window_seconds * 1000
      })
      .unwrap_or(false);
    if restart_state.consecutive_failures > 0 && sustained {
      reset_backoff(state, &restart_state).await?;
      info!(
        "{} recovered, restart backoff reset",
        container.name
      );
    } else if let Some(started) = runtime.started_at
      && restart_state.last_successful_start != Some(started)
    {
      state
        .db
        .restart_states
        .update_one(
          doc! { "_id": oid(&restart_state.id)? },
          doc! { "$set": { "last_successful_start": started } },
        )
        .await
        .context("failed to record start time")?;
    }
    return Ok(());
  }

  // Stopped: decide whether this exit warrants a restart.
  let (retryable, reason) = should_retry_restart(
    runtime.exit_code,
    runtime.oom_killed,
  );
  if !retryable {
    state
      .db
      .restart_states
      .update_one(
        doc! { "_id": oid(&restart_state.id)? },
        doc! { "$set": {
          "last_failure_reason": &reason,
          "last_exit_code": runtime.exit_code,
        } },
      )
      .await
      .context("failed to record non-retryable exit")?;
    return Ok(());
  }

  let attempt = restart_state.consecutive_failures + 1;
  if attempt >= restart_state.max_attempts {
    // Breaker: give up until the operator intervenes or the
    // container recovers on its own.
    state
      .db
      .restart_states
      .update_one(
        doc! { "_id": oid(&restart_state.id)? },
        doc! { "$set": {
          "max_retries_reached": true,
          "consecutive_failures": attempt,
          "last_failure_reason": &reason,
          "last_exit_code": runtime.exit_code,
          "next_retry_at": Option::<i64>::None,
        } },
      )
      .await
      .context("failed to trip restart breaker")?;
    state.events.publish_kind(
      EventKind::RestartMaxRetries,
      &container.id,
      &container.name,
      json!({ "attempts": attempt, "reason": reason }),
    );
    crate::alert::send_alert(
      state,
      AlertData::RestartMaxRetries {
        container_id: container.id.clone(),
        container_name: container.name.clone(),
        attempts: attempt,
        last_failure_reason: reason.clone(),
      },
    )
    .await;
    return Ok(());
  }

  let delay = restart_delay_secs(
    state.config.restart_base_delay_seconds,
    restart_state.consecutive_failures,
    state.config.restart_max_delay_seconds,
  );
  let next_retry_at = now + (delay as i64) * 1000;

  // Provisional increment: the attempt counts even if the job
  // never manages to bring the container up.
  state
    .db
    .restart_states
    .update_one(
      doc! { "_id": oid(&restart_state.id)? },
      doc! { "$set": {
        "consecutive_failures": attempt,
        "next_retry_at": next_retry_at,
        "last_failure_reason": &reason,
        "last_exit_code": runtime.exit_code,
      } },
    )
    .await
    .context("failed to schedule restart")?;

  state.events.publish_kind(
    EventKind::RestartScheduled,
    &container.id,
    &container.name,
    json!({
      "attempt": attempt,
      "delay_seconds": delay,
      "next_retry_at": next_retry_at,
      "reason": reason,
    }),
  );

  spawn_restart_job(
    state.clone(),
    container.clone(),
    Duration::from_secs(delay),
  );
  Ok(())
}

/// The one-shot job that fires at `next_retry_at`.
fn spawn_restart_job(
  state: State,
  container: Container,
  delay: Duration,
) {
  tokio::spawn(async move {
    tokio::time::sleep(delay).await;

    // Things may have changed while we slept.
    match state.docker.inspect(&container.name).await {
      Ok(runtime) if runtime.running => return,
      Ok(_) => {}
      Err(e) => {
        warn!(
          "restart job inspect failed for {} | {e:#}",
          container.name
        );
        return;
      }
    }

    let result = async {
      let compose_path = crate::compose::validate_compose_path(
        &container.compose_file,
        &[state.config.compose_dir.clone()],
      )?;
      let host_path = crate::compose::translate_to_host_path(
        &compose_path,
        &state.config.compose_dir,
        &state.config.compose_host_base,
      )?;
      let log = compose_exec(
        &state,
        &container,
        &host_path,
        &["up", "-d", &container.service_name],
        "Restart",
        RESTART_TIMEOUT,
      )
      .await?;
      if !log.success {
        anyhow::bail!(
          "compose up failed: {}",
          log.stderr.trim()
        );
      }
      anyhow::Ok(())
    }
    .await;

    match result {
      Ok(()) => {
        info!("restarted {}", container.name);
        // Open the gate for the next tick; the consecutive
        // counter only resets after sustained uptime.
        state
          .db
          .restart_states
          .update_one(
            doc! { "container_id": &container.id },
            doc! { "$set": {
              "next_retry_at": Option::<i64>::None,
              "last_successful_start": tidewatch_timestamp(),
            } },
          )
          .await
          .ok();
      }
      Err(e) => {
        warn!(
          "restart of {} failed | {e:#}",
          container.name
        );
      }
    }
  });
}

async fn reset_backoff(
  state: &State,
  restart_state: &RestartState,
) -> anyhow::Result<()> {
  state
    .db
    .restart_states
    .update_one(
      doc! { "_id": oid(&restart_state.id)? },
      doc! { "$set": {
        "consecutive_failures": 0,
        "next_retry_at": Option::<i64>::None,
        "max_retries_reached": false,
      } },
    )
    .await
    .context("failed to reset restart backoff")?;
  Ok(())
}

/// Hourly sweep resetting backoff for containers that are up and
/// past their success window. Containers that no longer exist
/// are tolerated.
pub async fn cleanup(state: &State) -> anyhow::Result<()> {
  let states = find_collect(
    &state.db.restart_states,
    doc! { "consecutive_failures": { "$gt": 0 } },
    None,
  )
  .await
  .context("failed to list restart states")?;

  let now = tidewatch_timestamp();
  for restart_state in states {
    let container = match find_container(
      state,
      &restart_state.container_id,
    )
    .await
    {
      Some(container) => container,
      None => continue,
    };
    let runtime =
      match state.docker.inspect(&container.name).await {
        Ok(runtime) => runtime,
        Err(_) => continue,
      };
    if !runtime.running {
      continue;
    }
    let sustained = runtime
      .started_at
      .map(|started| {
        now - started
          > restart_state.success_window_seconds * 1000
      })
      .unwrap_or(false);
    if sustained {
      reset_backoff(state, &restart_state).await?;
      debug!(
        "cleanup reset restart backoff for {}",
        container.name
      );
    }
  }
  Ok(())
}

async fn find_container(
  state: &State,
  container_id: &str,
) -> Option<Container> {
  mungos::by_id::find_one_by_id(
    &state.db.containers,
    container_id,
  )
  .await
  .ok()
  .flatten()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exit_classifier() {
    let (retry, _) = should_retry_restart(Some(0), false);
    assert!(!retry);
    let (retry, reason) = should_retry_restart(Some(137), false);
    assert!(retry);
    assert!(reason.contains("137"));
    // OOM kills retry even with a zero exit code
    let (retry, reason) = should_retry_restart(Some(0), true);
    assert!(retry);
    assert!(reason.contains("OOM"));
    let (retry, _) = should_retry_restart(None, false);
    assert!(retry);
  }

  #[test]
  fn backoff_doubles_and_clamps() {
    // base 10s: 10, 20, 40 for the first three failures
    assert_eq!(restart_delay_secs(10, 0, 3600), 10);
    assert_eq!(restart_delay_secs(10, 1, 3600), 20);
    assert_eq!(restart_delay_secs(10, 2, 3600), 40);
    // clamp
    assert_eq!(restart_delay_secs(10, 20, 3600), 3600);
  }
}
