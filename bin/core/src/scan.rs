use anyhow::Context;
use async_timing_util::Timelength;
use mungos::{find::find_collect, mongodb::bson::doc};
use tidewatch_client::entities::{
  scan::{
    DISCOVERY_TRIGGER_AT_ATTEMPT, MAX_TRIGGER_ATTEMPTS,
    PendingScanJob, ScanStatus,
  },
  tidewatch_timestamp,
};

use crate::{
  helpers::oid,
  state::State,
  vulnforge::VulnForgeClient,
};

const TRIGGER_BACKOFF_BASE_SECS: i64 = 15;
const TRIGGER_BACKOFF_CAP_SECS: i64 = 300;

/// Queues the post-apply CVE reconciliation for a container.
pub async fn enqueue_scan(
  state: &crate::state::AppState,
  container_name: &str,
  update_id: &str,
) -> anyhow::Result<()> {
  let job = PendingScanJob::builder()
    .container_name(container_name.to_string())
    .update_id(update_id.to_string())
    .created_at(tidewatch_timestamp())
    .build()
    .context("failed to build scan job")?;
  state
    .db
    .pending_scans
    .insert_one(&job)
    .await
    .context("failed to enqueue pending scan")?;
  Ok(())
}

/// Startup recovery: resumes every non-terminal job where it
/// left off. A trigger that got a job id resumes as polling; one
/// that didn't starts over as pending. Counters survive.
pub async fn recover_jobs(state: &State) -> anyhow::Result<()> {
  let recovered_to_polling = state
    .db
    .pending_scans
    .update_many(
      doc! {
        "status": "triggered",
        "vulnforge_job_id": { "$type": "string", "$ne": "" },
      },
      doc! { "$set": { "status": "polling" } },
    )
    .await
    .context("failed to recover triggered scans")?;
  let recovered_to_pending = state
    .db
    .pending_scans
    .update_many(
      doc! {
        "status": "triggered",
        "$or": [
          { "vulnforge_job_id": Option::<String>::None },
          { "vulnforge_job_id": "" },
        ],
      },
      doc! { "$set": { "status": "pending" } },
    )
    .await
    .context("failed to recover untriggered scans")?;
  if recovered_to_polling.modified_count
    + recovered_to_pending.modified_count
    > 0
  {
    info!(
      "recovered {} scan jobs to polling, {} to pending",
      recovered_to_polling.modified_count,
      recovered_to_pending.modified_count
    );
  }
  Ok(())
}

/// The worker loop: one pass over active jobs every 15 seconds.
pub fn spawn_scan_worker(state: State) {
  tokio::spawn(async move {
    if let Err(e) = recover_jobs(&state).await {
      error!("scan job recovery failed | {e:#}");
    }
    loop {
      async_timing_util::wait_until_timelength(
        Timelength::FifteenSeconds,
        200,
      )
      .await;
      if let Err(e) = tick(&state).await {
        error!("pending scan tick failed | {e:#}");
      }
    }
  });
}

async fn tick(state: &State) -> anyhow::Result<()> {
  let jobs = find_collect(
    &state.db.pending_scans,
    doc! { "status": { "$in": ["pending", "triggered", "polling"] } },
    None,
  )
  .await
  .context("failed to list active scan jobs")?;
  if jobs.is_empty() {
    return Ok(());
  }

  let Some(client) = VulnForgeClient::from_state(state).await?
  else {
    // VulnForge got unconfigured with jobs in flight.
    return Ok(());
  };

  for job in jobs {
    let result = match job.status {
      ScanStatus::Pending => {
        drive_trigger(state, &client, &job).await
      }
      ScanStatus::Triggered | ScanStatus::Polling => {
        drive_poll(state, &client, &job).await
      }
      _ => Ok(()),
    };
    if let Err(e) = result {
      warn!(
        "scan job for {} failed to advance | {e:#}",
        job.container_name
      );
    }
  }
  Ok(())
}

fn trigger_backoff_secs(attempt: i64) -> i64 {
  (TRIGGER_BACKOFF_BASE_SECS
    * 2i64.saturating_pow(attempt.max(0) as u32))
  .min(TRIGGER_BACKOFF_CAP_SECS)
}

async fn drive_trigger(
  state: &State,
  client: &VulnForgeClient,
  job: &PendingScanJob,
) -> anyhow::Result<()> {
  if job.trigger_attempt_count >= MAX_TRIGGER_ATTEMPTS {
    fail_job(state, job, "trigger attempts exhausted").await?;
    return Ok(());
  }

  // Trigger retries back off: 15s, 30s, 60s... capped at 5 min.
  if let Some(last_attempt) = job.last_trigger_attempt_at {
    let due = last_attempt
      + trigger_backoff_secs(job.trigger_attempt_count) * 1000;
    if tidewatch_timestamp() < due {
      return Ok(());
    }
  }

  let attempt = job.trigger_attempt_count + 1;

  // Persistent misses usually mean VulnForge hasn't noticed the
  // recreated container: nudge its discovery first.
  if attempt >= DISCOVERY_TRIGGER_AT_ATTEMPT
    && let Err(e) = client.discover().await
  {
    debug!("vulnforge discover failed | {e:#}");
  }

  match client.trigger_scan(&job.container_name).await {
    Ok(Some(triggered)) => {
      state
        .db
        .pending_scans
        .update_one(
          doc! { "_id": oid(&job.id)? },
          doc! { "$set": {
            "status": "triggered",
            "vulnforge_job_id": &triggered.job_id,
            "trigger_attempt_count": attempt,
            "last_trigger_attempt_at": tidewatch_timestamp(),
          } },
        )
        .await
        .context("failed to mark job triggered")?;
    }
    Ok(None) => {
      // Trigger miss: container not known yet, try again later.
      state
        .db
        .pending_scans
        .update_one(
          doc! { "_id": oid(&job.id)? },
          doc! { "$set": {
            "trigger_attempt_count": attempt,
            "last_trigger_attempt_at": tidewatch_timestamp(),
          } },
        )
        .await
        .context("failed to record trigger miss")?;
    }
    Err(e) => {
      state
        .db
        .pending_scans
        .update_one(
          doc! { "_id": oid(&job.id)? },
          doc! { "$set": {
            "trigger_attempt_count": attempt,
            "last_trigger_attempt_at": tidewatch_timestamp(),
            "error_message": format!("{e:#}"),
          } },
        )
        .await
        .context("failed to record trigger error")?;
    }
  }
  Ok(())
}

async fn drive_poll(
  state: &State,
  client: &VulnForgeClient,
  job: &PendingScanJob,
) -> anyhow::Result<()> {
  if job.polls_exhausted() {
    fail_job(state, job, "poll budget exhausted").await?;
    return Ok(());
  }
  let Some(job_id) = &job.vulnforge_job_id else {
    // Shouldn't happen (recovery maps these to pending), but
    // don't spin on it.
    fail_job(state, job, "polling without a job id").await?;
    return Ok(());
  };

  let poll = client.poll_scan(job_id).await?;

  if poll.is_completed() {
    // The scan results land on the originating Update and its
    // history row.
    state
      .db
      .updates
      .update_one(
        doc! { "_id": oid(&job.update_id)? },
        doc! { "$set": {
          "cves_fixed": &poll.cves_fixed,
          "new_vulns": poll.new_vulns,
          "vuln_delta": poll.vuln_delta,
          "updated_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to write scan results to update")?;
    state
      .db
      .update_history
      .update_one(
        doc! { "update_id": &job.update_id },
        doc! { "$set": { "cves_fixed": &poll.cves_fixed } },
      )
      .await
      .context("failed to write scan results to history")?;
    state
      .db
      .pending_scans
      .update_one(
        doc! { "_id": oid(&job.id)? },
        doc! { "$set": {
          "status": "completed",
          "vulnforge_scan_id": poll
            .scan_id
            .as_deref()
            .unwrap_or_default(),
          "poll_count": job.poll_count + 1,
          "last_polled_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to complete scan job")?;
    info!(
      "post-update scan completed for {} ({} CVEs fixed)",
      job.container_name,
      poll.cves_fixed.len()
    );
  } else if poll.is_failed() {
    fail_job(state, job, "vulnforge scan failed").await?;
  } else {
    state
      .db
      .pending_scans
      .update_one(
        doc! { "_id": oid(&job.id)? },
        doc! { "$set": {
          "status": "polling",
          "poll_count": job.poll_count + 1,
          "last_polled_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to record poll")?;
  }
  Ok(())
}

async fn fail_job(
  state: &State,
  job: &PendingScanJob,
  reason: &str,
) -> anyhow::Result<()> {
  state
    .db
    .pending_scans
    .update_one(
      doc! { "_id": oid(&job.id)? },
      doc! { "$set": {
        "status": "failed",
        "error_message": reason,
      } },
    )
    .await
    .context("failed to fail scan job")?;
  warn!(
    "pending scan for {} marked failed: {reason}",
    job.container_name
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn trigger_backoff_ladder() {
    assert_eq!(trigger_backoff_secs(0), 15);
    assert_eq!(trigger_backoff_secs(1), 30);
    assert_eq!(trigger_backoff_secs(2), 60);
    assert_eq!(trigger_backoff_secs(3), 120);
    assert_eq!(trigger_backoff_secs(4), 240);
    assert_eq!(trigger_backoff_secs(5), 300);
    assert_eq!(trigger_backoff_secs(10), 300);
  }

  #[test]
  fn job_activity_predicates() {
    let mut job = PendingScanJob::builder()
      .container_name("web".to_string())
      .update_id("abc".to_string())
      .build()
      .unwrap();
    assert!(job.is_active());
    job.status = ScanStatus::Polling;
    assert!(job.is_active());
    job.status = ScanStatus::Completed;
    assert!(!job.is_active());

    job.poll_count = job.max_polls;
    assert!(job.polls_exhausted());
  }
}
