use std::{path::Path, time::Duration};

use anyhow::{Context, anyhow};
use command::run_tidewatch_command;
use tokio::fs;

use super::{
  BackupMetadata, HELPER_IMAGE, backup_dir, parse_pg_major,
  short_id,
};
use crate::state::AppState;

const RESTORE_TIMEOUT: Duration = Duration::from_secs(300);

/// The staged extract script. Atomic in the steady state: if the
/// helper dies mid-run, either the originals are still in place
/// or `.restore-staging` remains for the next attempt. The mv
/// globs use `|| true` because dotfile globs may legitimately
/// match nothing; the trailing tests catch a restore that left
/// nothing behind.
fn staged_restore_script(
  container_name: &str,
  backup_id: &str,
  tar_filename: &str,
) -> String {
  format!(
    "set -e && \
     rm -rf /target/.restore-staging && \
     mkdir -p /target/.restore-staging && \
     tar xzf /backup/{container_name}/{backup_id}/{tar_filename} -C /target/.restore-staging && \
     test \"$(ls -A /target/.restore-staging)\" && \
     find /target -mindepth 1 -maxdepth 1 ! -name .restore-staging -exec rm -rf {{}} + && \
     mv /target/.restore-staging/* /target/ 2>/dev/null || true && \
     mv /target/.restore-staging/.* /target/ 2>/dev/null || true && \
     rmdir /target/.restore-staging 2>/dev/null || true && \
     test ! -d /target/.restore-staging && \
     test \"$(ls -A /target)\""
  )
}

pub async fn read_metadata(
  container_name: &str,
  backup_id: &str,
) -> anyhow::Result<BackupMetadata> {
  let path =
    backup_dir(container_name, backup_id).join("metadata.json");
  let raw = fs::read(&path)
    .await
    .with_context(|| format!("no metadata at {path:?}"))?;
  serde_json::from_slice(&raw)
    .context("backup metadata is not valid json")
}

/// Restores every successfully backed up mount via staged
/// extract. The target container must be stopped first; the
/// caller brings it back up and then runs [restore_postgres].
pub async fn restore_backup(
  state: &AppState,
  container_name: &str,
  backup_id: &str,
) -> anyhow::Result<usize> {
  let lock = state.backup_lock(container_name);
  let _guard = lock.lock().await;

  let metadata =
    read_metadata(container_name, backup_id).await?;
  let mut restored = 0usize;

  for mount in &metadata.mounts {
    if mount.error.is_some() {
      continue;
    }
    let target_spec = match (&mount.volume_name, mount.mount_type.as_str()) {
      (Some(name), "volume") => format!("{name}:/target"),
      _ => format!("{}:/target", mount.source),
    };
    let argv = vec![
      "docker".to_string(),
      "run".to_string(),
      "--rm".to_string(),
      "--name".to_string(),
      format!("tw-restore-{}", short_id()),
      "-v".to_string(),
      format!("{}:/backup:ro", state.config.rollback_volume),
      "-v".to_string(),
      target_spec,
      HELPER_IMAGE.to_string(),
      "sh".to_string(),
      "-c".to_string(),
      staged_restore_script(
        container_name,
        backup_id,
        &mount.tar_filename,
      ),
    ];
    let log = run_tidewatch_command(
      "Data Restore",
      &argv,
      &[(
        "DOCKER_HOST".to_string(),
        state.config.docker_host.clone(),
      )],
      RESTORE_TIMEOUT,
    )
    .await;
    if !log.success {
      return Err(anyhow!(
        "staged restore of {} failed: {}",
        mount.destination,
        log.stderr.trim()
      ));
    }
    restored += 1;
  }

  Ok(restored)
}

/// Re-applies the `pg_dumpall` after `docker compose up`.
/// Skipped when no dump exists or the running major differs from
/// the one the dump came from.
pub async fn restore_postgres(
  state: &AppState,
  container_name: &str,
  backup_id: &str,
) -> anyhow::Result<bool> {
  let dir = backup_dir(container_name, backup_id);
  let dump_path = dir.join("pg_dumpall.sql");
  if fs::metadata(&dump_path).await.is_err() {
    return Ok(false);
  }

  let metadata =
    read_metadata(container_name, backup_id).await?;
  let Some(stored_version) = metadata.pg_version else {
    return Ok(false);
  };
  let pg_user =
    metadata.pg_user.unwrap_or_else(|| "postgres".to_string());

  let envs = [(
    "DOCKER_HOST".to_string(),
    state.config.docker_host.clone(),
  )];

  let version_log = run_tidewatch_command(
    "PostgreSQL Version",
    &[
      "docker".to_string(),
      "exec".to_string(),
      container_name.to_string(),
      "postgres".to_string(),
      "--version".to_string(),
    ],
    &envs,
    Duration::from_secs(10),
  )
  .await;
  let current_version = parse_pg_major(&version_log.stdout);
  if current_version != Some(stored_version) {
    warn!(
      "skipping pg restore for {container_name}: dump is from \
       major {stored_version}, container runs {current_version:?}"
    );
    return Ok(false);
  }

  copy_dump_into_container(state, container_name, &dump_path)
    .await?;

  let restore_log = run_tidewatch_command(
    "PostgreSQL Restore",
    &[
      "docker".to_string(),
      "exec".to_string(),
      container_name.to_string(),
      "sh".to_string(),
      "-c".to_string(),
      format!(
        "psql -U {pg_user} -f /tmp/pg_dumpall.sql postgres"
      ),
    ],
    &envs,
    RESTORE_TIMEOUT,
  )
  .await;
  if !restore_log.success {
    return Err(anyhow!(
      "psql restore failed: {}",
      restore_log.stderr.trim()
    ));
  }

  Ok(true)
}

async fn copy_dump_into_container(
  state: &AppState,
  container_name: &str,
  dump_path: &Path,
) -> anyhow::Result<()> {
  let log = run_tidewatch_command(
    "Copy Dump",
    &[
      "docker".to_string(),
      "cp".to_string(),
      dump_path.display().to_string(),
      format!("{container_name}:/tmp/pg_dumpall.sql"),
    ],
    &[(
      "DOCKER_HOST".to_string(),
      state.config.docker_host.clone(),
    )],
    Duration::from_secs(60),
  )
  .await;
  if !log.success {
    return Err(anyhow!(
      "failed to copy dump into container: {}",
      log.stderr.trim()
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn staged_script_shape() {
    let script = staged_restore_script("web", "abc123", "data.tar.gz");
    // extract goes to staging first
    assert!(script.contains(
      "tar xzf /backup/web/abc123/data.tar.gz -C /target/.restore-staging"
    ));
    // originals are only removed after the staging check
    let staging_check =
      script.find("test \"$(ls -A /target/.restore-staging)\"").unwrap();
    let removal = script.find("find /target -mindepth 1").unwrap();
    assert!(staging_check < removal);
    // final verification: staging gone, target non-empty
    assert!(script.contains("test ! -d /target/.restore-staging"));
    assert!(script.ends_with("test \"$(ls -A /target)\""));
  }
}
