use std::{
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use anyhow::{Context, anyhow};
use command::run_tidewatch_command;
use serde::{Deserialize, Serialize};
use tidewatch_client::entities::history::DataBackupStatus;
use tokio::fs;

use crate::{docker::MountInfo, state::AppState};

pub mod restore;

/// Where the rollback volume is mounted inside TideWatch itself.
/// Helper containers mount the same named volume at `/backup`.
pub const ROLLBACK_MOUNT: &str = "/rollback-data";

pub const MIN_FREE_SPACE_BYTES: u64 = 500 * 1024 * 1024;

const DEFAULT_BACKUP_BUDGET: Duration = Duration::from_secs(300);
const HELPER_IMAGE: &str = "alpine:latest";

/// Host path prefixes that are never data: daemon plumbing,
/// compose / build / env roots, media and backup mounts.
const SKIP_SOURCE_PREFIXES: &[&str] =
  &["/var/run", "/run", "/mnt/media", "/mnt/backup"];

const SINGLE_FILE_EXTENSIONS: &[&str] = &[
  "conf", "yml", "yaml", "json", "toml", "env", "ini", "cfg",
  "xml", "sock", "log", "pid", "lock", "key", "pem", "crt",
  "cert",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
  pub backup_id: String,
  pub container_name: String,
  pub container_image: String,
  pub created_at: i64,
  pub mounts: Vec<MountRecord>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pg_version: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pg_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRecord {
  /// `bind` or `volume`.
  #[serde(rename = "type")]
  pub mount_type: String,
  pub source: String,
  pub destination: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub volume_name: Option<String>,
  pub tar_filename: String,
  #[serde(default)]
  pub size_bytes: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
  pub backup_id: String,
  pub status: DataBackupStatus,
  pub mounts_backed_up: usize,
  pub error: Option<String>,
}

/// Whether a mount carries restorable data. Returns the skip
/// reason otherwise.
pub fn skip_reason(
  mount: &MountInfo,
  extra_skip_prefixes: &[String],
) -> Option<String> {
  if mount.read_only {
    return Some("read-only mount".to_string());
  }
  if mount.source.ends_with(".sock") {
    return Some("socket mount".to_string());
  }
  for prefix in SKIP_SOURCE_PREFIXES {
    if mount.source.starts_with(prefix) {
      return Some(format!("infrastructure path ({prefix})"));
    }
  }
  for prefix in extra_skip_prefixes {
    if !prefix.is_empty() && mount.source.starts_with(prefix) {
      return Some(format!("infrastructure path ({prefix})"));
    }
  }
  // Single-file binds: docker reports Type=bind for both files
  // and directories, so go by extension.
  if mount.kind == "bind"
    && let Some(ext) = Path::new(&mount.source)
      .extension()
      .and_then(|ext| ext.to_str())
    && SINGLE_FILE_EXTENSIONS
      .contains(&ext.to_lowercase().as_str())
  {
    return Some(format!("single-file mount (.{ext})"));
  }
  None
}

pub fn backup_dir(
  container_name: &str,
  backup_id: &str,
) -> PathBuf {
  Path::new(ROLLBACK_MOUNT)
    .join(container_name)
    .join(backup_id)
}

pub fn tar_filename(mount: &MountInfo) -> String {
  match (&mount.volume_name, mount.kind.as_str()) {
    (Some(name), "volume") => format!("{name}.tar.gz"),
    _ => {
      let slug = mount
        .destination
        .trim_matches('/')
        .replace('/', "_");
      format!("{slug}.tar.gz")
    }
  }
}

/// Available bytes on the rollback volume, via `df`.
async fn free_space_bytes(state: &AppState) -> Option<u64> {
  let argv = vec![
    "df".to_string(),
    "-Pk".to_string(),
    ROLLBACK_MOUNT.to_string(),
  ];
  let log = run_tidewatch_command(
    "Check Free Space",
    &argv,
    &[],
    Duration::from_secs(10),
  )
  .await;
  if !log.success {
    return None;
  }
  // POSIX df: last line, 4th column is available 1K blocks.
  let line = log.stdout.lines().last()?;
  let available: u64 =
    line.split_whitespace().nth(3)?.parse().ok()?;
  Some(available * 1024)
}

fn docker_env(state: &AppState) -> Vec<(String, String)> {
  vec![(
    "DOCKER_HOST".to_string(),
    state.config.docker_host.clone(),
  )]
}

/// Tars one mount through an ephemeral helper container.
async fn backup_mount(
  state: &AppState,
  container_name: &str,
  backup_id: &str,
  mount: &MountInfo,
  timeout: Duration,
) -> anyhow::Result<u64> {
  let tar = tar_filename(mount);
  let source_spec = match (&mount.volume_name, mount.kind.as_str())
  {
    (Some(name), "volume") => format!("{name}:/source:ro"),
    _ => format!("{}:/source:ro", mount.source),
  };
  let script = format!(
    "mkdir -p /backup/{container_name}/{backup_id} && \
     tar czf /backup/{container_name}/{backup_id}/{tar} -C /source ."
  );
  let argv = vec![
    "docker".to_string(),
    "run".to_string(),
    "--rm".to_string(),
    "--name".to_string(),
    format!("tw-backup-{}", short_id()),
    "-v".to_string(),
    source_spec,
    "-v".to_string(),
    format!("{}:/backup", state.config.rollback_volume),
    HELPER_IMAGE.to_string(),
    "sh".to_string(),
    "-c".to_string(),
    script,
  ];
  let log = run_tidewatch_command(
    "Data Backup",
    &argv,
    &docker_env(state),
    timeout,
  )
  .await;
  if !log.success {
    return Err(anyhow!(
      "tar helper failed: {}",
      log.stderr.trim()
    ));
  }

  let size = fs::metadata(
    backup_dir(container_name, backup_id).join(&tar),
  )
  .await
  .map(|meta| meta.len())
  .unwrap_or(0);
  Ok(size)
}

fn short_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Backs up every eligible mount of a container into the
/// rollback volume, plus a `pg_dumpall` for PostgreSQL images.
/// Best effort with a total budget: overruns mark the outcome
/// `timeout`, partial failures mark it `partial`, and the caller
/// proceeds with the update either way.
pub async fn create_backup(
  state: &AppState,
  container_name: &str,
  budget: Option<Duration>,
) -> anyhow::Result<BackupOutcome> {
  let lock = state.backup_lock(container_name);
  let _guard = lock.lock().await;

  let budget = budget.unwrap_or(DEFAULT_BACKUP_BUDGET);
  let started = Instant::now();

  let runtime = state.docker.inspect(container_name).await?;
  if !runtime.exists {
    return Err(anyhow!(
      "container {container_name} not found on daemon"
    ));
  }

  let extra_prefixes = vec![
    state.config.compose_host_base.clone(),
    state.config.compose_dir.display().to_string(),
  ];
  let eligible = runtime
    .mounts
    .iter()
    .filter(|mount| {
      match skip_reason(mount, &extra_prefixes) {
        Some(reason) => {
          debug!(
            "skipping mount {} of {container_name}: {reason}",
            mount.destination
          );
          false
        }
        None => true,
      }
    })
    .cloned()
    .collect::<Vec<_>>();

  let is_postgres = {
    let image = runtime.image.to_lowercase();
    image.contains("postgres") || image.contains("postgresql")
  };

  if eligible.is_empty() && !is_postgres {
    return Ok(BackupOutcome {
      backup_id: String::new(),
      status: DataBackupStatus::Skipped,
      mounts_backed_up: 0,
      error: Some("no eligible mounts".to_string()),
    });
  }

  if let Some(free) = free_space_bytes(state).await
    && free < MIN_FREE_SPACE_BYTES
  {
    return Ok(BackupOutcome {
      backup_id: String::new(),
      status: DataBackupStatus::Failed,
      mounts_backed_up: 0,
      error: Some(format!(
        "only {free} bytes free on backup volume"
      )),
    });
  }

  let backup_id = uuid::Uuid::new_v4().simple().to_string();
  let dir = backup_dir(container_name, &backup_id);
  fs::create_dir_all(&dir)
    .await
    .context("failed to create backup directory")?;

  let per_mount_timeout = Duration::from_secs(
    (budget.as_secs() / eligible.len().max(1) as u64).max(60),
  );

  let mut records = Vec::new();
  let mut backed_up = 0usize;
  let mut timed_out = false;

  for mount in &eligible {
    if started.elapsed() > budget {
      warn!(
        "data backup budget exhausted for {container_name} \
         after {backed_up} mounts"
      );
      timed_out = true;
      break;
    }
    let tar = tar_filename(mount);
    match backup_mount(
      state,
      container_name,
      &backup_id,
      mount,
      per_mount_timeout,
    )
    .await
    {
      Ok(size) => {
        backed_up += 1;
        records.push(MountRecord {
          mount_type: mount.kind.clone(),
          source: mount.source.clone(),
          destination: mount.destination.clone(),
          volume_name: mount.volume_name.clone(),
          tar_filename: tar,
          size_bytes: size,
          error: None,
        });
      }
      Err(e) => {
        warn!(
          "failed to back up mount {} of {container_name} | {e:#}",
          mount.destination
        );
        records.push(MountRecord {
          mount_type: mount.kind.clone(),
          source: mount.source.clone(),
          destination: mount.destination.clone(),
          volume_name: mount.volume_name.clone(),
          tar_filename: tar,
          size_bytes: 0,
          error: Some(format!("{e:#}")),
        });
      }
    }
  }

  let mut pg_version = None;
  let mut pg_user = None;
  if is_postgres && !timed_out {
    let user = runtime
      .env_var("POSTGRES_USER")
      .unwrap_or("postgres")
      .to_string();
    match dump_postgres(
      state,
      container_name,
      &dir,
      &user,
      per_mount_timeout,
    )
    .await
    {
      Ok(version) => {
        pg_version = version;
        pg_user = Some(user);
      }
      Err(e) => {
        warn!(
          "pg_dumpall failed for {container_name} | {e:#}"
        );
      }
    }
  }

  let metadata = BackupMetadata {
    backup_id: backup_id.clone(),
    container_name: container_name.to_string(),
    container_image: runtime.image.clone(),
    created_at: tidewatch_client::entities::tidewatch_timestamp(),
    mounts: records,
    pg_version,
    pg_user,
  };
  let metadata_json = serde_json::to_vec_pretty(&metadata)
    .context("failed to serialize backup metadata")?;
  fs::write(dir.join("metadata.json"), metadata_json)
    .await
    .context("failed to write backup metadata")?;

  let failed = metadata
    .mounts
    .iter()
    .filter(|mount| mount.error.is_some())
    .count();
  let status = if timed_out {
    DataBackupStatus::Timeout
  } else if failed == 0 {
    DataBackupStatus::Success
  } else if backed_up > 0 {
    DataBackupStatus::Partial
  } else {
    DataBackupStatus::Failed
  };

  Ok(BackupOutcome {
    backup_id,
    status,
    mounts_backed_up: backed_up,
    error: None,
  })
}

/// `pg_dumpall` through exec, written alongside the tarballs.
/// Returns the major version for the restore-time guard.
async fn dump_postgres(
  state: &AppState,
  container_name: &str,
  dir: &Path,
  pg_user: &str,
  timeout: Duration,
) -> anyhow::Result<Option<u32>> {
  let version_argv = vec![
    "docker".to_string(),
    "exec".to_string(),
    container_name.to_string(),
    "postgres".to_string(),
    "--version".to_string(),
  ];
  let version_log = run_tidewatch_command(
    "PostgreSQL Version",
    &version_argv,
    &docker_env(state),
    Duration::from_secs(10),
  )
  .await;
  let version = parse_pg_major(&version_log.stdout);

  let dump_argv = vec![
    "docker".to_string(),
    "exec".to_string(),
    container_name.to_string(),
    "pg_dumpall".to_string(),
    "-U".to_string(),
    pg_user.to_string(),
  ];
  let dump_log = run_tidewatch_command(
    "PostgreSQL Dump",
    &dump_argv,
    &docker_env(state),
    timeout,
  )
  .await;
  if !dump_log.success {
    return Err(anyhow!(
      "pg_dumpall exited with failure: {}",
      dump_log.stderr.trim()
    ));
  }
  fs::write(dir.join("pg_dumpall.sql"), dump_log.stdout)
    .await
    .context("failed to write pg_dumpall.sql")?;
  Ok(version)
}

/// `postgres --version` prints eg
/// `postgres (PostgreSQL) 16.1 (Debian ...)`.
pub fn parse_pg_major(output: &str) -> Option<u32> {
  output
    .split_whitespace()
    .find_map(|word| {
      word.split('.').next()?.parse::<u32>().ok()
    })
}

/// Keeps the N most-recent valid backups per container. A dir
/// without `metadata.json` is junk from a crashed run and goes
/// regardless of age.
pub async fn prune_backups(
  container_name: &str,
  keep: usize,
) -> anyhow::Result<usize> {
  let root = Path::new(ROLLBACK_MOUNT).join(container_name);
  let mut entries = match fs::read_dir(&root).await {
    Ok(entries) => entries,
    Err(_) => return Ok(0),
  };

  let mut valid = Vec::new();
  let mut removed = 0usize;
  while let Some(entry) = entries
    .next_entry()
    .await
    .context("failed to walk backup directory")?
  {
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }
    let metadata_path = path.join("metadata.json");
    let created_at = match fs::read(&metadata_path).await {
      Ok(raw) => {
        match serde_json::from_slice::<BackupMetadata>(&raw) {
          Ok(metadata) => metadata.created_at,
          Err(_) => {
            fs::remove_dir_all(&path).await.ok();
            removed += 1;
            continue;
          }
        }
      }
      Err(_) => {
        fs::remove_dir_all(&path).await.ok();
        removed += 1;
        continue;
      }
    };
    valid.push((created_at, path));
  }

  valid.sort_by(|a, b| b.0.cmp(&a.0));
  for (_, path) in valid.into_iter().skip(keep) {
    fs::remove_dir_all(&path).await.ok();
    removed += 1;
  }
  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mount(
    kind: &str,
    source: &str,
    destination: &str,
    read_only: bool,
  ) -> MountInfo {
    MountInfo {
      kind: kind.to_string(),
      volume_name: (kind == "volume")
        .then(|| source.to_string()),
      source: source.to_string(),
      destination: destination.to_string(),
      read_only,
    }
  }

  #[test]
  fn skip_rules() {
    let extra =
      vec!["/srv/raid0/docker/compose".to_string()];
    assert!(
      skip_reason(
        &mount("bind", "/srv/appdata/db", "/var/lib/app", false),
        &extra
      )
      .is_none()
    );
    assert!(
      skip_reason(
        &mount("bind", "/srv/appdata/db", "/data", true),
        &extra
      )
      .unwrap()
      .contains("read-only")
    );
    assert!(
      skip_reason(
        &mount(
          "bind",
          "/var/run/docker.sock",
          "/var/run/docker.sock",
          false
        ),
        &extra
      )
      .unwrap()
      .contains("infrastructure")
    );
    assert!(
      skip_reason(
        &mount(
          "bind",
          "/srv/raid0/docker/compose/web.yml",
          "/config.yml",
          false
        ),
        &extra
      )
      .unwrap()
      .contains("infrastructure")
    );
    assert!(
      skip_reason(
        &mount("bind", "/srv/app/config.toml", "/cfg", false),
        &extra
      )
      .unwrap()
      .contains("single-file")
    );
    // volumes never hit the single-file heuristic
    assert!(
      skip_reason(
        &mount("volume", "app_data", "/data", false),
        &extra
      )
      .is_none()
    );
  }

  #[test]
  fn tar_names() {
    assert_eq!(
      tar_filename(&mount("volume", "app_data", "/data", false)),
      "app_data.tar.gz"
    );
    assert_eq!(
      tar_filename(&mount(
        "bind",
        "/srv/app/data",
        "/var/lib/app/data",
        false
      )),
      "var_lib_app_data.tar.gz"
    );
  }

  #[test]
  fn pg_version_parsing() {
    assert_eq!(
      parse_pg_major(
        "postgres (PostgreSQL) 16.1 (Debian 16.1-1.pgdg120+1)"
      ),
      Some(16)
    );
    assert_eq!(
      parse_pg_major("postgres (PostgreSQL) 15.4"),
      Some(15)
    );
    assert_eq!(parse_pg_major("command not found"), None);
  }
}
