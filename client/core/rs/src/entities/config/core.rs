//! # Configuring the TideWatch Core API
//!
//! TideWatch Core is configured by parsing a base configuration
//! file ([CoreConfig]), then overriding any fields given in the
//! file with ones provided on the environment ([Env]).
//!
//! The recommended way to run TideWatch is the docker image, which
//! ships a default configuration file; custom configuration can be
//! provided on the environment alone, or a file can be mounted at
//! `/config/config.toml`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{DatabaseConfig, empty_or_redacted};
use crate::entities::logger::LogConfig;

/// # TideWatch Core Environment Variables
///
/// Any field of the [CoreConfig] can be overridden by passing the
/// associated `TIDEWATCH_`-prefixed environment variable in
/// `UPPER_SNAKE_CASE` format.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  /// Custom config paths for the core config toml.
  /// Default: `/config/config.toml`
  #[serde(
    default = "default_config_paths",
    alias = "tidewatch_config_path"
  )]
  pub tidewatch_config_paths: Vec<PathBuf>,
  /// Wildcard keywords to narrow down which files inside config
  /// directories are parsed into the final [CoreConfig].
  #[serde(
    default = "default_config_keywords",
    alias = "tidewatch_config_keyword"
  )]
  pub tidewatch_config_keywords: Vec<String>,
  /// Merge nested config objects across config files.
  /// Default: `true`
  #[serde(default = "default_true")]
  pub tidewatch_merge_nested_config: bool,
  /// Extend config arrays across config files. Default: `true`
  #[serde(default = "default_true")]
  pub tidewatch_extend_config_arrays: bool,
  /// Print extra logs on startup to debug config loading.
  #[serde(default)]
  pub tidewatch_config_debug: bool,

  /// Override `title`
  pub tidewatch_title: Option<String>,
  /// Override `host`
  pub tidewatch_host: Option<String>,
  /// Override `port`
  pub tidewatch_port: Option<u16>,
  /// Override `bind_ip`
  pub tidewatch_bind_ip: Option<String>,
  /// Override `passkey`
  pub tidewatch_passkey: Option<String>,
  /// Override `passkey` with file
  pub tidewatch_passkey_file: Option<PathBuf>,
  /// Override `timezone`
  #[serde(alias = "tz", alias = "TZ")]
  pub tidewatch_timezone: Option<String>,
  /// Override `frontend_path`
  pub tidewatch_frontend_path: Option<String>,

  /// Override `compose_dir`
  pub tidewatch_compose_dir: Option<PathBuf>,
  /// Override `compose_host_base`
  pub tidewatch_compose_host_base: Option<String>,
  /// Override `data_dir`
  pub tidewatch_data_dir: Option<PathBuf>,
  /// Override `rollback_volume`
  pub tidewatch_rollback_volume: Option<String>,
  /// Override `docker_host`
  #[serde(alias = "docker_host", alias = "DOCKER_HOST")]
  pub tidewatch_docker_host: Option<String>,
  /// Override `docker_compose_command`
  pub tidewatch_docker_compose_command: Option<String>,

  /// Override `update_check_schedule`
  pub tidewatch_update_check_schedule: Option<String>,
  /// Override `auto_update_enabled`
  pub tidewatch_auto_update_enabled: Option<bool>,
  /// Override `auto_update_max_concurrent`
  pub tidewatch_auto_update_max_concurrent: Option<usize>,
  /// Override `include_prereleases`
  pub tidewatch_include_prereleases: Option<bool>,
  /// Override `restart_check_interval_seconds`
  pub tidewatch_restart_check_interval_seconds: Option<u64>,
  /// Override `restart_base_delay_seconds`
  pub tidewatch_restart_base_delay_seconds: Option<u64>,
  /// Override `restart_max_delay_seconds`
  pub tidewatch_restart_max_delay_seconds: Option<u64>,
  /// Override `data_backup_keep`
  pub tidewatch_data_backup_keep: Option<usize>,
  /// Override `docker_cleanup_schedule`
  pub tidewatch_docker_cleanup_schedule: Option<String>,
  /// Override `metrics_retention_days`
  pub tidewatch_metrics_retention_days: Option<i64>,

  /// Override `github_token`
  pub tidewatch_github_token: Option<String>,
  /// Override `github_token` with file
  pub tidewatch_github_token_file: Option<PathBuf>,
  /// Override `dockerhub_username`
  pub tidewatch_dockerhub_username: Option<String>,
  /// Override `dockerhub_token`
  pub tidewatch_dockerhub_token: Option<String>,
  /// Override `dockerhub_token` with file
  pub tidewatch_dockerhub_token_file: Option<PathBuf>,
  /// Override `ghcr_username`
  pub tidewatch_ghcr_username: Option<String>,
  /// Override `ghcr_token`
  pub tidewatch_ghcr_token: Option<String>,
  /// Override `ghcr_token` with file
  pub tidewatch_ghcr_token_file: Option<PathBuf>,
  /// Override `vulnforge_url`
  pub tidewatch_vulnforge_url: Option<String>,
  /// Override `vulnforge_api_key`
  pub tidewatch_vulnforge_api_key: Option<String>,
  /// Override `vulnforge_api_key` with file
  pub tidewatch_vulnforge_api_key_file: Option<PathBuf>,

  /// Override `database.uri`
  pub tidewatch_database_uri: Option<String>,
  /// Override `database.uri` with file
  pub tidewatch_database_uri_file: Option<PathBuf>,
  /// Override `database.address`
  pub tidewatch_database_address: Option<String>,
  /// Override `database.username`
  pub tidewatch_database_username: Option<String>,
  /// Override `database.password`
  pub tidewatch_database_password: Option<String>,
  /// Override `database.app_name`
  pub tidewatch_database_app_name: Option<String>,
  /// Override `database.db_name`
  pub tidewatch_database_db_name: Option<String>,

  /// Override `logging.level`
  pub tidewatch_logging_level:
    Option<crate::entities::logger::LogLevel>,
  /// Override `logging.stdio`
  pub tidewatch_logging_stdio:
    Option<crate::entities::logger::StdioLogMode>,
  /// Override `logging.pretty`
  pub tidewatch_logging_pretty: Option<bool>,
  /// Override `logging.otlp_endpoint`
  pub tidewatch_logging_otlp_endpoint: Option<String>,
  /// Override `logging.opentelemetry_service_name`
  pub tidewatch_logging_opentelemetry_service_name: Option<String>,

  /// Override `ssl_enabled`
  pub tidewatch_ssl_enabled: Option<bool>,
  /// Override `ssl_key_file`
  pub tidewatch_ssl_key_file: Option<PathBuf>,
  /// Override `ssl_cert_file`
  pub tidewatch_ssl_cert_file: Option<PathBuf>,

  /// Pretty-print the sanitized startup config.
  #[serde(default)]
  pub tidewatch_pretty_startup_config: bool,
}

fn default_config_paths() -> Vec<PathBuf> {
  vec![PathBuf::from("/config/config.toml")]
}

fn default_config_keywords() -> Vec<String> {
  vec![String::from("*config*")]
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Title shown in notifications / UI. Default: `TideWatch`
  #[serde(default = "default_title")]
  pub title: String,

  /// Externally reachable base url, used to construct links in
  /// notifications, eg `https://tidewatch.example.com`.
  #[serde(default)]
  pub host: String,

  /// Port the API binds. Default: `9120`
  #[serde(default = "default_port")]
  pub port: u16,

  /// IP the API binds. Default: `[::]`
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,

  /// Static API key required on every request when set.
  /// Empty disables authentication.
  #[serde(default)]
  pub passkey: String,

  /// IANA timezone for cron schedules. Empty uses the host local
  /// timezone.
  #[serde(default)]
  pub timezone: String,

  /// Path to the frontend build to serve. Default: `/app/frontend`
  #[serde(default = "default_frontend_path")]
  pub frontend_path: String,

  /// Where compose files are mounted inside the TideWatch
  /// container. Default: `/compose`
  #[serde(default = "default_compose_dir")]
  pub compose_dir: PathBuf,

  /// Host-visible base the `compose_dir` is mounted from, used to
  /// translate paths before handing them to the docker daemon.
  /// Empty disables translation (daemon shares the mount
  /// namespace).
  #[serde(default)]
  pub compose_host_base: String,

  /// Data directory. Compose backups land under
  /// `{data_dir}/backups`. Default: `/data`
  #[serde(default = "default_data_dir")]
  pub data_dir: PathBuf,

  /// Named volume receiving data backups.
  /// Default: `tidewatch_rollback_data`
  #[serde(default = "default_rollback_volume")]
  pub rollback_volume: String,

  /// Docker daemon address. Default: `unix:///var/run/docker.sock`
  #[serde(default = "default_docker_host")]
  pub docker_host: String,

  /// Command template used for compose invocations.
  /// Default: `docker compose`
  #[serde(default = "default_docker_compose_command")]
  pub docker_compose_command: String,

  /// Cron schedule for fleet-wide update checks.
  /// Default: `0 */6 * * *`
  #[serde(default = "default_update_check_schedule")]
  pub update_check_schedule: String,

  /// Master switch for automatic applies. Default: `false`
  #[serde(default)]
  pub auto_update_enabled: bool,

  /// Cap on concurrent applies per auto-apply tick. Default: `2`
  #[serde(default = "default_auto_update_max_concurrent")]
  pub auto_update_max_concurrent: usize,

  /// Global prerelease default, inherited by containers whose
  /// own flag is unset. Default: `false`
  #[serde(default)]
  pub include_prereleases: bool,

  /// Restart supervisor tick interval. Default: `30`
  #[serde(default = "default_restart_check_interval")]
  pub restart_check_interval_seconds: u64,

  /// Base delay of the restart backoff ladder. Default: `10`
  #[serde(default = "default_restart_base_delay")]
  pub restart_base_delay_seconds: u64,

  /// Clamp on the restart backoff ladder. Default: `3600`
  #[serde(default = "default_restart_max_delay")]
  pub restart_max_delay_seconds: u64,

  /// Data backups kept per container. Default: `3`
  #[serde(default = "default_data_backup_keep")]
  pub data_backup_keep: usize,

  /// Optional cron for `docker system prune`. Empty disables.
  #[serde(default)]
  pub docker_cleanup_schedule: String,

  /// Days of metrics retained by the cleanup job. Default: `30`
  #[serde(default = "default_metrics_retention_days")]
  pub metrics_retention_days: i64,

  /// GitHub PAT for changelog fetches.
  #[serde(default)]
  pub github_token: String,

  #[serde(default)]
  pub dockerhub_username: String,
  #[serde(default)]
  pub dockerhub_token: String,

  #[serde(default)]
  pub ghcr_username: String,
  #[serde(default)]
  pub ghcr_token: String,

  /// Base url of the VulnForge vulnerability service.
  /// Empty disables enrichment globally.
  #[serde(default)]
  pub vulnforge_url: String,
  #[serde(default)]
  pub vulnforge_api_key: String,

  #[serde(default)]
  pub logging: LogConfig,

  #[serde(default)]
  pub database: DatabaseConfig,

  #[serde(default)]
  pub ssl_enabled: bool,
  #[serde(default = "default_ssl_key_file")]
  pub ssl_key_file: PathBuf,
  #[serde(default = "default_ssl_cert_file")]
  pub ssl_cert_file: PathBuf,

  #[serde(default)]
  pub pretty_startup_config: bool,
}

fn default_title() -> String {
  String::from("TideWatch")
}

fn default_port() -> u16 {
  9120
}

fn default_bind_ip() -> String {
  String::from("[::]")
}

fn default_frontend_path() -> String {
  String::from("/app/frontend")
}

fn default_compose_dir() -> PathBuf {
  PathBuf::from("/compose")
}

fn default_data_dir() -> PathBuf {
  PathBuf::from("/data")
}

fn default_rollback_volume() -> String {
  String::from("tidewatch_rollback_data")
}

fn default_docker_host() -> String {
  String::from("unix:///var/run/docker.sock")
}

fn default_docker_compose_command() -> String {
  String::from("docker compose")
}

fn default_update_check_schedule() -> String {
  String::from("0 */6 * * *")
}

fn default_auto_update_max_concurrent() -> usize {
  2
}

fn default_restart_check_interval() -> u64 {
  30
}

fn default_restart_base_delay() -> u64 {
  10
}

fn default_restart_max_delay() -> u64 {
  3600
}

fn default_data_backup_keep() -> usize {
  3
}

fn default_metrics_retention_days() -> i64 {
  30
}

fn default_ssl_key_file() -> PathBuf {
  PathBuf::from("/config/ssl/key.pem")
}

fn default_ssl_cert_file() -> PathBuf {
  PathBuf::from("/config/ssl/cert.pem")
}

impl Default for CoreConfig {
  fn default() -> Self {
    serde_json::from_str("{}")
      .expect("default CoreConfig deserializes from empty object")
  }
}

impl CoreConfig {
  /// A copy safe to print on startup.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    config.passkey = empty_or_redacted(&config.passkey);
    config.github_token = empty_or_redacted(&config.github_token);
    config.dockerhub_token =
      empty_or_redacted(&config.dockerhub_token);
    config.ghcr_token = empty_or_redacted(&config.ghcr_token);
    config.vulnforge_api_key =
      empty_or_redacted(&config.vulnforge_api_key);
    config.database.uri = empty_or_redacted(&config.database.uri);
    config.database.password =
      empty_or_redacted(&config.database.password);
    config
  }
}
