use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use config::ConfigLoader;
use tidewatch_client::entities::{
  config::{
    DatabaseConfig,
    core::{CoreConfig, Env},
  },
  logger::LogConfig,
};

/// Reads a secret either directly from the environment or from a
/// file path given on the environment (`*_FILE` variants).
fn maybe_read_item_from_file(
  file: Option<PathBuf>,
  item: Option<String>,
) -> Option<String> {
  match file {
    Some(path) => match std::fs::read_to_string(&path) {
      Ok(contents) => Some(contents.trim().to_string()),
      Err(e) => {
        eprintln!(
          "{}: Failed to read secret file {path:?} | {e}",
          "ERROR".red()
        );
        item
      }
    },
    None => item,
  }
}

/// Resolves the full [CoreConfig]: config files first, then
/// every environment override applied on top.
pub fn load_core_config() -> anyhow::Result<CoreConfig> {
  let env: Env = envy::from_env()
    .context("Failed to parse TideWatch Core environment")?;

  let config = if env.tidewatch_config_paths.is_empty() {
    println!(
      "{}: No config paths found, using default config",
      "INFO".green(),
    );
    CoreConfig::default()
  } else {
    let config_keywords = env
      .tidewatch_config_keywords
      .iter()
      .map(String::as_str)
      .collect::<Vec<_>>();
    println!(
      "{}: {}: {config_keywords:?}",
      "INFO".green(),
      "Config File Keywords".dimmed(),
    );
    (ConfigLoader {
      paths: &env
        .tidewatch_config_paths
        .iter()
        .map(PathBuf::as_path)
        .collect::<Vec<_>>(),
      match_wildcards: &config_keywords,
      merge_nested: env.tidewatch_merge_nested_config,
      extend_array: env.tidewatch_extend_config_arrays,
      debug_print: env.tidewatch_config_debug,
    })
    .load::<CoreConfig>()
    .context("Failed at parsing config from paths")?
  };

  let logging = LogConfig {
    level: env
      .tidewatch_logging_level
      .unwrap_or(config.logging.level),
    stdio: env
      .tidewatch_logging_stdio
      .unwrap_or(config.logging.stdio),
    pretty: env
      .tidewatch_logging_pretty
      .unwrap_or(config.logging.pretty),
    otlp_endpoint: env
      .tidewatch_logging_otlp_endpoint
      .unwrap_or(config.logging.otlp_endpoint),
    opentelemetry_service_name: env
      .tidewatch_logging_opentelemetry_service_name
      .unwrap_or(config.logging.opentelemetry_service_name),
  };

  // Rebuilding CoreConfig wholesale guarantees every env
  // override is applied exactly once.
  Ok(CoreConfig {
    title: env.tidewatch_title.unwrap_or(config.title),
    host: env.tidewatch_host.unwrap_or(config.host),
    port: env.tidewatch_port.unwrap_or(config.port),
    bind_ip: env.tidewatch_bind_ip.unwrap_or(config.bind_ip),
    passkey: maybe_read_item_from_file(
      env.tidewatch_passkey_file,
      env.tidewatch_passkey,
    )
    .unwrap_or(config.passkey),
    timezone: env.tidewatch_timezone.unwrap_or(config.timezone),
    frontend_path: env
      .tidewatch_frontend_path
      .unwrap_or(config.frontend_path),
    compose_dir: env
      .tidewatch_compose_dir
      .unwrap_or(config.compose_dir),
    compose_host_base: env
      .tidewatch_compose_host_base
      .unwrap_or(config.compose_host_base),
    data_dir: env.tidewatch_data_dir.unwrap_or(config.data_dir),
    rollback_volume: env
      .tidewatch_rollback_volume
      .unwrap_or(config.rollback_volume),
    docker_host: env
      .tidewatch_docker_host
      .unwrap_or(config.docker_host),
    docker_compose_command: env
      .tidewatch_docker_compose_command
      .unwrap_or(config.docker_compose_command),
    update_check_schedule: env
      .tidewatch_update_check_schedule
      .unwrap_or(config.update_check_schedule),
    auto_update_enabled: env
      .tidewatch_auto_update_enabled
      .unwrap_or(config.auto_update_enabled),
    auto_update_max_concurrent: env
      .tidewatch_auto_update_max_concurrent
      .unwrap_or(config.auto_update_max_concurrent),
    include_prereleases: env
      .tidewatch_include_prereleases
      .unwrap_or(config.include_prereleases),
    restart_check_interval_seconds: env
      .tidewatch_restart_check_interval_seconds
      .unwrap_or(config.restart_check_interval_seconds),
    restart_base_delay_seconds: env
      .tidewatch_restart_base_delay_seconds
      .unwrap_or(config.restart_base_delay_seconds),
    restart_max_delay_seconds: env
      .tidewatch_restart_max_delay_seconds
      .unwrap_or(config.restart_max_delay_seconds),
    data_backup_keep: env
      .tidewatch_data_backup_keep
      .unwrap_or(config.data_backup_keep),
    docker_cleanup_schedule: env
      .tidewatch_docker_cleanup_schedule
      .unwrap_or(config.docker_cleanup_schedule),
    metrics_retention_days: env
      .tidewatch_metrics_retention_days
      .unwrap_or(config.metrics_retention_days),
    github_token: maybe_read_item_from_file(
      env.tidewatch_github_token_file,
      env.tidewatch_github_token,
    )
    .unwrap_or(config.github_token),
    dockerhub_username: env
      .tidewatch_dockerhub_username
      .unwrap_or(config.dockerhub_username),
    dockerhub_token: maybe_read_item_from_file(
      env.tidewatch_dockerhub_token_file,
      env.tidewatch_dockerhub_token,
    )
    .unwrap_or(config.dockerhub_token),
    ghcr_username: env
      .tidewatch_ghcr_username
      .unwrap_or(config.ghcr_username),
    ghcr_token: maybe_read_item_from_file(
      env.tidewatch_ghcr_token_file,
      env.tidewatch_ghcr_token,
    )
    .unwrap_or(config.ghcr_token),
    vulnforge_url: env
      .tidewatch_vulnforge_url
      .unwrap_or(config.vulnforge_url),
    vulnforge_api_key: maybe_read_item_from_file(
      env.tidewatch_vulnforge_api_key_file,
      env.tidewatch_vulnforge_api_key,
    )
    .unwrap_or(config.vulnforge_api_key),
    logging,
    database: DatabaseConfig {
      uri: maybe_read_item_from_file(
        env.tidewatch_database_uri_file,
        env.tidewatch_database_uri,
      )
      .unwrap_or(config.database.uri),
      address: env
        .tidewatch_database_address
        .unwrap_or(config.database.address),
      username: env
        .tidewatch_database_username
        .unwrap_or(config.database.username),
      password: env
        .tidewatch_database_password
        .unwrap_or(config.database.password),
      app_name: env
        .tidewatch_database_app_name
        .unwrap_or(config.database.app_name),
      db_name: env
        .tidewatch_database_db_name
        .unwrap_or(config.database.db_name),
    },
    ssl_enabled: env
      .tidewatch_ssl_enabled
      .unwrap_or(config.ssl_enabled),
    ssl_key_file: env
      .tidewatch_ssl_key_file
      .unwrap_or(config.ssl_key_file),
    ssl_cert_file: env
      .tidewatch_ssl_cert_file
      .unwrap_or(config.ssl_cert_file),
    pretty_startup_config: env.tidewatch_pretty_startup_config
      || config.pretty_startup_config,
  })
}
