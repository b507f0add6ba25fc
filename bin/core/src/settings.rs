use anyhow::Context;
use mungos::mongodb::bson::{doc, to_bson};
use serde_json::Value;
use tidewatch_client::entities::{
  config::mask_sensitive, setting::Setting, tidewatch_timestamp,
};

use crate::state::AppState;

/// Keys whose values are masked in API reads.
const SENSITIVE_KEYS: &[&str] = &[
  "github_token",
  "dockerhub_token",
  "ghcr_token",
  "vulnforge_api_key",
  "passkey",
];

/// Settings whose change requires the update-check scheduler to
/// be rebuilt.
pub const SCHEDULE_KEYS: &[&str] =
  &["update_check_schedule", "docker_cleanup_schedule"];

pub fn is_sensitive(key: &str) -> bool {
  SENSITIVE_KEYS.contains(&key)
}

pub async fn get(
  state: &AppState,
  key: &str,
) -> anyhow::Result<Option<Value>> {
  let setting = state
    .db
    .settings
    .find_one(doc! { "key": key })
    .await
    .context("failed to query settings")?;
  Ok(setting.map(|setting| setting.value))
}

pub async fn get_string(
  state: &AppState,
  key: &str,
) -> anyhow::Result<Option<String>> {
  Ok(get(state, key).await?.and_then(|value| match value {
    Value::String(s) => Some(s),
    other => Some(other.to_string()),
  }))
}

pub async fn get_bool(
  state: &AppState,
  key: &str,
  default: bool,
) -> anyhow::Result<bool> {
  Ok(
    get(state, key)
      .await?
      .and_then(|value| value.as_bool())
      .unwrap_or(default),
  )
}

pub async fn get_i64(
  state: &AppState,
  key: &str,
  default: i64,
) -> anyhow::Result<i64> {
  Ok(
    get(state, key)
      .await?
      .and_then(|value| value.as_i64())
      .unwrap_or(default),
  )
}

pub async fn set(
  state: &AppState,
  key: &str,
  value: Value,
  category: &str,
) -> anyhow::Result<()> {
  let value_bson =
    to_bson(&value).context("setting value is not valid bson")?;
  state
    .db
    .settings
    .update_one(
      doc! { "key": key },
      doc! { "$set": {
        "value": value_bson,
        "category": category,
        "sensitive": is_sensitive(key),
        "updated_at": tidewatch_timestamp(),
      } },
    )
    .upsert(true)
    .await
    .context("failed to upsert setting")?;
  Ok(())
}

pub async fn delete_all(state: &AppState) -> anyhow::Result<u64> {
  let deleted = state
    .db
    .settings
    .delete_many(doc! {})
    .await
    .context("failed to reset settings")?;
  Ok(deleted.deleted_count)
}

/// Masks a setting for API responses.
pub fn masked(mut setting: Setting) -> Setting {
  if setting.sensitive || is_sensitive(&setting.key) {
    if let Value::String(s) = &setting.value {
      let masked = mask_sensitive(s);
      setting.value = Value::String(masked);
    }
  }
  setting
}

// Effective values: DB settings override the boot config.

pub async fn auto_update_enabled(
  state: &AppState,
) -> anyhow::Result<bool> {
  get_bool(
    state,
    "auto_update_enabled",
    state.config.auto_update_enabled,
  )
  .await
}

pub async fn auto_update_max_concurrent(
  state: &AppState,
) -> anyhow::Result<usize> {
  Ok(
    get_i64(
      state,
      "auto_update_max_concurrent",
      state.config.auto_update_max_concurrent as i64,
    )
    .await?
    .max(1) as usize,
  )
}

pub async fn include_prereleases(
  state: &AppState,
) -> anyhow::Result<bool> {
  get_bool(
    state,
    "include_prereleases",
    state.config.include_prereleases,
  )
  .await
}

pub async fn update_check_schedule(
  state: &AppState,
) -> anyhow::Result<String> {
  Ok(
    get_string(state, "update_check_schedule")
      .await?
      .filter(|schedule| !schedule.is_empty())
      .unwrap_or_else(|| {
        state.config.update_check_schedule.clone()
      }),
  )
}

pub async fn docker_compose_argv(
  state: &AppState,
) -> anyhow::Result<Vec<String>> {
  let template = get_string(state, "docker_compose_command")
    .await?
    .filter(|template| !template.is_empty())
    .unwrap_or_else(|| {
      state.config.docker_compose_command.clone()
    });
  command::parse_command_template(&template)
}

pub async fn vulnforge_url(
  state: &AppState,
) -> anyhow::Result<String> {
  Ok(
    get_string(state, "vulnforge_url")
      .await?
      .filter(|url| !url.is_empty())
      .unwrap_or_else(|| state.config.vulnforge_url.clone()),
  )
}

pub async fn vulnforge_api_key(
  state: &AppState,
) -> anyhow::Result<String> {
  Ok(
    get_string(state, "vulnforge_api_key")
      .await?
      .filter(|key| !key.is_empty())
      .unwrap_or_else(|| state.config.vulnforge_api_key.clone()),
  )
}
