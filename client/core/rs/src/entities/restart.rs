use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{I64, MongoId};

/// Per-container crash loop bookkeeping for the restart
/// supervisor.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct RestartState {
  /// The Mongo ID of the restart state.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized RestartState) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  #[cfg_attr(feature = "mongo", unique_index)]
  pub container_id: MongoId,

  #[serde(default = "default_enabled")]
  #[builder(default = "default_enabled()")]
  pub enabled: bool,

  #[serde(default = "default_max_attempts")]
  #[builder(default = "default_max_attempts()")]
  pub max_attempts: i64,

  #[serde(default)]
  #[builder(default)]
  pub consecutive_failures: i64,

  #[serde(default)]
  #[builder(default)]
  pub last_successful_start: Option<I64>,

  /// Uptime (seconds) after which a running container counts as
  /// recovered and its backoff resets.
  #[serde(default = "default_success_window")]
  #[builder(default = "default_success_window()")]
  pub success_window_seconds: i64,

  #[serde(default)]
  #[builder(default)]
  pub next_retry_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub last_failure_reason: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub last_exit_code: Option<i64>,

  /// Circuit breaker: once true, no further restarts are
  /// scheduled until the container recovers or the state resets.
  #[serde(default)]
  #[builder(default)]
  pub max_retries_reached: bool,
}

fn default_enabled() -> bool {
  true
}

fn default_max_attempts() -> i64 {
  5
}

fn default_success_window() -> i64 {
  300
}

impl RestartState {
  pub fn builder() -> RestartStateBuilder {
    RestartStateBuilder::default()
  }
}
