use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{I64, MongoId};

/// Immutable audit record of one apply attempt. At most one
/// `in_progress` row exists per container at any moment; that row
/// is the concurrency guard between the update engine, auto-apply,
/// and manual apply requests.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct UpdateHistory {
  /// The Mongo ID of the history record.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized UpdateHistory) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  #[cfg_attr(feature = "mongo", index)]
  pub container_id: MongoId,

  #[serde(default)]
  #[builder(default)]
  pub update_id: Option<MongoId>,

  pub from_tag: String,
  pub to_tag: String,

  #[serde(default)]
  #[builder(default)]
  pub update_type: UpdateType,

  #[serde(default)]
  #[builder(default)]
  pub event_type: String,

  #[serde(default)]
  #[builder(default)]
  #[cfg_attr(feature = "mongo", index)]
  pub status: HistoryStatus,

  /// Compose file backup taken before mutation.
  #[serde(default)]
  #[builder(default)]
  pub backup_path: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub data_backup_id: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub data_backup_status: Option<DataBackupStatus>,

  #[serde(default)]
  #[builder(default)]
  pub cves_fixed: Vec<String>,

  #[serde(default)]
  #[builder(default)]
  pub started_at: I64,

  #[serde(default)]
  #[builder(default)]
  pub completed_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub rolled_back_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub triggered_by: String,

  #[serde(default)]
  #[builder(default)]
  pub can_rollback: bool,

  #[serde(default)]
  #[builder(default)]
  pub error_message: Option<String>,
}

impl UpdateHistory {
  pub fn builder() -> UpdateHistoryBuilder {
    UpdateHistoryBuilder::default()
  }
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HistoryStatus {
  #[default]
  InProgress,
  Success,
  Failed,
  RolledBack,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdateType {
  #[default]
  Auto,
  Manual,
  Rollback,
  DependencyUpdate,
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataBackupStatus {
  Success,
  Partial,
  Timeout,
  Failed,
  #[default]
  Skipped,
}
