use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{I64, MongoId};

pub const MAX_POLLS: i64 = 12;
pub const MAX_TRIGGER_ATTEMPTS: i64 = 5;
/// From this trigger attempt on, the worker calls the VulnForge
/// discover endpoint before retrying the trigger.
pub const DISCOVERY_TRIGGER_AT_ATTEMPT: i64 = 3;

/// Post-update CVE reconciliation job against VulnForge.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct PendingScanJob {
  /// The Mongo ID of the job.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized PendingScanJob) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  pub container_name: String,

  #[cfg_attr(feature = "mongo", index)]
  pub update_id: MongoId,

  #[serde(default)]
  #[builder(default)]
  #[cfg_attr(feature = "mongo", index)]
  pub status: ScanStatus,

  #[serde(default)]
  #[builder(default)]
  pub vulnforge_job_id: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub vulnforge_scan_id: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub poll_count: i64,

  #[serde(default = "default_max_polls")]
  #[builder(default = "default_max_polls()")]
  pub max_polls: i64,

  #[serde(default)]
  #[builder(default)]
  pub last_polled_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub trigger_attempt_count: i64,

  #[serde(default)]
  #[builder(default)]
  pub last_trigger_attempt_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub error_message: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub created_at: I64,
}

fn default_max_polls() -> i64 {
  MAX_POLLS
}

impl PendingScanJob {
  pub fn builder() -> PendingScanJobBuilder {
    PendingScanJobBuilder::default()
  }

  pub fn is_active(&self) -> bool {
    matches!(
      self.status,
      ScanStatus::Pending
        | ScanStatus::Triggered
        | ScanStatus::Polling
    )
  }

  pub fn polls_exhausted(&self) -> bool {
    self.poll_count >= self.max_polls
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
pub enum ScanStatus {
  #[default]
  Pending,
  Triggered,
  Polling,
  Completed,
  Failed,
}
