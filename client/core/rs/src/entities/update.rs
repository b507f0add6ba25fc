use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{
  I64, JsonValue, MongoId,
  container::{Registry, UpdateScope},
};

/// An opportunity to move one container from `from_tag` to
/// `to_tag`. At most one active row per
/// `(container_id, from_tag, to_tag)`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct Update {
  /// The Mongo ID of the update.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized Update) }`
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

  pub from_tag: String,
  pub to_tag: String,

  #[serde(default)]
  #[builder(default)]
  pub registry: Registry,

  #[serde(default)]
  #[builder(default)]
  pub reason_type: ReasonType,

  #[serde(default)]
  #[builder(default)]
  pub reason_summary: String,

  #[serde(default)]
  #[builder(default)]
  pub recommendation: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub changelog: Option<JsonValue>,

  #[serde(default)]
  #[builder(default)]
  pub changelog_url: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub cves_fixed: Vec<String>,

  #[serde(default)]
  #[builder(default)]
  pub current_vulns: i64,

  #[serde(default)]
  #[builder(default)]
  pub new_vulns: i64,

  /// new_vulns - current_vulns. Negative is an improvement.
  #[serde(default)]
  #[builder(default)]
  pub vuln_delta: i64,

  #[serde(default)]
  #[builder(default)]
  #[cfg_attr(feature = "mongo", index)]
  pub status: UpdateStatus,

  /// A newer version exists but scope forbids adopting it.
  #[serde(default)]
  #[builder(default)]
  pub scope_violation: bool,

  #[serde(default)]
  #[builder(default)]
  pub update_kind: UpdateKind,

  #[serde(default)]
  #[builder(default)]
  pub change_type: ChangeType,

  /// Opaque record of every input / branch the decision maker
  /// consulted for this check. See [DecisionTrace].
  #[serde(default)]
  #[builder(default)]
  pub decision_trace: Option<JsonValue>,

  #[serde(default)]
  #[builder(default)]
  pub retry_count: i64,

  #[serde(default = "default_max_retries")]
  #[builder(default = "default_max_retries()")]
  pub max_retries: i64,

  #[serde(default = "default_backoff_multiplier")]
  #[builder(default = "default_backoff_multiplier()")]
  pub backoff_multiplier: i64,

  #[serde(default)]
  #[builder(default)]
  pub next_retry_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub last_error: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub approved_by: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub approved_at: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub rejection_reason: Option<String>,

  /// Optimistic lock, bumped on every write.
  #[serde(default)]
  #[builder(default)]
  pub version: i64,

  #[serde(default)]
  #[builder(default)]
  pub created_at: I64,

  #[serde(default)]
  #[builder(default)]
  pub updated_at: I64,
}

fn default_max_retries() -> i64 {
  3
}

fn default_backoff_multiplier() -> i64 {
  3
}

impl Update {
  pub fn builder() -> UpdateBuilder {
    UpdateBuilder::default()
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
pub enum UpdateStatus {
  #[default]
  Pending,
  Approved,
  Rejected,
  Applied,
  Failed,
  PendingRetry,
  RolledBack,
}

/// The statuses under which an Update still occupies the unique
/// `(container_id, from_tag, to_tag)` slot.
pub const ACTIVE_UPDATE_STATUSES: [UpdateStatus; 3] = [
  UpdateStatus::Pending,
  UpdateStatus::Approved,
  UpdateStatus::PendingRetry,
];

impl UpdateStatus {
  pub fn is_active(&self) -> bool {
    ACTIVE_UPDATE_STATUSES.contains(self)
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      UpdateStatus::Applied
        | UpdateStatus::Failed
        | UpdateStatus::RolledBack
        | UpdateStatus::Rejected
    )
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReasonType {
  Security,
  Feature,
  Maintenance,
  Bugfix,
  #[default]
  Unknown,
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateKind {
  #[default]
  Tag,
  Digest,
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeType {
  Patch,
  Minor,
  Major,
  #[default]
  Unknown,
}

/// Structured, versioned record of one update check. Persisted as
/// an opaque JSON object on the [Update]; unknown fields are
/// ignored on read so old cores can read new traces.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecisionTrace {
  #[serde(default = "default_trace_version")]
  pub trace_version: u32,
  #[serde(default)]
  pub current_tag: String,
  #[serde(default)]
  pub scope: UpdateScope,
  #[serde(default)]
  pub include_prereleases: bool,
  /// The non-numeric suffix the current tag pins, if any.
  #[serde(default)]
  pub suffix: Option<String>,
  /// The in-scope candidate, if one was found.
  #[serde(default)]
  pub tag_candidate: Option<String>,
  #[serde(default)]
  pub tag_change_type: Option<ChangeType>,
  /// A newer major that scope blocked.
  #[serde(default)]
  pub blocked_major: Option<String>,
  #[serde(default)]
  pub digest_previous: Option<String>,
  #[serde(default)]
  pub digest_new: Option<String>,
  #[serde(default)]
  pub digest_changed: bool,
  #[serde(default)]
  pub update_kind: UpdateKind,
  #[serde(default)]
  pub change_type: ChangeType,
}

pub fn default_trace_version() -> u32 {
  1
}

impl Default for DecisionTrace {
  fn default() -> Self {
    DecisionTrace {
      trace_version: default_trace_version(),
      current_tag: Default::default(),
      scope: Default::default(),
      include_prereleases: Default::default(),
      suffix: Default::default(),
      tag_candidate: Default::default(),
      tag_change_type: Default::default(),
      blocked_major: Default::default(),
      digest_previous: Default::default(),
      digest_new: Default::default(),
      digest_changed: Default::default(),
      update_kind: Default::default(),
      change_type: Default::default(),
    }
  }
}

impl DecisionTrace {
  pub fn to_json(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn active_statuses_hold_the_unique_slot() {
    assert!(UpdateStatus::Pending.is_active());
    assert!(UpdateStatus::Approved.is_active());
    assert!(UpdateStatus::PendingRetry.is_active());
    assert!(!UpdateStatus::Applied.is_active());
    assert!(!UpdateStatus::Rejected.is_active());
  }

  #[test]
  fn trace_ignores_unknown_fields_on_read() {
    let raw = serde_json::json!({
      "trace_version": 2,
      "current_tag": "1.2.3",
      "scope": "patch",
      "some_future_field": { "nested": true },
    });
    let trace: DecisionTrace =
      serde_json::from_value(raw).unwrap();
    assert_eq!(trace.trace_version, 2);
    assert_eq!(trace.current_tag, "1.2.3");
  }
}
