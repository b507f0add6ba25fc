use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{I64, JsonValue, tidewatch_timestamp};

/// A message on the in-process event bus. Serialized as-is onto
/// the websocket event stream.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
  #[serde(rename = "type")]
  pub kind: EventKind,
  pub container_id: String,
  pub container_name: String,
  /// Unix ms when the event was published.
  pub ts: I64,
  /// Kind-specific payload.
  #[serde(default)]
  pub data: JsonValue,
}

impl Event {
  pub fn new(
    kind: EventKind,
    container_id: impl Into<String>,
    container_name: impl Into<String>,
    data: JsonValue,
  ) -> Event {
    Event {
      kind,
      container_id: container_id.into(),
      container_name: container_name.into(),
      ts: tidewatch_timestamp(),
      data,
    }
  }
}

#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
  UpdateCheckStarted,
  UpdateCheckComplete,
  UpdateCheckError,
  UpdateAvailable,
  UpdateProgress,
  UpdateComplete,
  RollbackStarted,
  RollbackComplete,
  RestartScheduled,
  RestartMaxRetries,
}

/// Phases reported through `update-progress` events while an
/// apply runs. `progress` maps each phase onto 0..1 for UIs.
#[typeshare]
#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdatePhase {
  Starting,
  BackupCompose,
  DataBackup,
  ComposeMutated,
  Pulling,
  Deploying,
  HealthCheck,
  Committing,
  RollingBack,
  Retrying,
  Done,
}

impl UpdatePhase {
  pub fn progress(&self) -> f64 {
    match self {
      UpdatePhase::Starting => 0.0,
      UpdatePhase::BackupCompose => 0.1,
      UpdatePhase::DataBackup => 0.2,
      UpdatePhase::ComposeMutated => 0.35,
      UpdatePhase::Pulling => 0.5,
      UpdatePhase::Deploying => 0.7,
      UpdatePhase::HealthCheck => 0.85,
      UpdatePhase::Committing => 0.95,
      UpdatePhase::RollingBack => 0.95,
      UpdatePhase::Retrying => 0.95,
      UpdatePhase::Done => 1.0,
    }
  }
}
