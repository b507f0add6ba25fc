//! Request and response bodies for the TideWatch HTTP API.

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{
  I64, JsonValue, MongoId,
  container::{Container, HealthStatus, UpdatePolicy},
  history::UpdateHistory,
  update::{Update, UpdateStatus},
};

/// Query params for `GET /containers`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListContainersQuery {
  #[serde(default)]
  pub skip: Option<u64>,
  #[serde(default)]
  pub limit: Option<i64>,
  #[serde(default)]
  pub policy: Option<UpdatePolicy>,
  /// Substring match on container name.
  #[serde(default)]
  pub name: Option<String>,
  /// Substring match on image.
  #[serde(default)]
  pub image: Option<String>,
}

/// Response for `GET /containers/{id}/details`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContainerDetails {
  pub container: Container,
  pub current_update: Option<Update>,
  /// Most recent first, capped at 20.
  pub history: Vec<UpdateHistory>,
  pub health_status: HealthStatus,
  pub last_health_check: Option<I64>,
}

/// Body for `PUT /containers/{id}/dependencies`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateDependenciesBody {
  /// Container names this container depends on. Replaces the
  /// stored list wholesale.
  pub dependencies: Vec<String>,
}

/// Response for `POST /containers/sync`.
#[typeshare]
#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq,
)]
pub struct SyncSummary {
  pub added: usize,
  pub updated: usize,
  pub unchanged: usize,
  pub total: usize,
}

/// Query params for `GET /updates`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListUpdatesQuery {
  #[serde(default)]
  pub status: Option<UpdateStatus>,
  #[serde(default)]
  pub container_id: Option<MongoId>,
  #[serde(default)]
  pub skip: Option<u64>,
  #[serde(default)]
  pub limit: Option<i64>,
}

/// Response for `POST /updates/check[/{container_id}]`.
#[typeshare]
#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq,
)]
pub struct CheckSummary {
  pub checked: usize,
  pub updates_found: usize,
  pub errors: usize,
  pub total: usize,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApproveUpdateBody {
  pub approved_by: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RejectUpdateBody {
  #[serde(default)]
  pub reason: Option<String>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApplyUpdateBody {
  pub triggered_by: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BatchUpdateBody {
  pub update_ids: Vec<MongoId>,
  #[serde(default)]
  pub reason: Option<String>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BatchUpdateResponse {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub approved_count: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rejected_count: Option<usize>,
  pub failed_count: usize,
  #[serde(default)]
  pub failed_ids: Vec<MongoId>,
}

/// Standard `{success, message}` response for actions that either
/// work or surface a reason (restart, apply rejection, ...).
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ActionResponse {
  pub success: bool,
  pub message: String,
}

/// Response for `POST /settings/test/{target}`.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectionTestResponse {
  pub success: bool,
  pub message: String,
  #[serde(default)]
  pub details: JsonValue,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateSettingBody {
  pub value: JsonValue,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BatchSettingsBody {
  pub settings: indexmap::IndexMap<String, JsonValue>,
}
