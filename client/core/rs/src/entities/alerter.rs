use derive_builder::Builder;
use derive_variants::EnumVariants;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{I64, MongoId};

/// A configured notification endpoint. Alerts fan out to every
/// enabled alerter whose filters match.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct Alerter {
  /// The Mongo ID of the alerter.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized Alerter) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  #[cfg_attr(feature = "mongo", unique_index)]
  pub name: String,

  #[serde(default)]
  #[builder(default)]
  pub config: AlerterConfig,
}

impl Alerter {
  pub fn builder() -> AlerterBuilder {
    AlerterBuilder::default()
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AlerterConfig {
  /// Whether the alerter receives anything at all.
  #[serde(default)]
  pub enabled: bool,

  /// Only send these alert types. Empty matches everything.
  #[serde(default)]
  pub alert_types: Vec<AlertDataVariant>,

  /// Never alert for these container names.
  #[serde(default)]
  pub except_containers: Vec<String>,

  /// Only alert for these container names. Empty matches all.
  #[serde(default)]
  pub containers: Vec<String>,

  #[serde(default)]
  pub endpoint: AlerterEndpoint,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "params")]
pub enum AlerterEndpoint {
  /// POSTs the serialized [Alert] as JSON.
  Custom(CustomAlerterEndpoint),
  Slack(SlackAlerterEndpoint),
  Discord(DiscordAlerterEndpoint),
  Ntfy(NtfyAlerterEndpoint),
  Pushover(PushoverAlerterEndpoint),
}

impl Default for AlerterEndpoint {
  fn default() -> Self {
    AlerterEndpoint::Custom(Default::default())
  }
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CustomAlerterEndpoint {
  pub url: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SlackAlerterEndpoint {
  pub url: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DiscordAlerterEndpoint {
  pub url: String,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NtfyAlerterEndpoint {
  pub url: String,
  #[serde(default)]
  pub email: Option<String>,
}

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PushoverAlerterEndpoint {
  pub url: String,
}

/// One notification-worthy occurrence.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct Alert {
  /// The Mongo ID of the alert.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized Alert) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  pub id: MongoId,

  pub ts: I64,

  #[serde(default)]
  pub level: SeverityLevel,

  #[serde(default)]
  pub data: AlertData,
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
pub enum SeverityLevel {
  #[default]
  Ok,
  Warning,
  Critical,
}

#[allow(clippy::large_enum_variant)]
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, EnumVariants)]
#[variant_derive(
  Serialize,
  Deserialize,
  Debug,
  PartialEq,
  Eq,
  Hash,
  Clone,
  Copy,
  Display,
  EnumString,
  AsRefStr
)]
#[serde(tag = "type", content = "data")]
pub enum AlertData {
  /// Fired by the alerter test endpoint.
  Test {
    name: String,
  },
  UpdateAvailable {
    container_id: String,
    container_name: String,
    from_tag: String,
    to_tag: String,
    reason_summary: String,
  },
  SecurityUpdateAvailable {
    container_id: String,
    container_name: String,
    from_tag: String,
    to_tag: String,
    cves_fixed: Vec<String>,
  },
  UpdateApplied {
    container_id: String,
    container_name: String,
    from_tag: String,
    to_tag: String,
  },
  UpdateFailed {
    container_id: String,
    container_name: String,
    from_tag: String,
    to_tag: String,
    error: String,
  },
  RolledBack {
    container_id: String,
    container_name: String,
    from_tag: String,
    to_tag: String,
  },
  RestartMaxRetries {
    container_id: String,
    container_name: String,
    attempts: i64,
    last_failure_reason: String,
  },
  None {},
}

impl Default for AlertData {
  fn default() -> Self {
    AlertData::None {}
  }
}
