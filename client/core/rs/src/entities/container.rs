use std::sync::LazyLock;

use derive_builder::Builder;
use indexmap::IndexMap;
use partial_derive2::Partial;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use typeshare::typeshare;

use crate::entities::{I64, MongoId};

#[typeshare(serialized_as = "Partial<Container>")]
pub type _PartialContainer = PartialContainer;

/// A tracked compose service. One row per discovered container.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder, Partial)]
#[partial_derive(Serialize, Deserialize, Debug, Clone, Default)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct Container {
  /// The Mongo ID of the container.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized Container) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  /// Docker container name. Unique across the fleet.
  #[cfg_attr(feature = "mongo", unique_index)]
  pub name: String,

  /// Image without tag, eg `nginx` or `ghcr.io/owner/app`.
  pub image: String,

  /// The tag the container is currently running.
  pub current_tag: String,

  /// Manifest digest, tracked only while `current_tag == "latest"`.
  #[serde(default)]
  #[builder(default)]
  pub current_digest: Option<String>,

  /// Which registry serves this image.
  #[serde(default)]
  #[builder(default)]
  pub registry: Registry,

  /// Absolute path of the compose file, inside `/compose`.
  pub compose_file: String,

  /// Compose project name, populated from the
  /// `com.docker.compose.project` label on the running container.
  #[serde(default)]
  #[builder(default)]
  pub compose_project: String,

  /// Service name within the compose file.
  pub service_name: String,

  /// How updates to this container are approved.
  #[serde(default)]
  #[builder(default)]
  pub policy: UpdatePolicy,

  /// Maximum semver distance an update may cross.
  #[serde(default)]
  #[builder(default)]
  pub scope: UpdateScope,

  /// Tri-state: None inherits the global setting.
  #[serde(default)]
  #[builder(default)]
  pub include_prereleases: Option<bool>,

  /// Whether updates are enriched with VulnForge CVE data.
  #[serde(default)]
  #[builder(default)]
  pub vulnforge_enabled: bool,

  #[serde(default)]
  #[builder(default)]
  pub health_check_url: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub health_check_method: HealthCheckMethod,

  /// `header:KEY=VALUE`, `token:BEARER`, or `query:KEY=VALUE`.
  #[serde(default)]
  #[builder(default)]
  pub health_check_auth: Option<String>,

  /// GitHub `owner/repo` used for changelog lookups.
  #[serde(default)]
  #[builder(default)]
  pub release_source: Option<String>,

  /// Cron expression restricting when approved updates auto-apply.
  #[serde(default)]
  #[builder(default)]
  pub update_window: Option<String>,

  /// Names of containers that must be updated before this one.
  /// Auto-apply orders its batch along this graph.
  #[serde(default)]
  #[builder(default)]
  pub dependencies: Vec<String>,

  /// Best in-scope candidate from the last check.
  #[serde(default)]
  #[builder(default)]
  pub latest_tag: Option<String>,

  /// Best candidate ignoring scope, to surface blocked majors.
  #[serde(default)]
  #[builder(default)]
  pub latest_major_tag: Option<String>,

  #[serde(default)]
  #[builder(default)]
  pub update_available: bool,

  #[serde(default)]
  #[builder(default)]
  pub last_checked: Option<I64>,

  #[serde(default)]
  #[builder(default)]
  pub last_updated: Option<I64>,

  /// Whether the restart supervisor watches this container.
  #[serde(default)]
  #[builder(default)]
  pub auto_restart_enabled: bool,

  /// Sanitized labels from the compose service.
  #[serde(default)]
  #[builder(default)]
  pub labels: IndexMap<String, String>,

  #[serde(default)]
  #[builder(default)]
  pub created_at: I64,

  #[serde(default)]
  #[builder(default)]
  pub updated_at: I64,
}

impl Container {
  pub fn builder() -> ContainerBuilder {
    ContainerBuilder::default()
  }

  /// The effective prerelease flag, falling back to the global
  /// setting when the container does not pin one.
  pub fn effective_include_prereleases(
    &self,
    global: bool,
  ) -> bool {
    self.include_prereleases.unwrap_or(global)
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
  Hash,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Registry {
  #[default]
  Dockerhub,
  Ghcr,
  Lscr,
  Gcr,
  Quay,
}

impl Registry {
  /// Maps a registry host (as written in compose image strings)
  /// onto the registry it belongs to.
  pub fn from_host(host: &str) -> Option<Registry> {
    match host {
      "docker.io" | "registry-1.docker.io" | "hub.docker.com" => {
        Some(Registry::Dockerhub)
      }
      "ghcr.io" => Some(Registry::Ghcr),
      "lscr.io" => Some(Registry::Lscr),
      "gcr.io" => Some(Registry::Gcr),
      "quay.io" => Some(Registry::Quay),
      _ => None,
    }
  }

  /// Splits an image reference into (registry, repository, tag).
  /// Unknown hosts fall back to Docker Hub with the host kept in
  /// the repository, matching docker's own resolution.
  pub fn parse_image(image: &str) -> (Registry, String, String) {
    let (reference, tag) = match image.rsplit_once(':') {
      // `:` could also belong to a host:port, which contains `/` after it
      Some((reference, tag)) if !tag.contains('/') => {
        (reference, tag.to_string())
      }
      _ => (image, String::from("latest")),
    };
    match reference.split_once('/') {
      Some((host, repo)) if host.contains('.') => {
        match Registry::from_host(host) {
          Some(registry) => (registry, repo.to_string(), tag),
          None => (
            Registry::Dockerhub,
            reference.to_string(),
            tag,
          ),
        }
      }
      _ => (Registry::Dockerhub, reference.to_string(), tag),
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
  Default,
  PartialEq,
  Eq,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UpdatePolicy {
  Auto,
  #[default]
  Manual,
  Disabled,
  Security,
  PatchOnly,
  MinorAndPatch,
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
pub enum UpdateScope {
  #[default]
  Patch,
  Minor,
  Major,
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
pub enum HealthCheckMethod {
  #[default]
  Auto,
  Http,
  Docker,
}

/// Observed health of a container, for the details endpoint.
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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Unhealthy,
  Stopped,
  #[default]
  Unknown,
}

static CONTAINER_NAME: LazyLock<regex::Regex> =
  LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,254}$")
      .unwrap()
  });

/// Docker container naming rules.
pub fn valid_container_name(name: &str) -> bool {
  CONTAINER_NAME.is_match(name)
}

pub const MAX_LABELS: usize = 100;
pub const MAX_LABEL_KEY_LEN: usize = 255;
pub const MAX_LABEL_VALUE_LEN: usize = 4096;

/// Caps label count / lengths and strips control characters.
pub fn sanitize_labels(
  labels: impl IntoIterator<Item = (String, String)>,
) -> IndexMap<String, String> {
  labels
    .into_iter()
    .take(MAX_LABELS)
    .filter(|(key, _)| key.len() <= MAX_LABEL_KEY_LEN)
    .map(|(key, value)| {
      let mut value = value
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
      value.truncate(MAX_LABEL_VALUE_LEN);
      (key.chars().filter(|c| !c.is_control()).collect(), value)
    })
    .collect()
}

/// A container record produced by compose discovery, before it is
/// reconciled with the persisted [Container]. Carries transient
/// flags about which fields came from `tidewatch.*` compose labels
/// so sync can tell label overrides from user settings. Never
/// persisted.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
  pub name: String,
  pub image: String,
  pub current_tag: String,
  pub registry: Registry,
  pub compose_file: String,
  pub compose_project: String,
  pub service_name: String,
  pub policy: Option<UpdatePolicy>,
  pub scope: Option<UpdateScope>,
  pub include_prereleases: Option<bool>,
  pub vulnforge_enabled: Option<bool>,
  pub enabled: Option<bool>,
  pub health_check_url: Option<String>,
  pub health_check_method: Option<HealthCheckMethod>,
  pub labels: IndexMap<String, String>,
  /// True for each field above that was set by a compose label
  /// rather than left for user settings to fill.
  pub policy_from_compose: bool,
  pub scope_from_compose: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_parsing_detects_registry() {
    assert_eq!(
      Registry::parse_image("nginx:1.25.0"),
      (Registry::Dockerhub, "nginx".to_string(), "1.25.0".into())
    );
    assert_eq!(
      Registry::parse_image("ghcr.io/owner/app:v2"),
      (Registry::Ghcr, "owner/app".to_string(), "v2".into())
    );
    assert_eq!(
      Registry::parse_image("lscr.io/linuxserver/plex"),
      (
        Registry::Lscr,
        "linuxserver/plex".to_string(),
        "latest".into()
      )
    );
    assert_eq!(
      Registry::parse_image("quay.io/coreos/etcd:3.5.0"),
      (Registry::Quay, "coreos/etcd".to_string(), "3.5.0".into())
    );
  }

  #[test]
  fn container_names_follow_docker_rules() {
    assert!(valid_container_name("web-1"));
    assert!(valid_container_name("a"));
    assert!(!valid_container_name("-leading-dash"));
    assert!(!valid_container_name(""));
    assert!(!valid_container_name(&"x".repeat(256)));
  }

  #[test]
  fn labels_are_sanitized() {
    let labels = sanitize_labels(vec![
      ("app".to_string(), "web\x07app".to_string()),
      ("x".repeat(300), "dropped".to_string()),
    ]);
    assert_eq!(labels.len(), 1);
    assert_eq!(labels["app"], "webapp");
  }
}
