use tidewatch_client::entities::{
  container::{Container, UpdateScope},
  update::{ChangeType, DecisionTrace, UpdateKind},
};

use crate::{registry::FetchResponse, version};

/// What one check concluded. Pure data; the checker turns it into
/// Update rows and container mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDecision {
  pub has_update: bool,
  pub update_kind: UpdateKind,
  pub change_type: ChangeType,
  /// The in-scope candidate, when one exists.
  pub latest_tag: Option<String>,
  /// Best candidate ignoring scope, to surface blocked majors.
  pub latest_major_tag: Option<String>,
  /// A newer version exists but scope forbids adopting it.
  pub is_scope_violation: bool,
  /// The stored digest differs from the registry's.
  pub digest_changed: bool,
  /// Digest to persist on the container (set on first observation
  /// and on every change).
  pub new_digest: Option<String>,
}

/// Fuses container state with the registry fetch into an
/// [UpdateDecision] and its [DecisionTrace].
///
/// Pure: equal inputs always produce equal outputs.
pub fn decide(
  container: &Container,
  fetch: &FetchResponse,
  global_include_prereleases: bool,
) -> (UpdateDecision, DecisionTrace) {
  let include_prereleases = container
    .effective_include_prereleases(global_include_prereleases);

  let mut decision = UpdateDecision {
    latest_major_tag: fetch.latest_major_tag.clone(),
    ..Default::default()
  };

  let mut trace = DecisionTrace {
    current_tag: container.current_tag.clone(),
    scope: container.scope,
    include_prereleases,
    suffix: version::tag_suffix(&container.current_tag),
    ..Default::default()
  };

  if container.current_tag == "latest" {
    decision.update_kind = UpdateKind::Digest;
    trace.update_kind = UpdateKind::Digest;
    trace.digest_previous = container.current_digest.clone();
    trace.digest_new = fetch.digest.clone();

    match (&container.current_digest, &fetch.digest) {
      (Some(previous), Some(new)) if previous != new => {
        decision.has_update = true;
        decision.digest_changed = true;
        decision.new_digest = Some(new.clone());
        trace.digest_changed = true;
      }
      (None, Some(new)) => {
        // First observation: store the digest, report nothing.
        decision.new_digest = Some(new.clone());
      }
      _ => {}
    }
    return (decision, trace);
  }

  if let Some(latest_tag) = &fetch.latest_tag
    && latest_tag != &container.current_tag
  {
    decision.has_update = true;
    decision.latest_tag = Some(latest_tag.clone());
    decision.change_type =
      version::change_type(&container.current_tag, latest_tag);
    trace.tag_candidate = Some(latest_tag.clone());
    trace.tag_change_type = Some(decision.change_type);
  }

  // A wider candidate the scope gate would reject is still
  // surfaced for human review.
  if let Some(major_tag) = &fetch.latest_major_tag
    && major_tag != &container.current_tag
    && decision.latest_tag.as_ref() != Some(major_tag)
    && container.scope != UpdateScope::Major
    && !version::acceptable_update(
      &container.current_tag,
      major_tag,
      container.scope,
      version::host_arch(),
    )
  {
    decision.is_scope_violation = true;
    trace.blocked_major = Some(major_tag.clone());
  }

  trace.update_kind = decision.update_kind;
  trace.change_type = decision.change_type;

  (decision, trace)
}

#[cfg(test)]
mod tests {
  use tidewatch_client::entities::container::UpdatePolicy;

  use super::*;

  fn container(tag: &str, scope: UpdateScope) -> Container {
    Container::builder()
      .name("web".to_string())
      .image("nginx".to_string())
      .current_tag(tag.to_string())
      .compose_file("/compose/web.yml".to_string())
      .service_name("web".to_string())
      .scope(scope)
      .policy(UpdatePolicy::Manual)
      .build()
      .unwrap()
  }

  fn fetch(
    latest: Option<&str>,
    major: Option<&str>,
  ) -> FetchResponse {
    FetchResponse {
      latest_tag: latest.map(str::to_string),
      latest_major_tag: major.map(str::to_string),
      digest: None,
    }
  }

  #[test]
  fn tag_update_with_blocked_major() {
    let container = container("1.25.0", UpdateScope::Patch);
    let fetch = fetch(Some("1.25.3"), Some("1.26.0"));
    let (decision, trace) = decide(&container, &fetch, false);
    assert!(decision.has_update);
    assert_eq!(decision.latest_tag.as_deref(), Some("1.25.3"));
    assert_eq!(decision.change_type, ChangeType::Patch);
    assert!(decision.is_scope_violation);
    assert_eq!(trace.blocked_major.as_deref(), Some("1.26.0"));
    assert_eq!(trace.tag_candidate.as_deref(), Some("1.25.3"));
  }

  #[test]
  fn major_scope_never_violates() {
    let container = container("1.25.0", UpdateScope::Major);
    let fetch = fetch(Some("2.0.0"), Some("2.0.0"));
    let (decision, _) = decide(&container, &fetch, false);
    assert!(decision.has_update);
    assert!(!decision.is_scope_violation);
  }

  #[test]
  fn scope_violation_without_in_scope_candidate() {
    let container = container("3.9.2", UpdateScope::Minor);
    let fetch = fetch(Some("3.10.0"), Some("4.0.0"));
    let (decision, _) = decide(&container, &fetch, false);
    assert!(decision.has_update);
    assert_eq!(decision.latest_tag.as_deref(), Some("3.10.0"));
    assert!(decision.is_scope_violation);
    assert_eq!(
      decision.latest_major_tag.as_deref(),
      Some("4.0.0")
    );
  }

  #[test]
  fn digest_first_observation_stores_without_update() {
    let container = container("latest", UpdateScope::Patch);
    let fetch = FetchResponse {
      latest_tag: None,
      latest_major_tag: None,
      digest: Some("sha256:aaaa".to_string()),
    };
    let (decision, trace) = decide(&container, &fetch, false);
    assert!(!decision.has_update);
    assert!(!decision.digest_changed);
    assert_eq!(decision.new_digest.as_deref(), Some("sha256:aaaa"));
    assert!(!trace.digest_changed);
  }

  #[test]
  fn digest_change_is_an_update() {
    let mut container = container("latest", UpdateScope::Patch);
    container.current_digest = Some("sha256:aaaa".to_string());
    let fetch = FetchResponse {
      latest_tag: None,
      latest_major_tag: None,
      digest: Some("sha256:bbbb".to_string()),
    };
    let (decision, trace) = decide(&container, &fetch, false);
    assert!(decision.has_update);
    assert!(decision.digest_changed);
    assert_eq!(decision.update_kind, UpdateKind::Digest);
    assert_eq!(decision.new_digest.as_deref(), Some("sha256:bbbb"));
    assert_eq!(trace.digest_previous.as_deref(), Some("sha256:aaaa"));

    // Same digest again: nothing.
    container.current_digest = Some("sha256:bbbb".to_string());
    let (decision, _) = decide(&container, &fetch, false);
    assert!(!decision.has_update);
    assert!(decision.new_digest.is_none());
  }

  #[test]
  fn decide_is_pure() {
    let container = container("1.2.3", UpdateScope::Minor);
    let fetch = fetch(Some("1.3.0"), Some("2.0.0"));
    let first = decide(&container, &fetch, true);
    let second = decide(&container, &fetch, true);
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
  }

  #[test]
  fn container_prerelease_overrides_global() {
    let mut container = container("1.2.3", UpdateScope::Minor);
    let fetch = fetch(None, None);
    let (_, trace) = decide(&container, &fetch, true);
    assert!(trace.include_prereleases);
    container.include_prereleases = Some(false);
    let (_, trace) = decide(&container, &fetch, true);
    assert!(!trace.include_prereleases);
  }
}
