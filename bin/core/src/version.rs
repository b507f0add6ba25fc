use std::cmp::Ordering;

use semver::{Prerelease, Version};
use tidewatch_client::entities::update::ChangeType;

/// Prerelease markers that a strict version parse won't catch.
/// Common in docker tags but not in standard version grammars.
/// Entries ending in '-' are prefix patterns (`pr-123`).
const NON_STANDARD_PRERELEASE_TOKENS: &[&str] = &[
  "nightly",
  "develop",
  "dev",
  "master",
  "main",
  "preview",
  "unstable",
  "snapshot",
  "canary",
  "edge",
  "test",
  "testing",
  "experimental",
  "exp",
  "pr-",
  "pull-",
  "branch-",
  "feat-",
  "feature-",
  "fix-",
  "hotfix-",
];

/// Arch suffixes recognized at the end of tags, longest first so
/// `arm64v8` wins over `arm`.
const ARCH_SUFFIXES: &[&str] = &[
  "windowsservercore", // never selected, but recognized
  "amd64v2",
  "arm32v7",
  "arm32v6",
  "aarch64",
  "arm64v8",
  "ppc64le",
  "x86_64",
  "riscv64",
  "armv7l",
  "amd64",
  "arm64",
  "s390x",
  "armv7",
  "armhf",
  "armv6",
  "i386",
  "arm",
  "386",
];

const WINDOWS_TOKENS: &[&str] = &[
  "windowsservercore",
  "nanoserver",
  "ltsc",
  "windowsserver",
  "-windows",
];

/// Version suffixes that count as prereleases under strict
/// parsing (the parse-level arm of the hybrid detection).
const STANDARD_PRERELEASE_PREFIXES: &[&str] =
  &["alpha", "beta", "rc", "pre", "dev", "a", "b", "c"];

pub fn canonical_arch(suffix: &str) -> &str {
  match suffix {
    "x86_64" | "amd64v2" => "amd64",
    "arm64v8" | "aarch64" => "arm64",
    "arm32v7" | "armv7l" | "armv7" | "armhf" => "arm",
    "arm32v6" | "armv6" => "armv6",
    "i386" => "386",
    other => other,
  }
}

/// The canonical suffix of the machine this process runs on.
pub fn host_arch() -> &'static str {
  canonical_arch(std::env::consts::ARCH)
}

/// Lenient version parse: strips a leading `v`, drops `+build`
/// metadata, pads missing minor / patch components. A suffix
/// after the first `-` or `_` becomes semver prerelease when it
/// looks like one, and is otherwise ignored for ordering (flavor
/// suffixes like `-alpine` are handled by suffix pinning instead).
pub fn parse_version(tag: &str) -> Option<Version> {
  let tag = tag.trim().to_lowercase();
  let tag = tag.strip_prefix('v').unwrap_or(&tag);
  if tag == "latest" {
    return None;
  }
  let tag = tag.split('+').next().unwrap_or(tag);

  let (base, suffix) = match tag.split_once(['-', '_']) {
    Some((base, suffix)) => (base, Some(suffix)),
    None => (tag, None),
  };

  let mut parts = [0u64; 3];
  let mut count = 0;
  for part in base.split('.') {
    if count == 3 {
      // Extra release components beyond patch are ignored.
      break;
    }
    parts[count] = part.parse().ok()?;
    count += 1;
  }
  if count == 0 {
    return None;
  }

  let mut version = Version::new(parts[0], parts[1], parts[2]);
  if let Some(suffix) = suffix
    && is_standard_prerelease_suffix(suffix)
    && let Ok(pre) = Prerelease::new(&suffix.replace('_', "-"))
  {
    version.pre = pre;
  }
  Some(version)
}

fn is_standard_prerelease_suffix(suffix: &str) -> bool {
  STANDARD_PRERELEASE_PREFIXES.iter().any(|prefix| {
    suffix
      .strip_prefix(prefix)
      .map(|rest| {
        rest.is_empty()
          || rest
            .trim_start_matches(['.', '-'])
            .chars()
            .all(|c| c.is_ascii_digit())
      })
      .unwrap_or(false)
  })
}

/// Hybrid prerelease detection.
///
/// 1. A parseable version with a prerelease segment is one.
/// 2. A parse failure retries on the base before `-` / `_`, and a
///    known token in the suffix makes it one.
/// 3. Finally the whole tag is checked segment-wise (split on
///    `[-_.]`) against the token list, so `latest` does not match
///    `test` but `1.0-pr-123` matches `pr-`.
pub fn is_prerelease_tag(tag: &str) -> bool {
  let lower = tag.trim().to_lowercase();
  let lower = lower.strip_prefix('v').unwrap_or(&lower);
  let without_meta = lower.split('+').next().unwrap_or(lower);

  if let Some(version) = parse_version(without_meta)
    && !version.pre.is_empty()
  {
    return true;
  }

  if let Some((base, suffix)) = without_meta.split_once(['-', '_'])
    && parse_version(base).is_some()
  {
    let suffix = suffix.to_lowercase();
    if NON_STANDARD_PRERELEASE_TOKENS
      .iter()
      .any(|token| suffix.contains(token.trim_end_matches('-')))
    {
      return true;
    }
  }

  let segments =
    lower.split(['-', '_', '.']).collect::<Vec<_>>();
  for token in NON_STANDARD_PRERELEASE_TOKENS {
    if token.ends_with('-') {
      // Prefix tokens match when they start any segment:
      // `pr-123` and `1.0-pr-123` match `pr-`, `april` does not.
      if lower.starts_with(token)
        || ['-', '_', '.']
          .iter()
          .any(|sep| lower.contains(&format!("{sep}{token}")))
      {
        return true;
      }
    } else if segments.contains(token) {
      return true;
    }
  }

  false
}

/// The flavor suffix a tag pins, eg `alpine` for `3.12-alpine`.
/// Lowercased remainder after the first `-`.
pub fn tag_suffix(tag: &str) -> Option<String> {
  let tag = tag.trim();
  let tag = tag
    .strip_prefix('v')
    .or_else(|| tag.strip_prefix('V'))
    .unwrap_or(tag);
  tag
    .split_once('-')
    .map(|(_, suffix)| suffix.to_lowercase())
}

/// Canonical arch suffix of a tag, if it carries one.
pub fn tag_arch_suffix(tag: &str) -> Option<&'static str> {
  let lower = tag.to_lowercase();
  ARCH_SUFFIXES
    .iter()
    .find(|suffix| lower.ends_with(&format!("-{suffix}")))
    .map(|suffix| canonical_arch(suffix))
}

pub fn is_windows_tag(tag: &str) -> bool {
  let lower = tag.to_lowercase();
  WINDOWS_TOKENS.iter().any(|token| lower.contains(token))
}

/// Candidate targets an incompatible architecture.
///
/// - Both tags arch-suffixed: suffixes must match.
/// - Only current suffixed: the user pinned an arch-specific tag
///   style, don't switch styles.
/// - Only candidate suffixed: must equal the host arch.
fn arch_mismatch(
  current: &str,
  candidate: &str,
  host: &str,
) -> bool {
  match (tag_arch_suffix(current), tag_arch_suffix(candidate)) {
    (Some(current), Some(candidate)) => current != candidate,
    (Some(_), None) => true,
    (None, Some(candidate)) => candidate != host,
    (None, None) => false,
  }
}

/// Whether `candidate` is an acceptable move from `current`
/// under `scope`. Assumes suffix pinning was already applied.
pub fn acceptable_update(
  current: &str,
  candidate: &str,
  scope: Scope,
  host: &str,
) -> bool {
  if is_windows_tag(candidate) {
    return false;
  }
  if arch_mismatch(current, candidate, host) {
    return false;
  }

  let (Some(current), Some(candidate)) =
    (parse_version(current), parse_version(candidate))
  else {
    // Neither parses as a version: fall back to string order.
    return candidate > current;
  };

  if candidate.cmp(&current) != Ordering::Greater {
    return false;
  }

  match scope {
    Scope::Patch => {
      candidate.major == current.major
        && candidate.minor == current.minor
    }
    Scope::Minor => candidate.major == current.major,
    Scope::Major => true,
  }
}

pub use tidewatch_client::entities::container::UpdateScope as Scope;

/// Classifies the semver distance between two tags.
pub fn change_type(current: &str, candidate: &str) -> ChangeType {
  let (Some(current), Some(candidate)) =
    (parse_version(current), parse_version(candidate))
  else {
    return ChangeType::Unknown;
  };
  if candidate.major != current.major {
    ChangeType::Major
  } else if candidate.minor != current.minor {
    ChangeType::Minor
  } else if candidate.patch != current.patch
    || candidate.pre != current.pre
  {
    ChangeType::Patch
  } else {
    ChangeType::Unknown
  }
}

/// Picks the best acceptable candidate, or None.
///
/// Filters: `latest` itself, non-parseable tags, prereleases
/// (unless allowed), flavor-suffix mismatches, then the
/// scope / arch / windows gate. Greatest parsed version wins;
/// string order breaks ties, so shuffling the input cannot
/// change the answer.
pub fn select_latest_tag(
  current_tag: &str,
  candidates: &[String],
  scope: Scope,
  include_prereleases: bool,
  host: &str,
) -> Option<String> {
  let current_suffix = tag_suffix(current_tag);
  let mut best: Option<(Version, &str)> = None;

  for candidate in candidates {
    if candidate.eq_ignore_ascii_case("latest") {
      continue;
    }
    let Some(parsed) = parse_version(candidate) else {
      continue;
    };
    if !include_prereleases && is_prerelease_tag(candidate) {
      continue;
    }
    if tag_suffix(candidate) != current_suffix {
      continue;
    }
    if !acceptable_update(current_tag, candidate, scope, host) {
      continue;
    }
    let better = match &best {
      None => true,
      Some((best_version, best_tag)) => {
        match parsed.cmp(best_version) {
          Ordering::Greater => true,
          Ordering::Equal => candidate.as_str() > *best_tag,
          Ordering::Less => false,
        }
      }
    };
    if better {
      best = Some((parsed, candidate));
    }
  }

  best.map(|(_, tag)| tag.to_string())
}

/// The informational best-major lookup: same selection, scope
/// forced wide open.
pub fn select_latest_major_tag(
  current_tag: &str,
  candidates: &[String],
  include_prereleases: bool,
  host: &str,
) -> Option<String> {
  select_latest_tag(
    current_tag,
    candidates,
    Scope::Major,
    include_prereleases,
    host,
  )
}

/// True when every parseable tag on a registry page is at or
/// below the current version, letting pagination stop early.
pub fn page_exhausted(current_tag: &str, page: &[String]) -> bool {
  let Some(current) = parse_version(current_tag) else {
    return false;
  };
  let mut saw_version = false;
  for tag in page {
    if let Some(version) = parse_version(tag) {
      saw_version = true;
      if version > current {
        return false;
      }
    }
  }
  saw_version
}

#[cfg(test)]
mod tests {
  use super::*;

  const AMD64: &str = "amd64";

  fn tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
  }

  #[test]
  fn parses_common_tag_shapes() {
    assert_eq!(
      parse_version("1.25.3"),
      Some(Version::new(1, 25, 3))
    );
    assert_eq!(parse_version("v2.1"), Some(Version::new(2, 1, 0)));
    assert_eq!(parse_version("14"), Some(Version::new(14, 0, 0)));
    assert_eq!(
      parse_version("1.2.3+build5"),
      Some(Version::new(1, 2, 3))
    );
    // flavor suffix does not affect ordering
    assert_eq!(
      parse_version("3.12-alpine"),
      Some(Version::new(3, 12, 0))
    );
    assert_eq!(parse_version("latest"), None);
    assert_eq!(parse_version("bookworm"), None);
  }

  #[test]
  fn prerelease_suffixes_order_below_release() {
    let rc = parse_version("1.2.3-rc1").unwrap();
    assert!(!rc.pre.is_empty());
    assert!(rc < Version::new(1, 2, 3));
  }

  #[test]
  fn hybrid_prerelease_detection() {
    for tag in [
      "1.2.3-rc1",
      "1.2.3-beta.2",
      "4.6.0-unstable",
      "nightly",
      "2.0-nightly",
      "pr-123",
      "1.0-pr-123",
      "5.1_dev",
      "edge",
    ] {
      assert!(is_prerelease_tag(tag), "expected prerelease: {tag}");
    }
    for tag in ["latest", "1.2.3", "3.12-alpine", "v2.1", "stable"]
    {
      assert!(!is_prerelease_tag(tag), "false positive: {tag}");
    }
  }

  #[test]
  fn latest_does_not_match_test_token() {
    // segment-aware matching, not substring
    assert!(!is_prerelease_tag("latest"));
    assert!(is_prerelease_tag("1.0-test"));
  }

  #[test]
  fn scope_gate_boundary_vector() {
    let candidates = tags(&["1.2.4", "1.3.0", "2.0.0"]);
    assert_eq!(
      select_latest_tag(
        "1.2.3",
        &candidates,
        Scope::Patch,
        false,
        AMD64
      ),
      Some("1.2.4".to_string())
    );
    assert_eq!(
      select_latest_tag(
        "1.2.3",
        &candidates,
        Scope::Minor,
        false,
        AMD64
      ),
      Some("1.3.0".to_string())
    );
    assert_eq!(
      select_latest_tag(
        "1.2.3",
        &candidates,
        Scope::Major,
        false,
        AMD64
      ),
      Some("2.0.0".to_string())
    );
    assert_eq!(
      select_latest_major_tag("1.2.3", &candidates, false, AMD64),
      Some("2.0.0".to_string())
    );
  }

  #[test]
  fn prereleases_filtered_by_default() {
    let candidates = tags(&["1.2.4", "1.2.5-rc1", "1.3.0-nightly"]);
    assert_eq!(
      select_latest_tag(
        "1.2.3",
        &candidates,
        Scope::Patch,
        false,
        AMD64
      ),
      Some("1.2.4".to_string())
    );
  }

  #[test]
  fn suffix_pinning() {
    let candidates = tags(&["3.13-alpine", "3.13-slim", "3.13"]);
    assert_eq!(
      select_latest_tag(
        "3.12-alpine",
        &candidates,
        Scope::Minor,
        false,
        AMD64
      ),
      Some("3.13-alpine".to_string())
    );
    // bare current tag never moves onto a suffixed one
    assert_eq!(
      select_latest_tag(
        "3.12",
        &tags(&["3.13-alpine", "3.13-slim"]),
        Scope::Minor,
        false,
        AMD64
      ),
      None
    );
  }

  #[test]
  fn arch_pinning() {
    let candidates = tags(&["1.1-amd64", "1.1-arm64", "1.1"]);
    assert_eq!(
      select_latest_tag(
        "1.0-amd64",
        &candidates,
        Scope::Minor,
        false,
        AMD64
      ),
      Some("1.1-amd64".to_string())
    );
    // candidate-only arch suffix must equal the host arch
    assert!(!acceptable_update(
      "1.0",
      "1.1-arm64",
      Scope::Minor,
      AMD64
    ));
    assert!(acceptable_update(
      "1.0",
      "1.1-arm64",
      Scope::Minor,
      "arm64"
    ));
  }

  #[test]
  fn windows_tags_never_chosen() {
    for tag in [
      "ltsc2019",
      "1.1-windowsservercore",
      "1.1-nanoserver",
      "6.0-windows",
    ] {
      assert!(!acceptable_update(
        "1.0",
        tag,
        Scope::Major,
        AMD64
      ));
    }
  }

  #[test]
  fn selection_is_order_independent() {
    let mut candidates =
      tags(&["1.2.6", "1.2.4", "1.2.9", "1.2.5", "1.2.8"]);
    let forward = select_latest_tag(
      "1.2.3",
      &candidates,
      Scope::Patch,
      false,
      AMD64,
    );
    candidates.reverse();
    let reverse = select_latest_tag(
      "1.2.3",
      &candidates,
      Scope::Patch,
      false,
      AMD64,
    );
    assert_eq!(forward, reverse);
    assert_eq!(forward, Some("1.2.9".to_string()));
  }

  #[test]
  fn change_type_classification() {
    assert_eq!(change_type("1.2.3", "1.2.4"), ChangeType::Patch);
    assert_eq!(change_type("1.2.3", "1.3.0"), ChangeType::Minor);
    assert_eq!(change_type("1.2.3", "2.0.0"), ChangeType::Major);
    assert_eq!(
      change_type("latest", "1.0.0"),
      ChangeType::Unknown
    );
  }

  #[test]
  fn page_exhaustion_stops_early() {
    assert!(page_exhausted(
      "1.25.0",
      &tags(&["1.24.0", "1.23.2", "1.25.0"])
    ));
    assert!(!page_exhausted(
      "1.25.0",
      &tags(&["1.24.0", "1.25.3"])
    ));
    // a page of unparseable tags can't prove exhaustion
    assert!(!page_exhausted(
      "1.25.0",
      &tags(&["bookworm", "stable"])
    ));
  }

  #[test]
  fn arch_suffix_canonicalization() {
    assert_eq!(tag_arch_suffix("1.0-x86_64"), Some("amd64"));
    assert_eq!(tag_arch_suffix("1.0-aarch64"), Some("arm64"));
    assert_eq!(tag_arch_suffix("1.0-armv7l"), Some("arm"));
    assert_eq!(tag_arch_suffix("1.0-arm64v8"), Some("arm64"));
    assert_eq!(tag_arch_suffix("1.0"), None);
  }
}
