use std::sync::LazyLock;

use anyhow::Context;
use serde::Deserialize;
use tidewatch_client::entities::update::ReasonType;

const GITHUB_API: &str = "https://api.github.com";

/// Docker Hub images whose upstream GitHub repo is not derivable
/// from the image string.
const RELEASE_SOURCE_ALIASES: &[(&str, &str)] = &[
  // Official images
  ("postgres", "postgres/postgres"),
  ("redis", "redis/redis"),
  ("nginx", "nginx/nginx"),
  ("mariadb", "MariaDB/server"),
  ("mysql", "mysql/mysql-server"),
  ("mongo", "mongodb/mongo"),
  ("elasticsearch", "elastic/elasticsearch"),
  // Reverse proxies
  ("traefik", "traefik/traefik"),
  ("traefik/traefik", "traefik/traefik"),
  ("caddy", "caddyserver/caddy"),
  // Grafana stack
  ("grafana/grafana", "grafana/grafana"),
  ("grafana/loki", "grafana/loki"),
  ("grafana/promtail", "grafana/promtail"),
  ("grafana/alloy", "grafana/alloy"),
  ("grafana/tempo", "grafana/tempo"),
  ("grafana/mimir", "grafana/mimir"),
  // Prometheus stack
  ("prom/prometheus", "prometheus/prometheus"),
  ("prom/node-exporter", "prometheus/node_exporter"),
  ("prom/alertmanager", "prometheus/alertmanager"),
  ("prom/pushgateway", "prometheus/pushgateway"),
  // VictoriaMetrics
  (
    "victoriametrics/victoria-metrics",
    "VictoriaMetrics/VictoriaMetrics",
  ),
  ("victoriametrics/vmagent", "VictoriaMetrics/VictoriaMetrics"),
  ("victoriametrics/vmalert", "VictoriaMetrics/VictoriaMetrics"),
  ("victoriametrics/vmauth", "VictoriaMetrics/VictoriaMetrics"),
  // Authentication
  ("goauthentik/server", "goauthentik/authentik"),
  ("goauthentik/proxy", "goauthentik/authentik"),
  ("authelia/authelia", "authelia/authelia"),
  // DNS / Ad blocking
  ("adguard/adguardhome", "AdguardTeam/AdGuardHome"),
  ("pihole/pihole", "pi-hole/docker-pi-hole"),
  // Home automation
  ("homeassistant/home-assistant", "home-assistant/core"),
  // Vector stores
  ("chromadb/chroma", "chroma-core/chroma"),
  ("qdrant/qdrant", "qdrant/qdrant"),
  ("milvusdb/milvus", "milvus-io/milvus"),
  // AI/ML
  ("ollama/ollama", "ollama/ollama"),
];

/// Best-effort GitHub `owner/repo` for an image string.
///
/// ghcr images map directly, linuxserver images follow the
/// `linuxserver/docker-{app}` convention, and a curated alias
/// table covers popular Docker Hub repos.
pub fn extract_release_source(image: &str) -> Option<String> {
  let image = image.split(':').next().unwrap_or(image);
  let image = image.strip_prefix("docker.io/").unwrap_or(image);

  if let Some(app) = image
    .strip_prefix("lscr.io/linuxserver/")
    .or_else(|| image.strip_prefix("ghcr.io/linuxserver/"))
    .or_else(|| image.strip_prefix("linuxserver/"))
  {
    return Some(format!("linuxserver/docker-{app}"));
  }

  if let Some(repo_path) = image.strip_prefix("ghcr.io/") {
    return Some(repo_path.to_string());
  }

  RELEASE_SOURCE_ALIASES
    .iter()
    .find(|(alias, _)| *alias == image)
    .map(|(_, source)| source.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct Changelog {
  pub body: String,
  pub url: Option<String>,
}

#[derive(Deserialize)]
struct GithubRelease {
  #[serde(default)]
  body: Option<String>,
  #[serde(default)]
  html_url: Option<String>,
}

pub struct ChangelogFetcher {
  http: reqwest::Client,
  github_token: String,
}

impl ChangelogFetcher {
  pub fn new(github_token: String) -> ChangelogFetcher {
    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(30))
      .user_agent(format!(
        "tidewatch/{}",
        env!("CARGO_PKG_VERSION")
      ))
      .build()
      .expect("failed to build changelog http client");
    ChangelogFetcher { http, github_token }
  }

  /// Fetches the release body for `(owner/repo, tag)`. Tries the
  /// tag as-is, then with a `v` prefix toggled, since upstream
  /// release tags and image tags frequently disagree on it.
  pub async fn fetch(
    &self,
    release_source: &str,
    tag: &str,
  ) -> anyhow::Result<Option<Changelog>> {
    let mut candidates = vec![tag.to_string()];
    match tag.strip_prefix('v') {
      Some(stripped) => candidates.push(stripped.to_string()),
      None => candidates.push(format!("v{tag}")),
    }

    for candidate in candidates {
      let url = format!(
        "{GITHUB_API}/repos/{release_source}/releases/tags/{candidate}"
      );
      let mut request = self.http.get(&url);
      if !self.github_token.is_empty() {
        request = request.bearer_auth(&self.github_token);
      }
      let response = request
        .send()
        .await
        .context("github release request failed")?;
      if response.status() == reqwest::StatusCode::NOT_FOUND {
        continue;
      }
      if !response.status().is_success() {
        return Err(anyhow::anyhow!(
          "github returned http {} for {release_source}",
          response.status()
        ));
      }
      let release: GithubRelease = response
        .json()
        .await
        .context("invalid github release body")?;
      return Ok(Some(Changelog {
        body: release.body.unwrap_or_default(),
        url: release.html_url,
      }));
    }

    Ok(None)
  }
}

static CVE_ID: LazyLock<regex::Regex> = LazyLock::new(|| {
  regex::Regex::new(r"(?i)\bCVE-\d{4}-\d{4,}\b").unwrap()
});

const SECURITY_SIGNALS: &[&str] = &[
  "security fix",
  "security update",
  "security patch",
  "vulnerability",
  "vulnerabilities",
  "exploit",
  "advisory",
];

const BUGFIX_SIGNALS: &[&str] = &[
  "bug fix",
  "bugfix",
  "fixed",
  "fixes",
  "hotfix",
  "regression",
  "crash",
];

const FEATURE_SIGNALS: &[&str] = &[
  "new feature",
  "feature",
  "added",
  "adds",
  "introduce",
  "support for",
];

const MAINTENANCE_SIGNALS: &[&str] = &[
  "dependency",
  "dependencies",
  "bump",
  "chore",
  "refactor",
  "cleanup",
  "maintenance",
  "upgrade",
];

/// Heuristic classification of free-text release notes. Security
/// signals dominate everything else.
pub fn classify(notes: &str) -> (ReasonType, String) {
  let lower = notes.to_lowercase();
  let summary = summarize(notes);

  let reason = if CVE_ID.is_match(notes)
    || SECURITY_SIGNALS.iter().any(|s| lower.contains(s))
  {
    ReasonType::Security
  } else if BUGFIX_SIGNALS.iter().any(|s| lower.contains(s)) {
    ReasonType::Bugfix
  } else if FEATURE_SIGNALS.iter().any(|s| lower.contains(s)) {
    ReasonType::Feature
  } else if MAINTENANCE_SIGNALS.iter().any(|s| lower.contains(s))
  {
    ReasonType::Maintenance
  } else {
    ReasonType::Unknown
  };

  (reason, summary)
}

/// CVE identifiers found in release notes, deduplicated.
pub fn extract_cves(notes: &str) -> Vec<String> {
  let mut cves = CVE_ID
    .find_iter(notes)
    .map(|m| m.as_str().to_uppercase())
    .collect::<Vec<_>>();
  cves.sort();
  cves.dedup();
  cves
}

/// First meaningful line, markdown markers stripped, capped.
fn summarize(notes: &str) -> String {
  let line = notes
    .lines()
    .map(|line| {
      line
        .trim_start_matches(['#', '*', '-', '>', ' '])
        .trim()
    })
    .find(|line| !line.is_empty())
    .unwrap_or("");
  let mut summary = line.to_string();
  if summary.len() > 200 {
    summary.truncate(197);
    summary.push_str("...");
  }
  summary
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn release_source_rules() {
    assert_eq!(
      extract_release_source("ghcr.io/owner/repo:1.0"),
      Some("owner/repo".to_string())
    );
    assert_eq!(
      extract_release_source("lscr.io/linuxserver/plex"),
      Some("linuxserver/docker-plex".to_string())
    );
    assert_eq!(
      extract_release_source("linuxserver/sonarr:4.0"),
      Some("linuxserver/docker-sonarr".to_string())
    );
    assert_eq!(
      extract_release_source("postgres:16"),
      Some("postgres/postgres".to_string())
    );
    assert_eq!(
      extract_release_source("prom/node-exporter"),
      Some("prometheus/node_exporter".to_string())
    );
    assert_eq!(extract_release_source("someimage"), None);
  }

  #[test]
  fn security_signals_dominate() {
    let (reason, _) = classify(
      "This release fixes CVE-2024-12345 and adds a new dashboard.",
    );
    assert_eq!(reason, ReasonType::Security);

    let (reason, _) =
      classify("Security fix for the auth middleware");
    assert_eq!(reason, ReasonType::Security);
  }

  #[test]
  fn classification_tiers() {
    assert_eq!(
      classify("Fixed a crash when parsing empty configs").0,
      ReasonType::Bugfix
    );
    assert_eq!(
      classify("Added support for webhooks").0,
      ReasonType::Feature
    );
    assert_eq!(
      classify("chore: bump dependencies").0,
      ReasonType::Maintenance
    );
    assert_eq!(classify("v1.2.3").0, ReasonType::Unknown);
  }

  #[test]
  fn cve_extraction_dedupes() {
    let cves = extract_cves(
      "Fixes CVE-2024-1111, cve-2024-1111 and CVE-2023-99999.",
    );
    assert_eq!(
      cves,
      vec![
        "CVE-2023-99999".to_string(),
        "CVE-2024-1111".to_string()
      ]
    );
  }

  #[test]
  fn summary_takes_first_meaningful_line() {
    let (_, summary) =
      classify("\n\n## Highlights\nActual change description");
    assert_eq!(summary, "Highlights");
  }
}
