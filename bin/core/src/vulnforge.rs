use std::time::Duration;

use anyhow::{Context, anyhow};
use mungos::mongodb::bson::doc;
use serde::Deserialize;
use tidewatch_client::entities::{
  container::Container,
  tidewatch_timestamp,
  update::{ReasonType, Update, UpdateStatus},
};

use crate::{helpers::oid, settings, state::AppState};

const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the external VulnForge vulnerability service.
pub struct VulnForgeClient {
  http: reqwest::Client,
  base_url: String,
  api_key: String,
}

/// What VulnForge knows about moving a container between tags.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VulnComparison {
  #[serde(default)]
  pub current: i64,
  #[serde(default)]
  pub new: i64,
  #[serde(default)]
  pub delta: i64,
  #[serde(default)]
  pub cves_fixed: Vec<String>,
  #[serde(default)]
  pub summary: Option<String>,
  #[serde(default)]
  pub recommendation: Option<String>,
  #[serde(default)]
  pub is_safe: bool,
  /// False when VulnForge has no data for the candidate tag yet.
  #[serde(default = "default_true")]
  pub has_candidate_data: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggeredScan {
  pub job_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanPoll {
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub scan_id: Option<String>,
  #[serde(default)]
  pub cves_fixed: Vec<String>,
  #[serde(default)]
  pub new_vulns: i64,
  #[serde(default)]
  pub vuln_delta: i64,
}

impl ScanPoll {
  pub fn is_completed(&self) -> bool {
    self.status == "completed"
  }

  pub fn is_failed(&self) -> bool {
    self.status == "failed"
  }
}

impl VulnForgeClient {
  /// None when no VulnForge url is configured.
  pub async fn from_state(
    state: &AppState,
  ) -> anyhow::Result<Option<VulnForgeClient>> {
    let base_url = settings::vulnforge_url(state).await?;
    if base_url.is_empty() {
      return Ok(None);
    }
    let api_key = settings::vulnforge_api_key(state).await?;
    let http = reqwest::Client::builder()
      .timeout(QUERY_TIMEOUT)
      .build()
      .context("failed to build vulnforge http client")?;
    Ok(Some(VulnForgeClient {
      http,
      base_url: base_url.trim_end_matches('/').to_string(),
      api_key,
    }))
  }

  fn request(
    &self,
    method: reqwest::Method,
    path: &str,
  ) -> reqwest::RequestBuilder {
    let request = self
      .http
      .request(method, format!("{}{path}", self.base_url));
    if self.api_key.is_empty() {
      request
    } else {
      request.bearer_auth(&self.api_key)
    }
  }

  /// Compares the vulnerability surface of the running tag
  /// against a candidate.
  pub async fn compare(
    &self,
    image: &str,
    current_tag: &str,
    candidate_tag: &str,
    registry: &str,
  ) -> anyhow::Result<Option<VulnComparison>> {
    let response = self
      .request(reqwest::Method::GET, "/api/v1/compare")
      .query(&[
        ("image", image),
        ("from_tag", current_tag),
        ("to_tag", candidate_tag),
        ("registry", registry),
      ])
      .send()
      .await
      .context("vulnforge compare request failed")?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge compare returned http {}",
        response.status()
      ));
    }
    let comparison = response
      .json()
      .await
      .context("invalid vulnforge compare response")?;
    Ok(Some(comparison))
  }

  /// Records the current tag as baseline so future comparisons
  /// have something to diff against.
  pub async fn refresh_baseline(
    &self,
    image: &str,
    tag: &str,
    registry: &str,
  ) -> anyhow::Result<()> {
    let response = self
      .request(reqwest::Method::POST, "/api/v1/baseline")
      .json(&serde_json::json!({
        "image": image,
        "tag": tag,
        "registry": registry,
      }))
      .send()
      .await
      .context("vulnforge baseline request failed")?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge baseline returned http {}",
        response.status()
      ));
    }
    Ok(())
  }

  /// Requests a fresh scan of a container. None when VulnForge
  /// does not know the container yet (trigger miss).
  pub async fn trigger_scan(
    &self,
    container_name: &str,
  ) -> anyhow::Result<Option<TriggeredScan>> {
    let response = self
      .request(reqwest::Method::POST, "/api/v1/scans")
      .json(&serde_json::json!({
        "container_name": container_name,
      }))
      .send()
      .await
      .context("vulnforge trigger request failed")?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge trigger returned http {}",
        response.status()
      ));
    }
    let triggered = response
      .json()
      .await
      .context("invalid vulnforge trigger response")?;
    Ok(Some(triggered))
  }

  /// Asks VulnForge to re-discover the container fleet, used
  /// when trigger misses persist after an update replaced a
  /// container.
  pub async fn discover(&self) -> anyhow::Result<()> {
    let response = self
      .request(reqwest::Method::POST, "/api/v1/discover")
      .send()
      .await
      .context("vulnforge discover request failed")?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge discover returned http {}",
        response.status()
      ));
    }
    Ok(())
  }

  pub async fn poll_scan(
    &self,
    job_id: &str,
  ) -> anyhow::Result<ScanPoll> {
    let response = self
      .request(
        reqwest::Method::GET,
        &format!("/api/v1/scans/{job_id}"),
      )
      .send()
      .await
      .context("vulnforge poll request failed")?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge poll returned http {}",
        response.status()
      ));
    }
    response
      .json()
      .await
      .context("invalid vulnforge poll response")
  }

  /// Connection probe for the settings test endpoint.
  pub async fn test_connection(&self) -> anyhow::Result<()> {
    let response = self
      .request(reqwest::Method::GET, "/api/v1/health")
      .send()
      .await
      .context("vulnforge unreachable")?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "vulnforge health returned http {}",
        response.status()
      ));
    }
    Ok(())
  }
}

/// Writes CVE data onto a freshly created Update. Under the
/// `security` policy an update VulnForge calls unsafe is
/// auto-rejected. When VulnForge has no data for the candidate
/// yet, only the baseline is stored and the Update stays.
pub async fn enrich_update(
  state: &AppState,
  container: &Container,
  update: &mut Update,
) -> anyhow::Result<()> {
  let Some(client) = VulnForgeClient::from_state(state).await?
  else {
    return Ok(());
  };

  let registry = container.registry.to_string();
  let Some(comparison) = client
    .compare(
      &container.image,
      &update.from_tag,
      &update.to_tag,
      &registry,
    )
    .await?
  else {
    return Ok(());
  };

  if !comparison.has_candidate_data {
    client
      .refresh_baseline(
        &container.image,
        &update.from_tag,
        &registry,
      )
      .await
      .ok();
    return Ok(());
  }

  update.current_vulns = comparison.current;
  update.new_vulns = comparison.new;
  update.vuln_delta = comparison.delta;
  update.cves_fixed = comparison.cves_fixed.clone();
  if !comparison.cves_fixed.is_empty() {
    update.reason_type = ReasonType::Security;
  }
  if let Some(summary) = &comparison.summary {
    update.reason_summary = summary.clone();
  }
  update.recommendation = comparison.recommendation.clone();

  use tidewatch_client::entities::container::UpdatePolicy;
  if container.policy == UpdatePolicy::Security
    && !comparison.is_safe
  {
    update.status = UpdateStatus::Rejected;
    update.rejection_reason = Some(format!(
      "auto-rejected: VulnForge reports {} introduces {} new \
       vulnerabilities",
      update.to_tag,
      comparison.new.saturating_sub(comparison.current).max(0)
    ));
  }

  let mut set = doc! {
    "current_vulns": update.current_vulns,
    "new_vulns": update.new_vulns,
    "vuln_delta": update.vuln_delta,
    "cves_fixed": &update.cves_fixed,
    "reason_type": update.reason_type.as_ref(),
    "reason_summary": &update.reason_summary,
    "updated_at": tidewatch_timestamp(),
  };
  if let Some(recommendation) = &update.recommendation {
    set.insert("recommendation", recommendation);
  }
  if update.status == UpdateStatus::Rejected {
    set.insert("status", "rejected");
    set.insert(
      "rejection_reason",
      update.rejection_reason.as_deref().unwrap_or_default(),
    );
  }
  state
    .db
    .updates
    .update_one(
      doc! { "_id": oid(&update.id)? },
      doc! { "$set": set },
    )
    .await
    .context("failed to persist vulnforge enrichment")?;

  Ok(())
}

/// Baseline refresh on the no-update path, so VulnForge keeps
/// data for the running tag.
pub async fn refresh_baseline(
  state: &AppState,
  container: &Container,
) {
  let client = match VulnForgeClient::from_state(state).await {
    Ok(Some(client)) => client,
    Ok(None) => return,
    Err(e) => {
      warn!("vulnforge client unavailable | {e:#}");
      return;
    }
  };
  if let Err(e) = client
    .refresh_baseline(
      &container.image,
      &container.current_tag,
      &container.registry.to_string(),
    )
    .await
  {
    debug!(
      "baseline refresh failed for {} | {e:#}",
      container.name
    );
  }
}
