use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use cache::TtlCache;
use tidewatch_client::entities::container::{
  Container, Registry, UpdateScope,
};

use crate::version;

mod dockerhub;
mod ghcr;
mod oci;

pub const TAG_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(10);

/// Media type required for the manifest request, so the registry
/// answers with a `Docker-Content-Digest` header.
const MANIFEST_ACCEPT: &str =
  "application/vnd.docker.distribution.manifest.v2+json";

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  /// Network / 5xx failure that survived the retry budget.
  /// Callers report it and move on; it never crashes a check run.
  #[error("registry request failed | {error:#}")]
  Transient { error: anyhow::Error },
  /// 404 on the image or tag. Callers treat this as "no update".
  #[error("image or tag not found on registry")]
  NotFound,
  /// 401 / 403. Surfaced in the decision trace and update error
  /// log so the operator can fix credentials.
  #[error("registry authentication failed (http {status})")]
  Auth { status: u16 },
}

impl RegistryError {
  fn from_status(status: reqwest::StatusCode) -> RegistryError {
    match status.as_u16() {
      404 => RegistryError::NotFound,
      401 | 403 => RegistryError::Auth {
        status: status.as_u16(),
      },
      code => RegistryError::Transient {
        error: anyhow!("unexpected registry response: http {code}"),
      },
    }
  }
}

/// What the checker hands to the decision maker after talking to
/// the registry.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
  /// Best in-scope candidate.
  pub latest_tag: Option<String>,
  /// Best candidate ignoring scope.
  pub latest_major_tag: Option<String>,
  /// Manifest digest, fetched only in `latest` mode.
  pub digest: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagMetadata {
  pub digest: Option<String>,
  pub last_updated: Option<String>,
  pub size: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryCredentials {
  pub dockerhub_username: String,
  pub dockerhub_token: String,
  pub ghcr_username: String,
  pub ghcr_token: String,
}

/// One client per supported registry, sharing a process-wide tag
/// cache keyed `registry:image` with a 15 minute TTL.
pub struct RegistryClientSet {
  dockerhub: dockerhub::DockerHubClient,
  ghcr: ghcr::TokenRegistryClient,
  lscr: ghcr::TokenRegistryClient,
  gcr: oci::AnonymousRegistryClient,
  quay: oci::AnonymousRegistryClient,
  tag_cache: Arc<TtlCache<String, Vec<String>>>,
}

impl RegistryClientSet {
  pub fn new(creds: RegistryCredentials) -> RegistryClientSet {
    let http = reqwest::Client::builder()
      .timeout(REGISTRY_TIMEOUT)
      .build()
      .expect("failed to build registry http client");
    let tag_cache = Arc::new(TtlCache::new(TAG_CACHE_TTL));
    RegistryClientSet {
      dockerhub: dockerhub::DockerHubClient::new(
        http.clone(),
        tag_cache.clone(),
        creds.dockerhub_username.clone(),
        creds.dockerhub_token.clone(),
      ),
      ghcr: ghcr::TokenRegistryClient::new(
        http.clone(),
        tag_cache.clone(),
        Registry::Ghcr,
        "https://ghcr.io",
        creds.ghcr_username.clone(),
        creds.ghcr_token.clone(),
      ),
      // Same wire protocol as GHCR; the token service stays
      // ghcr.io.
      lscr: ghcr::TokenRegistryClient::new(
        http.clone(),
        tag_cache.clone(),
        Registry::Lscr,
        "https://lscr.io",
        creds.ghcr_username,
        creds.ghcr_token,
      ),
      gcr: oci::AnonymousRegistryClient::new(
        http.clone(),
        tag_cache.clone(),
        Registry::Gcr,
        "https://gcr.io",
      ),
      quay: oci::AnonymousRegistryClient::new(
        http,
        tag_cache.clone(),
        Registry::Quay,
        "https://quay.io",
      ),
      tag_cache,
    }
  }

  /// Full tag enumeration, through the cache.
  pub async fn list_tags(
    &self,
    registry: Registry,
    image: &str,
  ) -> Result<Vec<String>> {
    match registry {
      Registry::Dockerhub => self.dockerhub.list_tags(image).await,
      Registry::Ghcr => self.ghcr.list_tags(image).await,
      Registry::Lscr => self.lscr.list_tags(image).await,
      Registry::Gcr => self.gcr.list_tags(image).await,
      Registry::Quay => self.quay.list_tags(image).await,
    }
  }

  /// Digest (and friends) for one tag, for `latest` tracking.
  pub async fn tag_metadata(
    &self,
    registry: Registry,
    image: &str,
    tag: &str,
  ) -> Result<TagMetadata> {
    match registry {
      Registry::Dockerhub => {
        self.dockerhub.tag_metadata(image, tag).await
      }
      Registry::Ghcr => self.ghcr.tag_metadata(image, tag).await,
      Registry::Lscr => self.lscr.tag_metadata(image, tag).await,
      Registry::Gcr => self.gcr.tag_metadata(image, tag).await,
      Registry::Quay => self.quay.tag_metadata(image, tag).await,
    }
  }

  /// Best in-scope candidate, or None.
  pub async fn latest_tag(
    &self,
    registry: Registry,
    image: &str,
    current_tag: &str,
    scope: UpdateScope,
    include_prereleases: bool,
  ) -> Result<Option<String>> {
    if registry == Registry::Dockerhub {
      // Docker Hub pages are fetched lazily with early exit.
      return self
        .dockerhub
        .latest_tag(image, current_tag, scope, include_prereleases)
        .await;
    }
    let tags = self.list_tags(registry, image).await?;
    Ok(version::select_latest_tag(
      current_tag,
      &tags,
      scope,
      include_prereleases,
      version::host_arch(),
    ))
  }

  /// Best candidate ignoring scope. Informational: surfaces
  /// majors the scope gate blocked.
  pub async fn latest_major_tag(
    &self,
    registry: Registry,
    image: &str,
    current_tag: &str,
    include_prereleases: bool,
  ) -> Result<Option<String>> {
    let tags = self.list_tags(registry, image).await?;
    Ok(version::select_latest_major_tag(
      current_tag,
      &tags,
      include_prereleases,
      version::host_arch(),
    ))
  }

  /// The combined fetch the update checker runs per container:
  /// digest in `latest` mode, otherwise in-scope candidate plus
  /// the informational major lookup.
  pub async fn fetch(
    &self,
    container: &Container,
    include_prereleases: bool,
  ) -> Result<FetchResponse> {
    if container.current_tag == "latest" {
      let metadata = self
        .tag_metadata(
          container.registry,
          &container.image,
          "latest",
        )
        .await?;
      return Ok(FetchResponse {
        digest: metadata.digest,
        ..Default::default()
      });
    }

    let latest_tag = self
      .latest_tag(
        container.registry,
        &container.image,
        &container.current_tag,
        container.scope,
        include_prereleases,
      )
      .await?;
    let latest_major_tag = self
      .latest_major_tag(
        container.registry,
        &container.image,
        &container.current_tag,
        include_prereleases,
      )
      .await?;

    Ok(FetchResponse {
      latest_tag,
      latest_major_tag,
      digest: None,
    })
  }

  /// Drops expired tag cache entries.
  pub async fn sweep_cache(&self) -> usize {
    self.tag_cache.sweep().await
  }
}

pub(crate) fn cache_key(registry: Registry, image: &str) -> String {
  format!("{registry}:{image}")
}

/// GET with the shared retry policy: up to 3 attempts on
/// transient failures, exponential backoff from 1s capped at 10s.
/// 4xx auth / not-found failures are never retried.
pub(crate) async fn get_with_retry(
  request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
  let mut delay = RETRY_BASE;
  let mut last_error = None;

  for attempt in 0..RETRY_ATTEMPTS {
    let Some(request) = request.try_clone() else {
      break;
    };
    match request.send().await {
      Ok(response) => {
        let status = response.status();
        if status.is_success() {
          return Ok(response);
        }
        if status.is_server_error() {
          last_error = Some(RegistryError::Transient {
            error: anyhow!("registry returned http {status}"),
          });
        } else {
          return Err(RegistryError::from_status(status));
        }
      }
      Err(e) => {
        last_error = Some(RegistryError::Transient {
          error: anyhow!(e).context("registry request error"),
        });
      }
    }
    if attempt + 1 < RETRY_ATTEMPTS {
      tokio::time::sleep(delay).await;
      delay = (delay * 2).min(RETRY_CAP);
    }
  }

  Err(last_error.unwrap_or(RegistryError::Transient {
    error: anyhow!("registry request could not be retried"),
  }))
}

/// Follows an RFC 5988 `Link: <url>; rel="next"` header.
pub(crate) fn next_link(
  headers: &reqwest::header::HeaderMap,
  base_url: &str,
) -> Option<String> {
  let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
  if !link.contains("rel=\"next\"") {
    return None;
  }
  let url = link.split(';').next()?.trim();
  let url = url.trim_start_matches('<').trim_end_matches('>');
  if url.starts_with("http") {
    Some(url.to_string())
  } else {
    Some(format!("{base_url}{url}"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn link_header_parsing() {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
      reqwest::header::LINK,
      "</v2/owner/app/tags/list?last=abc&n=1000>; rel=\"next\""
        .parse()
        .unwrap(),
    );
    assert_eq!(
      next_link(&headers, "https://ghcr.io"),
      Some(
        "https://ghcr.io/v2/owner/app/tags/list?last=abc&n=1000"
          .to_string()
      )
    );

    let mut absolute = reqwest::header::HeaderMap::new();
    absolute.insert(
      reqwest::header::LINK,
      "<https://quay.io/v2/x/tags/list?page=2>; rel=\"next\""
        .parse()
        .unwrap(),
    );
    assert_eq!(
      next_link(&absolute, "https://quay.io"),
      Some("https://quay.io/v2/x/tags/list?page=2".to_string())
    );

    let empty = reqwest::header::HeaderMap::new();
    assert_eq!(next_link(&empty, "https://ghcr.io"), None);
  }

  #[test]
  fn status_mapping() {
    assert!(matches!(
      RegistryError::from_status(reqwest::StatusCode::NOT_FOUND),
      RegistryError::NotFound
    ));
    assert!(matches!(
      RegistryError::from_status(
        reqwest::StatusCode::UNAUTHORIZED
      ),
      RegistryError::Auth { status: 401 }
    ));
    assert!(matches!(
      RegistryError::from_status(reqwest::StatusCode::BAD_REQUEST),
      RegistryError::Transient { .. }
    ));
  }
}
