use std::sync::Arc;

use anyhow::anyhow;
use cache::TtlCache;
use serde::Deserialize;
use tidewatch_client::entities::container::{
  Registry, UpdateScope,
};

use super::{
  RegistryError, Result, TagMetadata, cache_key, get_with_retry,
};
use crate::version;

const BASE_URL: &str = "https://hub.docker.com/v2";
const PAGE_SIZE: usize = 100;
/// At most 5 pages (500 tags) per optimized lookup.
const MAX_PAGES: usize = 5;

#[derive(Deserialize)]
struct TagPage {
  #[serde(default)]
  results: Vec<TagResult>,
  #[serde(default)]
  next: Option<String>,
}

#[derive(Deserialize)]
struct TagResult {
  name: String,
}

#[derive(Deserialize)]
struct TagDetail {
  #[serde(default)]
  digest: Option<String>,
  #[serde(default)]
  last_updated: Option<String>,
  #[serde(default)]
  full_size: Option<i64>,
}

pub struct DockerHubClient {
  http: reqwest::Client,
  tag_cache: Arc<TtlCache<String, Vec<String>>>,
  username: String,
  token: String,
}

impl DockerHubClient {
  pub fn new(
    http: reqwest::Client,
    tag_cache: Arc<TtlCache<String, Vec<String>>>,
    username: String,
    token: String,
  ) -> DockerHubClient {
    DockerHubClient {
      http,
      tag_cache,
      username,
      token,
    }
  }

  /// Official images live under the `library` namespace.
  fn qualify(image: &str) -> String {
    if image.contains('/') {
      image.to_string()
    } else {
      format!("library/{image}")
    }
  }

  fn get(&self, url: &str) -> reqwest::RequestBuilder {
    let request = self.http.get(url);
    if !self.username.is_empty() && !self.token.is_empty() {
      request.basic_auth(&self.username, Some(&self.token))
    } else {
      request
    }
  }

  pub async fn list_tags(
    &self,
    image: &str,
  ) -> Result<Vec<String>> {
    let image = Self::qualify(image);
    let key = cache_key(Registry::Dockerhub, &image);
    if let Some(tags) = self.tag_cache.get(&key).await {
      return Ok(tags);
    }

    let mut tags = Vec::new();
    let mut url = format!(
      "{BASE_URL}/repositories/{image}/tags?page_size={PAGE_SIZE}"
    );
    loop {
      let page: TagPage = get_with_retry(self.get(&url))
        .await?
        .json()
        .await
        .map_err(|e| RegistryError::Transient {
          error: anyhow!(e)
            .context("invalid docker hub tag page"),
        })?;
      tags.extend(page.results.into_iter().map(|tag| tag.name));
      match page.next {
        Some(next) => url = next,
        None => break,
      }
    }

    self.tag_cache.insert(key, tags.clone()).await;
    Ok(tags)
  }

  /// Optimized candidate lookup: pages are fetched lazily and
  /// the walk stops once a page holds only versions at or below
  /// the current tag. A cached full enumeration short-circuits
  /// the network entirely.
  pub async fn latest_tag(
    &self,
    image: &str,
    current_tag: &str,
    scope: UpdateScope,
    include_prereleases: bool,
  ) -> Result<Option<String>> {
    let image = Self::qualify(image);
    let key = cache_key(Registry::Dockerhub, &image);
    let host = version::host_arch();

    if let Some(tags) = self.tag_cache.get(&key).await {
      return Ok(version::select_latest_tag(
        current_tag,
        &tags,
        scope,
        include_prereleases,
        host,
      ));
    }

    let mut seen = Vec::new();
    let mut url = format!(
      "{BASE_URL}/repositories/{image}/tags?page_size={PAGE_SIZE}"
    );
    for _ in 0..MAX_PAGES {
      let page: TagPage = get_with_retry(self.get(&url))
        .await?
        .json()
        .await
        .map_err(|e| RegistryError::Transient {
          error: anyhow!(e)
            .context("invalid docker hub tag page"),
        })?;
      let page_tags = page
        .results
        .into_iter()
        .map(|tag| tag.name)
        .collect::<Vec<_>>();
      let exhausted =
        version::page_exhausted(current_tag, &page_tags);
      seen.extend(page_tags);

      let best = version::select_latest_tag(
        current_tag,
        &seen,
        scope,
        include_prereleases,
        host,
      );
      if best.is_some() && exhausted {
        // Anything further down is older than what we have.
        return Ok(best);
      }
      match page.next {
        Some(next) => url = next,
        None => break,
      }
    }

    Ok(version::select_latest_tag(
      current_tag,
      &seen,
      scope,
      include_prereleases,
      host,
    ))
  }

  pub async fn tag_metadata(
    &self,
    image: &str,
    tag: &str,
  ) -> Result<TagMetadata> {
    let image = Self::qualify(image);
    let url =
      format!("{BASE_URL}/repositories/{image}/tags/{tag}");
    let detail: TagDetail = get_with_retry(self.get(&url))
      .await?
      .json()
      .await
      .map_err(|e| RegistryError::Transient {
        error: anyhow!(e)
          .context("invalid docker hub tag metadata"),
      })?;
    Ok(TagMetadata {
      digest: detail.digest,
      last_updated: detail.last_updated,
      size: detail.full_size,
    })
  }
}
