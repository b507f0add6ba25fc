use std::sync::Arc;

use anyhow::anyhow;
use cache::TtlCache;
use serde::Deserialize;
use tidewatch_client::entities::container::Registry;

use super::{
  MANIFEST_ACCEPT, RegistryError, Result, TagMetadata, cache_key,
  get_with_retry, next_link,
};

const PAGE_SIZE: usize = 1000;

#[derive(Deserialize)]
struct TagList {
  #[serde(default)]
  tags: Vec<String>,
}

/// Plain anonymous V2 registry (GCR, Quay): no token dance,
/// Link-header pagination.
pub struct AnonymousRegistryClient {
  http: reqwest::Client,
  tag_cache: Arc<TtlCache<String, Vec<String>>>,
  registry: Registry,
  base_url: &'static str,
}

impl AnonymousRegistryClient {
  pub fn new(
    http: reqwest::Client,
    tag_cache: Arc<TtlCache<String, Vec<String>>>,
    registry: Registry,
    base_url: &'static str,
  ) -> AnonymousRegistryClient {
    AnonymousRegistryClient {
      http,
      tag_cache,
      registry,
      base_url,
    }
  }

  pub async fn list_tags(
    &self,
    image: &str,
  ) -> Result<Vec<String>> {
    let key = cache_key(self.registry, image);
    if let Some(tags) = self.tag_cache.get(&key).await {
      return Ok(tags);
    }

    let mut tags = Vec::new();
    let mut url = format!(
      "{}/v2/{image}/tags/list?n={PAGE_SIZE}",
      self.base_url
    );
    loop {
      let response = get_with_retry(self.http.get(&url)).await?;
      let next = next_link(response.headers(), self.base_url);
      let list: TagList = response.json().await.map_err(|e| {
        RegistryError::Transient {
          error: anyhow!(e).context("invalid tag list"),
        }
      })?;
      tags.extend(list.tags);
      match next {
        Some(next) => url = next,
        None => break,
      }
    }

    self.tag_cache.insert(key, tags.clone()).await;
    Ok(tags)
  }

  pub async fn tag_metadata(
    &self,
    image: &str,
    tag: &str,
  ) -> Result<TagMetadata> {
    let url =
      format!("{}/v2/{image}/manifests/{tag}", self.base_url);
    let response = get_with_retry(
      self
        .http
        .get(&url)
        .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT),
    )
    .await?;
    let digest = response
      .headers()
      .get("Docker-Content-Digest")
      .and_then(|value| value.to_str().ok())
      .map(str::to_string);
    Ok(TagMetadata {
      digest,
      last_updated: None,
      size: None,
    })
  }
}
