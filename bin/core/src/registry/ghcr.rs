use std::sync::Arc;

use anyhow::anyhow;
use cache::TtlCache;
use serde::Deserialize;
use tidewatch_client::entities::container::Registry;

use super::{
  MANIFEST_ACCEPT, RegistryError, Result, TagMetadata, cache_key,
  get_with_retry, next_link,
};

/// Both GHCR and LSCR authenticate against this token service.
const TOKEN_URL: &str = "https://ghcr.io/token";
const PAGE_SIZE: usize = 1000;

#[derive(Deserialize)]
struct TokenResponse {
  #[serde(default)]
  token: Option<String>,
}

#[derive(Deserialize)]
struct TagList {
  #[serde(default)]
  tags: Vec<String>,
}

/// V2 registry speaking the GHCR OAuth2 token dance: Basic auth
/// (if configured) goes ONLY to the token request; every
/// following call carries the Bearer alone. The two schemes are
/// never sent together.
pub struct TokenRegistryClient {
  http: reqwest::Client,
  tag_cache: Arc<TtlCache<String, Vec<String>>>,
  registry: Registry,
  base_url: &'static str,
  username: String,
  token: String,
}

impl TokenRegistryClient {
  pub fn new(
    http: reqwest::Client,
    tag_cache: Arc<TtlCache<String, Vec<String>>>,
    registry: Registry,
    base_url: &'static str,
    username: String,
    token: String,
  ) -> TokenRegistryClient {
    TokenRegistryClient {
      http,
      tag_cache,
      registry,
      base_url,
      username,
      token,
    }
  }

  async fn bearer_token(&self, image: &str) -> Result<String> {
    let mut request = self.http.get(TOKEN_URL).query(&[
      ("scope", format!("repository:{image}:pull")),
      ("service", "ghcr.io".to_string()),
    ]);
    if !self.username.is_empty() && !self.token.is_empty() {
      request =
        request.basic_auth(&self.username, Some(&self.token));
    }
    let response: TokenResponse = get_with_retry(request)
      .await?
      .json()
      .await
      .map_err(|e| RegistryError::Transient {
        error: anyhow!(e).context("invalid token response"),
      })?;
    response.token.ok_or(RegistryError::Transient {
      error: anyhow!("token service returned no token"),
    })
  }

  pub async fn list_tags(
    &self,
    image: &str,
  ) -> Result<Vec<String>> {
    let key = cache_key(self.registry, image);
    if let Some(tags) = self.tag_cache.get(&key).await {
      return Ok(tags);
    }

    let token = self.bearer_token(image).await?;
    let mut tags = Vec::new();
    let mut url = format!(
      "{}/v2/{image}/tags/list?n={PAGE_SIZE}",
      self.base_url
    );
    loop {
      let response = get_with_retry(
        self.http.get(&url).bearer_auth(&token),
      )
      .await?;
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
    let token = self.bearer_token(image).await?;
    let url =
      format!("{}/v2/{image}/manifests/{tag}", self.base_url);
    let response = get_with_retry(
      self
        .http
        .get(&url)
        .bearer_auth(&token)
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
