use std::time::{Duration, Instant};

use tidewatch_client::entities::container::{
  Container, HealthCheckMethod, HealthStatus,
};

use crate::state::AppState;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_BUDGET: Duration = Duration::from_secs(60);
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HealthOutcome {
  pub healthy: bool,
  /// `http`, `docker`, or `docker_inspect_fallback`.
  pub method: &'static str,
  pub message: String,
}

/// Delay before retry attempt `n` (0-based). With exponential
/// backoff the ladder runs 5, 10, 20, 30, 30... seconds;
/// without, a flat 5 seconds.
pub fn retry_delay(attempt: u32, exponential: bool) -> Duration {
  if !exponential {
    return BACKOFF_BASE;
  }
  let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt);
  delay.min(BACKOFF_CAP)
}

/// Verifies the container came up healthy after a deploy.
///
/// With a health URL and method auto/http: HTTP GET with retries
/// under a 60 s budget; any persistent failure falls back to
/// `docker inspect`, where `running` counts as success (noted as
/// the fallback). Without a URL, or with method docker, inspect
/// is the only check.
pub async fn check_health(
  state: &AppState,
  container: &Container,
  exponential_backoff: bool,
) -> HealthOutcome {
  let use_http = container.health_check_url.is_some()
    && matches!(
      container.health_check_method,
      HealthCheckMethod::Auto | HealthCheckMethod::Http
    );

  if use_http {
    let url = container.health_check_url.as_deref().unwrap();
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut last_error = String::new();

    loop {
      match http_probe(
        url,
        container.health_check_auth.as_deref(),
      )
      .await
      {
        Ok(status) if status.is_success() => {
          return HealthOutcome {
            healthy: true,
            method: "http",
            message: format!("{url} returned {status}"),
          };
        }
        Ok(status) => {
          last_error = format!("{url} returned {status}");
        }
        Err(e) => {
          last_error = format!("{url} unreachable: {e}");
        }
      }

      let delay = retry_delay(attempt, exponential_backoff);
      if started.elapsed() + delay > TOTAL_BUDGET {
        break;
      }
      tokio::time::sleep(delay).await;
      attempt += 1;
    }

    // HTTP never came up within budget: believe the daemon.
    return match inspect_running(state, &container.name).await {
      Ok(true) => HealthOutcome {
        healthy: true,
        method: "docker_inspect_fallback",
        message: format!(
          "http check failed ({last_error}), container is running"
        ),
      },
      Ok(false) => HealthOutcome {
        healthy: false,
        method: "docker_inspect_fallback",
        message: format!(
          "http check failed ({last_error}), container not running"
        ),
      },
      Err(e) => HealthOutcome {
        healthy: false,
        method: "docker_inspect_fallback",
        message: format!(
          "http check failed ({last_error}), inspect failed: {e:#}"
        ),
      },
    };
  }

  match inspect_running(state, &container.name).await {
    Ok(true) => HealthOutcome {
      healthy: true,
      method: "docker",
      message: "container is running".to_string(),
    },
    Ok(false) => HealthOutcome {
      healthy: false,
      method: "docker",
      message: "container is not running".to_string(),
    },
    Err(e) => HealthOutcome {
      healthy: false,
      method: "docker",
      message: format!("inspect failed: {e:#}"),
    },
  }
}

async fn http_probe(
  url: &str,
  auth: Option<&str>,
) -> anyhow::Result<reqwest::StatusCode> {
  let client = reqwest::Client::builder()
    .timeout(ATTEMPT_TIMEOUT)
    .danger_accept_invalid_certs(true)
    .build()?;

  let mut url = url.to_string();
  let mut request = client.get(&url);

  // auth forms: `header:KEY=VALUE`, `token:BEARER`,
  // `query:KEY=VALUE`.
  if let Some(auth) = auth {
    if let Some(header) = auth.strip_prefix("header:") {
      if let Some((key, value)) = header.split_once('=') {
        request = request.header(key.trim(), value.trim());
      }
    } else if let Some(token) = auth.strip_prefix("token:") {
      request = request.bearer_auth(token.trim());
    } else if let Some(query) = auth.strip_prefix("query:")
      && let Some((key, value)) = query.split_once('=')
    {
      let sep = if url.contains('?') { '&' } else { '?' };
      url = format!("{url}{sep}{key}={value}");
      request = client.get(&url);
    }
  }

  let response = request.send().await?;
  Ok(response.status())
}

async fn inspect_running(
  state: &AppState,
  container_name: &str,
) -> anyhow::Result<bool> {
  let runtime = state.docker.inspect(container_name).await?;
  Ok(runtime.exists && runtime.running)
}

/// The coarse health shown on the details endpoint.
pub async fn observe_health(
  state: &AppState,
  container: &Container,
) -> HealthStatus {
  match state.docker.inspect(&container.name).await {
    Ok(runtime) if !runtime.exists => HealthStatus::Unknown,
    Ok(runtime) if runtime.running => HealthStatus::Healthy,
    Ok(runtime) if runtime.status == "exited" => {
      HealthStatus::Stopped
    }
    Ok(_) => HealthStatus::Unhealthy,
    Err(_) => HealthStatus::Unknown,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exponential_ladder_is_5_10_20_30_capped() {
    let delays = (0..5)
      .map(|n| retry_delay(n, true).as_secs())
      .collect::<Vec<_>>();
    assert_eq!(delays, vec![5, 10, 20, 30, 30]);
  }

  #[test]
  fn flat_ladder_without_exponential() {
    let delays = (0..3)
      .map(|n| retry_delay(n, false).as_secs())
      .collect::<Vec<_>>();
    assert_eq!(delays, vec![5, 5, 5]);
  }
}
