use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use serde_json::json;

use super::*;

#[instrument(level = "debug")]
pub async fn send_alert(
  url: &str,
  alert: &Alert,
) -> anyhow::Result<()> {
  let content = standard_alert_content(alert);
  if !content.is_empty() {
    send_message(url, content).await?;
  }
  Ok(())
}

async fn send_message(
  url: &str,
  content: String,
) -> anyhow::Result<()> {
  // Incoming-webhook payload: a single markdown section block.
  let body = json!({
    "text": content,
    "blocks": [{
      "type": "section",
      "text": { "type": "mrkdwn", "text": content },
    }],
  });

  let response = http_client()
    .post(url)
    .json(&body)
    .send()
    .await
    .context("Failed to send message")?;

  let status = response.status();
  if status.is_success() {
    debug!("slack alert sent successfully: {}", status);
    Ok(())
  } else {
    let text = response.text().await.with_context(|| {
      format!(
        "Failed to send message to slack | {status} | failed to get response text"
      )
    })?;
    Err(anyhow!(
      "Failed to send message to slack | {} | {}",
      status,
      text
    ))
  }
}

fn http_client() -> &'static reqwest::Client {
  static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
  CLIENT.get_or_init(reqwest::Client::new)
}
