use anyhow::{Context, anyhow};
use derive_variants::ExtractVariant;
use futures::future::join_all;
use mungos::{find::find_collect, mongodb::bson::doc};
use tidewatch_client::entities::{
  alerter::*, tidewatch_timestamp,
};
use tracing::Instrument;

use crate::state::AppState;

mod discord;
mod ntfy;
mod pushover;
mod slack;

/// Builds the alert for a notification-worthy occurrence,
/// records it, and fans it out to every matching alerter.
/// Never propagates errors into the calling flow.
pub async fn send_alert(state: &AppState, data: AlertData) {
  let alert = Alert {
    id: Default::default(),
    ts: tidewatch_timestamp(),
    level: level_for(&data),
    data,
  };

  if let Err(e) = state.db.alerts.insert_one(&alert).await {
    error!("failed to record alert | {e:#}");
  }

  send_to_alerters(state, &alert).await;
}

fn level_for(data: &AlertData) -> SeverityLevel {
  match data {
    AlertData::UpdateFailed { .. }
    | AlertData::RestartMaxRetries { .. } => {
      SeverityLevel::Critical
    }
    AlertData::SecurityUpdateAvailable { .. } => {
      SeverityLevel::Warning
    }
    _ => SeverityLevel::Ok,
  }
}

#[instrument(level = "debug", skip(state))]
async fn send_to_alerters(state: &AppState, alert: &Alert) {
  let span =
    info_span!("send_alert", alert = format!("{alert:?}"));
  async {
    let Ok(alerters) = find_collect(
      &state.db.alerters,
      doc! { "config.enabled": true },
      None,
    )
    .await
    .inspect_err(|e| {
      error!(
        "ERROR sending alert | failed to get alerters from db | {e:#}"
      )
    }) else {
      return;
    };

    let handles = alerters
      .iter()
      .map(|alerter| send_alert_to_alerter(alerter, alert));

    join_all(handles)
      .await
      .into_iter()
      .filter_map(|res| res.err())
      .for_each(|e| error!("{e:#}"));
  }
  .instrument(span)
  .await
}

pub async fn send_alert_to_alerter(
  alerter: &Alerter,
  alert: &Alert,
) -> anyhow::Result<()> {
  if !alerter.config.enabled {
    return Ok(());
  }

  let alert_type = alert.data.extract_variant();

  // Test alerts skip the filters so the endpoint always fires.
  if alert_type != AlertDataVariant::Test {
    if !alerter.config.alert_types.is_empty()
      && !alerter.config.alert_types.contains(&alert_type)
    {
      return Ok(());
    }
    if let Some(container_name) = alert_container_name(alert) {
      if alerter
        .config
        .except_containers
        .iter()
        .any(|name| name == container_name)
      {
        return Ok(());
      }
      if !alerter.config.containers.is_empty()
        && !alerter
          .config
          .containers
          .iter()
          .any(|name| name == container_name)
      {
        return Ok(());
      }
    }
  }

  match &alerter.config.endpoint {
    AlerterEndpoint::Custom(CustomAlerterEndpoint { url }) => {
      send_custom_alert(url, alert).await.with_context(|| {
        format!(
          "Failed to send alert to Custom Alerter {}",
          alerter.name
        )
      })
    }
    AlerterEndpoint::Slack(SlackAlerterEndpoint { url }) => {
      slack::send_alert(url, alert).await.with_context(|| {
        format!(
          "Failed to send alert to Slack Alerter {}",
          alerter.name
        )
      })
    }
    AlerterEndpoint::Discord(DiscordAlerterEndpoint { url }) => {
      discord::send_alert(url, alert).await.with_context(|| {
        format!(
          "Failed to send alert to Discord Alerter {}",
          alerter.name
        )
      })
    }
    AlerterEndpoint::Ntfy(NtfyAlerterEndpoint { url, email }) => {
      ntfy::send_alert(url, email.as_deref(), alert)
        .await
        .with_context(|| {
          format!(
            "Failed to send alert to ntfy Alerter {}",
            alerter.name
          )
        })
    }
    AlerterEndpoint::Pushover(PushoverAlerterEndpoint {
      url,
    }) => {
      pushover::send_alert(url, alert).await.with_context(
        || {
          format!(
            "Failed to send alert to Pushover Alerter {}",
            alerter.name
          )
        },
      )
    }
  }
}

#[instrument(level = "debug")]
async fn send_custom_alert(
  url: &str,
  alert: &Alert,
) -> anyhow::Result<()> {
  let res = reqwest::Client::new()
    .post(url)
    .json(alert)
    .send()
    .await
    .context("failed at post request to alerter")?;
  let status = res.status();
  if !status.is_success() {
    let text = res
      .text()
      .await
      .context("failed to get response text on alerter response")?;
    return Err(anyhow!(
      "post to alerter failed | {status} | {text}"
    ));
  }
  Ok(())
}

fn alert_container_name(alert: &Alert) -> Option<&str> {
  match &alert.data {
    AlertData::UpdateAvailable { container_name, .. }
    | AlertData::SecurityUpdateAvailable {
      container_name, ..
    }
    | AlertData::UpdateApplied { container_name, .. }
    | AlertData::UpdateFailed { container_name, .. }
    | AlertData::RolledBack { container_name, .. }
    | AlertData::RestartMaxRetries {
      container_name, ..
    } => Some(container_name),
    AlertData::Test { .. } | AlertData::None {} => None,
  }
}

fn fmt_level(level: SeverityLevel) -> &'static str {
  match level {
    SeverityLevel::Critical => "CRITICAL 🚨",
    SeverityLevel::Warning => "WARNING ‼️",
    SeverityLevel::Ok => "OK ✅",
  }
}

/// Standard message content format used by Ntfy, Pushover,
/// Discord, Slack.
fn standard_alert_content(alert: &Alert) -> String {
  let level = fmt_level(alert.level);
  match &alert.data {
    AlertData::Test { name } => {
      format!(
        "{level} | If you see this message, then Alerter {name} is working"
      )
    }
    AlertData::UpdateAvailable {
      container_name,
      from_tag,
      to_tag,
      reason_summary,
      ..
    } => {
      format!(
        "⬆ {container_name} has an update available\n{from_tag} → {to_tag}\n{reason_summary}"
      )
    }
    AlertData::SecurityUpdateAvailable {
      container_name,
      from_tag,
      to_tag,
      cves_fixed,
      ..
    } => {
      let cves = if cves_fixed.is_empty() {
        String::new()
      } else {
        format!("\nfixes: {}", cves_fixed.join(", "))
      };
      format!(
        "{level} | 🛡 Security update for {container_name}\n{from_tag} → {to_tag}{cves}"
      )
    }
    AlertData::UpdateApplied {
      container_name,
      from_tag,
      to_tag,
      ..
    } => {
      format!(
        "⬆ {container_name} was updated automatically\n{from_tag} → {to_tag}"
      )
    }
    AlertData::UpdateFailed {
      container_name,
      from_tag,
      to_tag,
      error,
      ..
    } => {
      format!(
        "{level} | Update of {container_name} failed\n{from_tag} → {to_tag}\n{error}"
      )
    }
    AlertData::RolledBack {
      container_name,
      from_tag,
      to_tag,
      ..
    } => {
      format!(
        "{level} | {container_name} rolled back\n{from_tag} → {to_tag}"
      )
    }
    AlertData::RestartMaxRetries {
      container_name,
      attempts,
      last_failure_reason,
      ..
    } => {
      format!(
        "{level} | {container_name} keeps crashing, giving up after {attempts} restarts\n{last_failure_reason}"
      )
    }
    AlertData::None {} => Default::default(),
  }
}
