use anyhow::{Context, anyhow};
use axum::{
  Json, Router,
  extract::{Path, Query, State},
  routing::{get, post, put},
};
use mungos::{find::find_collect, mongodb::bson::doc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use serror::AddStatusCode;
use tidewatch_client::{
  api::{
    ActionResponse, BatchSettingsBody, ConnectionTestResponse,
    UpdateSettingBody,
  },
  entities::{
    alerter::{Alert, AlertData, SeverityLevel},
    container::Registry,
    setting::Setting,
    tidewatch_timestamp,
  },
};

use crate::{
  alert, settings,
  state::State as AppState,
  vulnforge::VulnForgeClient,
};

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/", get(list_settings))
    .route("/batch", post(batch_update))
    .route("/reset", post(reset_settings))
    .route("/test/{target}", post(test_connection))
    .route("/{key}", get(get_setting).put(put_setting))
}

#[derive(Deserialize, Default)]
struct ListSettingsQuery {
  #[serde(default)]
  category: Option<String>,
}

async fn list_settings(
  State(state): State<AppState>,
  Query(query): Query<ListSettingsQuery>,
) -> serror::Result<Json<Vec<Setting>>> {
  let filter = match &query.category {
    Some(category) => doc! { "category": category },
    None => doc! {},
  };
  let all = find_collect(&state.db.settings, filter, None)
    .await
    .context("failed to list settings")?
    .into_iter()
    .map(settings::masked)
    .collect();
  Ok(Json(all))
}

async fn get_setting(
  State(state): State<AppState>,
  Path(key): Path<String>,
) -> serror::Result<Json<Setting>> {
  let setting = state
    .db
    .settings
    .find_one(doc! { "key": &key })
    .await
    .context("failed to query setting")?
    .context("no setting with given key")
    .status_code(StatusCode::NOT_FOUND)?;
  Ok(Json(settings::masked(setting)))
}

async fn put_setting(
  State(state): State<AppState>,
  Path(key): Path<String>,
  Json(body): Json<UpdateSettingBody>,
) -> serror::Result<Json<ActionResponse>> {
  settings::set(&state, &key, body.value, "user").await?;
  Ok(Json(ActionResponse {
    success: true,
    message: format!("setting '{key}' updated"),
  }))
}

async fn batch_update(
  State(state): State<AppState>,
  Json(body): Json<BatchSettingsBody>,
) -> serror::Result<Json<ActionResponse>> {
  let count = body.settings.len();
  for (key, value) in body.settings {
    settings::set(&state, &key, value, "user").await?;
  }
  Ok(Json(ActionResponse {
    success: true,
    message: format!("{count} settings updated"),
  }))
}

async fn reset_settings(
  State(state): State<AppState>,
) -> serror::Result<Json<ActionResponse>> {
  let deleted = settings::delete_all(&state).await?;
  Ok(Json(ActionResponse {
    success: true,
    message: format!(
      "{deleted} settings reset to config defaults"
    ),
  }))
}

async fn test_connection(
  State(state): State<AppState>,
  Path(target): Path<String>,
) -> serror::Result<Json<ConnectionTestResponse>> {
  let response = match target.as_str() {
    "docker" => test_docker(&state).await,
    "dockerhub" => test_registry(&state, Registry::Dockerhub).await,
    "ghcr" => test_registry(&state, Registry::Ghcr).await,
    "vulnforge" => test_vulnforge(&state).await,
    "ntfy" | "gotify" | "pushover" | "slack" | "discord"
    | "telegram" | "email" => test_alerters(&state).await,
    other => {
      return Err(anyhow!("unknown test target '{other}'"))
        .status_code(StatusCode::BAD_REQUEST);
    }
  };
  Ok(Json(response))
}

async fn test_docker(state: &AppState) -> ConnectionTestResponse {
  match state.docker.ping().await {
    Ok(()) => ConnectionTestResponse {
      success: true,
      message: "docker daemon reachable".to_string(),
      details: json!({ "host": state.config.docker_host }),
    },
    Err(e) => ConnectionTestResponse {
      success: false,
      message: format!("{e:#}"),
      details: json!({ "host": state.config.docker_host }),
    },
  }
}

async fn test_registry(
  state: &AppState,
  registry: Registry,
) -> ConnectionTestResponse {
  // A tag listing for a known-public image exercises auth,
  // pagination, and parsing in one shot.
  let image = match registry {
    Registry::Dockerhub => "library/hello-world",
    _ => "linuxserver/nginx",
  };
  match state.registries.list_tags(registry, image).await {
    Ok(tags) => ConnectionTestResponse {
      success: true,
      message: format!("{registry} reachable"),
      details: json!({ "sample_tags": tags.len() }),
    },
    Err(e) => ConnectionTestResponse {
      success: false,
      message: format!("{e:#}"),
      details: json!({}),
    },
  }
}

async fn test_vulnforge(
  state: &AppState,
) -> ConnectionTestResponse {
  match VulnForgeClient::from_state(state).await {
    Ok(Some(client)) => match client.test_connection().await {
      Ok(()) => ConnectionTestResponse {
        success: true,
        message: "vulnforge reachable".to_string(),
        details: json!({}),
      },
      Err(e) => ConnectionTestResponse {
        success: false,
        message: format!("{e:#}"),
        details: json!({}),
      },
    },
    Ok(None) => ConnectionTestResponse {
      success: false,
      message: "vulnforge url is not configured".to_string(),
      details: json!({}),
    },
    Err(e) => ConnectionTestResponse {
      success: false,
      message: format!("{e:#}"),
      details: json!({}),
    },
  }
}

async fn test_alerters(
  state: &AppState,
) -> ConnectionTestResponse {
  let alerters = match find_collect(
    &state.db.alerters,
    doc! { "config.enabled": true },
    None,
  )
  .await
  {
    Ok(alerters) => alerters,
    Err(e) => {
      return ConnectionTestResponse {
        success: false,
        message: format!("failed to load alerters: {e:#}"),
        details: json!({}),
      };
    }
  };
  if alerters.is_empty() {
    return ConnectionTestResponse {
      success: false,
      message: "no enabled alerters configured".to_string(),
      details: json!({}),
    };
  }

  let test_alert = Alert {
    id: Default::default(),
    ts: tidewatch_timestamp(),
    level: SeverityLevel::Ok,
    data: AlertData::Test {
      name: "settings-test".to_string(),
    },
  };
  let mut failures = Vec::new();
  for alerter in &alerters {
    if let Err(e) =
      alert::send_alert_to_alerter(alerter, &test_alert).await
    {
      failures.push(format!("{}: {e:#}", alerter.name));
    }
  }

  ConnectionTestResponse {
    success: failures.is_empty(),
    message: if failures.is_empty() {
      format!("test alert sent to {} alerters", alerters.len())
    } else {
      "some alerters failed".to_string()
    },
    details: json!({ "failures": failures }),
  }
}
