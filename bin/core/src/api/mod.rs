use axum::{
  Router,
  extract::{Request, State},
  http::HeaderMap,
  middleware::{self, Next},
  response::Response,
};
use reqwest::StatusCode;

use crate::state::State as AppState;

pub mod containers;
pub mod settings;
pub mod updates;

pub fn router(state: AppState) -> Router {
  Router::new()
    .nest("/containers", containers::router())
    .nest("/updates", updates::router())
    .nest("/settings", settings::router())
    .layer(middleware::from_fn_with_state(
      state.clone(),
      require_passkey,
    ))
    .with_state(state)
}

/// Static API key auth: every request must carry the passkey
/// via `X-Api-Key` or `Authorization: Bearer`. An empty
/// configured passkey disables authentication entirely.
async fn require_passkey(
  State(state): State<AppState>,
  request: Request,
  next: Next,
) -> Result<Response, StatusCode> {
  if state.config.passkey.is_empty() {
    return Ok(next.run(request).await);
  }
  let provided = extract_key(request.headers());
  match provided {
    Some(key) if key == state.config.passkey => {
      Ok(next.run(request).await)
    }
    Some(_) => Err(StatusCode::FORBIDDEN),
    None => Err(StatusCode::UNAUTHORIZED),
  }
}

fn extract_key(headers: &HeaderMap) -> Option<&str> {
  if let Some(key) = headers
    .get("x-api-key")
    .and_then(|value| value.to_str().ok())
  {
    return Some(key);
  }
  headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Bearer "))
}
