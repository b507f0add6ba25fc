use anyhow::{Context, anyhow};
use axum::{
  Json, Router,
  extract::{Path, Query, State},
  routing::{delete, get, post},
};
use mungos::{
  by_id::find_one_by_id,
  find::find_collect,
  mongodb::{
    bson::{Bson, doc},
    options::FindOptions,
  },
};
use reqwest::StatusCode;
use serror::AddStatusCode;
use tidewatch_client::{
  api::{
    ActionResponse, ApplyUpdateBody, ApproveUpdateBody,
    BatchUpdateBody, BatchUpdateResponse, CheckSummary,
    ListUpdatesQuery, RejectUpdateBody,
  },
  entities::{
    history::UpdateType,
    tidewatch_timestamp,
    update::{Update, UpdateStatus},
  },
};

use crate::{
  checker, engine,
  helpers::oid,
  state::State as AppState,
};

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/", get(list_updates))
    .route("/check", post(check_all))
    .route("/check/{container_id}", post(check_one))
    .route("/{id}", delete(delete_update))
    .route("/{id}/approve", post(approve_update))
    .route("/{id}/reject", post(reject_update))
    .route("/{id}/apply", post(apply_update))
    .route("/batch/approve", post(batch_approve))
    .route("/batch/reject", post(batch_reject))
    .route("/history/{id}/rollback", post(rollback_history))
}

async fn list_updates(
  State(state): State<AppState>,
  Query(query): Query<ListUpdatesQuery>,
) -> serror::Result<Json<Vec<Update>>> {
  let mut filter = doc! {};
  if let Some(status) = query.status {
    filter.insert("status", status.as_ref());
  }
  if let Some(container_id) = &query.container_id {
    filter.insert("container_id", container_id);
  }
  let updates = find_collect(
    &state.db.updates,
    filter,
    FindOptions::builder()
      .sort(doc! { "created_at": -1 })
      .skip(query.skip.unwrap_or(0))
      .limit(query.limit.unwrap_or(100).clamp(1, 500))
      .build(),
  )
  .await
  .context("failed to list updates")?;
  Ok(Json(updates))
}

async fn check_all(
  State(state): State<AppState>,
) -> serror::Result<Json<CheckSummary>> {
  Ok(Json(checker::check_all_containers(&state).await))
}

async fn check_one(
  State(state): State<AppState>,
  Path(container_id): Path<String>,
) -> serror::Result<Json<CheckSummary>> {
  let container =
    find_one_by_id(&state.db.containers, &container_id)
      .await
      .context("failed to query container")?
      .context("no container with given id")
      .status_code(StatusCode::NOT_FOUND)?;

  let mut summary = CheckSummary {
    checked: 1,
    total: 1,
    ..Default::default()
  };
  match checker::check_container(&state, &container).await {
    Ok(Some(_)) => summary.updates_found = 1,
    Ok(None) => {}
    Err(_) => summary.errors = 1,
  }
  Ok(Json(summary))
}

async fn approve_update(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(body): Json<ApproveUpdateBody>,
) -> serror::Result<Json<ActionResponse>> {
  approve_inner(&state, &id, &body.approved_by)
    .await
    .map(Json)
}

async fn approve_inner(
  state: &AppState,
  id: &str,
  approved_by: &str,
) -> serror::Result<ActionResponse> {
  let update = find_one_by_id(&state.db.updates, id)
    .await
    .context("failed to query update")?
    .context("no update with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  match update.status {
    UpdateStatus::Pending | UpdateStatus::Rejected => {}
    other => {
      return Err(anyhow!(
        "update is already {other}, cannot approve"
      ))
      .status_code(StatusCode::BAD_REQUEST);
    }
  }

  state
    .db
    .updates
    .update_one(
      doc! { "_id": oid(&update.id)? },
      doc! {
        "$set": {
          "status": "approved",
          "approved_by": approved_by,
          "approved_at": tidewatch_timestamp(),
          "rejection_reason": Bson::Null,
          "updated_at": tidewatch_timestamp(),
        },
        "$inc": { "version": 1 },
      },
    )
    .await
    .context("failed to approve update")?;

  Ok(ActionResponse {
    success: true,
    message: format!("update approved by {approved_by}"),
  })
}

async fn reject_update(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(body): Json<RejectUpdateBody>,
) -> serror::Result<Json<ActionResponse>> {
  reject_inner(&state, &id, body.reason.as_deref())
    .await
    .map(Json)
}

async fn reject_inner(
  state: &AppState,
  id: &str,
  reason: Option<&str>,
) -> serror::Result<ActionResponse> {
  let update = find_one_by_id(&state.db.updates, id)
    .await
    .context("failed to query update")?
    .context("no update with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  if update.status.is_terminal()
    && update.status != UpdateStatus::Rejected
  {
    return Err(anyhow!(
      "update is already {}, cannot reject",
      update.status
    ))
    .status_code(StatusCode::BAD_REQUEST);
  }

  state
    .db
    .updates
    .update_one(
      doc! { "_id": oid(&update.id)? },
      doc! {
        "$set": {
          "status": "rejected",
          "rejection_reason": reason.unwrap_or_default(),
          "updated_at": tidewatch_timestamp(),
        },
        "$inc": { "version": 1 },
      },
    )
    .await
    .context("failed to reject update")?;

  // A rejected candidate no longer counts as available.
  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&update.container_id)? },
      doc! { "$set": {
        "update_available": false,
        "latest_tag": Bson::Null,
      } },
    )
    .await
    .context("failed to clear update availability")?;

  Ok(ActionResponse {
    success: true,
    message: "update rejected".to_string(),
  })
}

async fn apply_update(
  State(state): State<AppState>,
  Path(id): Path<String>,
  Json(body): Json<ApplyUpdateBody>,
) -> serror::Result<Json<ActionResponse>> {
  let update = find_one_by_id(&state.db.updates, &id)
    .await
    .context("failed to query update")?
    .context("no update with given id")
    .status_code(StatusCode::NOT_FOUND)?;

  if update.status != UpdateStatus::Approved {
    return Err(anyhow!(
      "update is {}, only approved updates can be applied",
      update.status
    ))
    .status_code(StatusCode::BAD_REQUEST);
  }

  let response = engine::apply_update(
    &state,
    &id,
    &body.triggered_by,
    UpdateType::Manual,
  )
  .await?;
  Ok(Json(response))
}

async fn delete_update(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<ActionResponse>> {
  let deleted = state
    .db
    .updates
    .delete_one(doc! { "_id": oid(&id)? })
    .await
    .context("failed to delete update")?;
  if deleted.deleted_count == 0 {
    return Err(anyhow!("no update with given id"))
      .status_code(StatusCode::NOT_FOUND);
  }
  state
    .db
    .pending_scans
    .delete_many(doc! { "update_id": &id })
    .await
    .context("failed to delete pending scans")?;
  Ok(Json(ActionResponse {
    success: true,
    message: "update deleted".to_string(),
  }))
}

async fn batch_approve(
  State(state): State<AppState>,
  Json(body): Json<BatchUpdateBody>,
) -> serror::Result<Json<BatchUpdateResponse>> {
  let mut response = BatchUpdateResponse {
    approved_count: Some(0),
    ..Default::default()
  };
  for id in &body.update_ids {
    match approve_inner(&state, id, "batch").await {
      Ok(result) if result.success => {
        *response.approved_count.as_mut().unwrap() += 1;
      }
      _ => {
        response.failed_count += 1;
        response.failed_ids.push(id.clone());
      }
    }
  }
  Ok(Json(response))
}

async fn batch_reject(
  State(state): State<AppState>,
  Json(body): Json<BatchUpdateBody>,
) -> serror::Result<Json<BatchUpdateResponse>> {
  let mut response = BatchUpdateResponse {
    rejected_count: Some(0),
    ..Default::default()
  };
  for id in &body.update_ids {
    match reject_inner(&state, id, body.reason.as_deref()).await
    {
      Ok(result) if result.success => {
        *response.rejected_count.as_mut().unwrap() += 1;
      }
      _ => {
        response.failed_count += 1;
        response.failed_ids.push(id.clone());
      }
    }
  }
  Ok(Json(response))
}

async fn rollback_history(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> serror::Result<Json<ActionResponse>> {
  let response =
    engine::rollback::rollback_update(&state, &id).await?;
  Ok(Json(response))
}
