use anyhow::Context;
use mungos::{
  find::find_collect,
  mongodb::bson::{Bson, doc, to_bson},
};
use serde_json::json;
use tidewatch_client::{
  api::CheckSummary,
  entities::{
    alerter::AlertData,
    container::{Container, UpdatePolicy},
    event::EventKind,
    tidewatch_timestamp,
    update::{
      ReasonType, Update, UpdateKind, UpdateStatus,
    },
  },
};

use crate::{
  alert, changelog, decision,
  decision::UpdateDecision,
  helpers::{is_duplicate_key_error, oid, short_digest},
  registry::{FetchResponse, RegistryError},
  settings,
  state::State,
  vulnforge,
};

/// Policy gate for auto-approval. Scope-violation rows are never
/// auto-approved: applying one would cross the scope the user
/// set.
pub fn should_auto_approve(
  policy: UpdatePolicy,
  update: &Update,
) -> bool {
  use tidewatch_client::entities::update::ChangeType;
  if update.scope_violation {
    return false;
  }
  match policy {
    UpdatePolicy::Disabled | UpdatePolicy::Manual => false,
    UpdatePolicy::Auto => true,
    UpdatePolicy::Security => {
      update.reason_type == ReasonType::Security
    }
    UpdatePolicy::PatchOnly => {
      update.change_type == ChangeType::Patch
    }
    UpdatePolicy::MinorAndPatch => matches!(
      update.change_type,
      ChangeType::Patch | ChangeType::Minor
    ),
  }
}

/// Runs the check for every container that isn't disabled.
pub async fn check_all_containers(state: &State) -> CheckSummary {
  let containers = match find_collect(
    &state.db.containers,
    doc! { "policy": { "$ne": "disabled" } },
    None,
  )
  .await
  .context("failed to list containers for check")
  {
    Ok(containers) => containers,
    Err(e) => {
      error!("{e:#}");
      return CheckSummary::default();
    }
  };

  let mut summary = CheckSummary {
    total: containers.len(),
    ..Default::default()
  };

  for container in containers {
    summary.checked += 1;
    match check_container(state, &container).await {
      Ok(Some(_)) => summary.updates_found += 1,
      Ok(None) => {}
      Err(e) => {
        summary.errors += 1;
        warn!(
          "update check failed for {} | {e:#}",
          container.name
        );
      }
    }
  }

  summary
}

/// One container: registry fetch, decision, and the decision's
/// application. Registry not-found means "no update"; auth and
/// transient failures surface on the container row and the
/// event stream without crashing the run.
pub async fn check_container(
  state: &State,
  container: &Container,
) -> anyhow::Result<Option<Update>> {
  state.events.publish_kind(
    EventKind::UpdateCheckStarted,
    &container.id,
    &container.name,
    json!({ "image": container.image }),
  );

  let global_prereleases =
    settings::include_prereleases(state).await?;
  let include_prereleases =
    container.effective_include_prereleases(global_prereleases);

  let fetch = match state
    .registries
    .fetch(container, include_prereleases)
    .await
  {
    Ok(fetch) => fetch,
    Err(RegistryError::NotFound) => FetchResponse::default(),
    Err(e) => {
      let message = formatting::sanitize_log_text(&format!(
        "{e:#}"
      ));
      state
        .db
        .containers
        .update_one(
          doc! { "_id": oid(&container.id)? },
          doc! { "$set": {
            "last_checked": tidewatch_timestamp(),
          } },
        )
        .await
        .ok();
      state.events.publish_kind(
        EventKind::UpdateCheckError,
        &container.id,
        &container.name,
        json!({ "error": message }),
      );
      return Err(e.into());
    }
  };

  let (update_decision, trace) =
    decision::decide(container, &fetch, global_prereleases);

  apply_decision(state, container, &update_decision, &trace)
    .await
}

/// Applies a pre-computed decision: container bookkeeping,
/// supersession, Update row creation, enrichment, auto-approval,
/// notifications.
pub async fn apply_decision(
  state: &State,
  container: &Container,
  decision: &UpdateDecision,
  trace: &tidewatch_client::entities::update::DecisionTrace,
) -> anyhow::Result<Option<Update>> {
  let container_oid = oid(&container.id)?;

  let mut set = doc! {
    "last_checked": tidewatch_timestamp(),
    "latest_major_tag": decision
      .latest_major_tag
      .as_ref()
      .map(|tag| Bson::String(tag.clone()))
      .unwrap_or(Bson::Null),
  };
  if let Some(digest) = &decision.new_digest {
    set.insert("current_digest", digest);
  }
  state
    .db
    .containers
    .update_one(
      doc! { "_id": &container_oid },
      doc! { "$set": set },
    )
    .await
    .context("failed to stamp container check")?;

  // Stale scope-violation rows: anything not pointing at the
  // currently blocked major goes away.
  let keep_violation_tag = decision
    .is_scope_violation
    .then(|| decision.latest_major_tag.clone())
    .flatten();
  let mut violation_filter = doc! {
    "container_id": &container.id,
    "scope_violation": true,
    "status": { "$in": ["pending", "approved", "pending_retry"] },
  };
  if let Some(tag) = &keep_violation_tag {
    violation_filter.insert("to_tag", doc! { "$ne": tag });
  }
  state
    .db
    .updates
    .delete_many(violation_filter)
    .await
    .context("failed to clean stale scope violations")?;

  if !decision.has_update {
    state
      .db
      .containers
      .update_one(
        doc! { "_id": &container_oid },
        doc! { "$set": {
          "update_available": false,
          "latest_tag": Bson::Null,
        } },
      )
      .await
      .context("failed to clear update availability")?;

    // Supersession: no candidate means any previously pending
    // rows are stale.
    state
      .db
      .updates
      .delete_many(doc! {
        "container_id": &container.id,
        "scope_violation": false,
        "status": { "$in": ["pending", "approved"] },
      })
      .await
      .context("failed to clear superseded updates")?;

    if decision.is_scope_violation {
      create_scope_violation_update(state, container, decision)
        .await?;
    }

    if container.vulnforge_enabled {
      vulnforge::refresh_baseline(state, container).await;
    }

    state.events.publish_kind(
      EventKind::UpdateCheckComplete,
      &container.id,
      &container.name,
      json!({ "status": "no_update" }),
    );
    return Ok(None);
  }

  let is_digest_update =
    decision.update_kind == UpdateKind::Digest;
  let to_tag = if is_digest_update {
    "latest".to_string()
  } else {
    decision.latest_tag.clone().unwrap_or_default()
  };

  // An identical active row already tracks this move. Digest
  // rows get their summary refreshed; retry counters are left
  // alone on purpose.
  if let Some(mut existing) = state
    .db
    .updates
    .find_one(doc! {
      "container_id": &container.id,
      "from_tag": &container.current_tag,
      "to_tag": &to_tag,
      "status": { "$in": ["pending", "approved", "pending_retry"] },
    })
    .await
    .context("failed to query existing update")?
  {
    if is_digest_update
      && let Some(new_digest) = &decision.new_digest
    {
      let previous = container
        .current_digest
        .as_deref()
        .map(short_digest)
        .unwrap_or("unknown")
        .to_string();
      let summary = format!(
        "Image digest updated: {previous} → {}",
        short_digest(new_digest)
      );
      state
        .db
        .updates
        .update_one(
          doc! { "_id": oid(&existing.id)? },
          doc! { "$set": {
            "reason_type": "maintenance",
            "reason_summary": &summary,
            "changelog": to_bson(&json!({
              "type": "digest_update",
              "from": container.current_digest,
              "to": new_digest,
            }))
            .unwrap_or(Bson::Null),
            "updated_at": tidewatch_timestamp(),
          } },
        )
        .await
        .context("failed to refresh digest update")?;
      existing.reason_summary = summary;
    }
    mark_update_available(state, container, &to_tag).await?;
    if decision.is_scope_violation {
      create_scope_violation_update(state, container, decision)
        .await?;
    }
    return Ok(Some(existing));
  }

  // A different (older) candidate may be pending: superseded.
  state
    .db
    .updates
    .delete_many(doc! {
      "container_id": &container.id,
      "scope_violation": false,
      "to_tag": { "$ne": &to_tag },
      "status": { "$in": ["pending", "approved"] },
    })
    .await
    .context("failed to supersede older updates")?;

  let (reason_type, reason_summary, changelog_value) =
    if is_digest_update {
      let previous = container
        .current_digest
        .as_deref()
        .map(short_digest)
        .unwrap_or("unknown")
        .to_string();
      let new_digest =
        decision.new_digest.clone().unwrap_or_default();
      (
        ReasonType::Maintenance,
        format!(
          "Image digest updated: {previous} → {}",
          short_digest(&new_digest)
        ),
        Some(json!({
          "type": "digest_update",
          "from": container.current_digest,
          "to": new_digest,
        })),
      )
    } else {
      (
        ReasonType::Unknown,
        "New version available".to_string(),
        None,
      )
    };

  let mut update = Update::builder()
    .container_id(container.id.clone())
    .from_tag(container.current_tag.clone())
    .to_tag(to_tag.clone())
    .registry(container.registry)
    .reason_type(reason_type)
    .reason_summary(reason_summary)
    .changelog(changelog_value)
    .update_kind(decision.update_kind)
    .change_type(decision.change_type)
    .decision_trace(Some(trace.to_json()))
    .created_at(tidewatch_timestamp())
    .updated_at(tidewatch_timestamp())
    .build()
    .context("failed to build update row")?;

  match state.db.updates.insert_one(&update).await {
    Ok(inserted) => {
      update.id = inserted
        .inserted_id
        .as_object_id()
        .map(|id| id.to_hex())
        .unwrap_or_default();
    }
    Err(e) if is_duplicate_key_error(&e) => {
      // A concurrent check won the insert race. Adopt its row.
      let winner = state
        .db
        .updates
        .find_one(doc! {
          "container_id": &container.id,
          "from_tag": &container.current_tag,
          "to_tag": &to_tag,
          "status": {
            "$in": ["pending", "approved", "pending_retry"],
          },
        })
        .await
        .context("failed to re-query after insert race")?
        .context("raced update row vanished")?;
      return Ok(Some(winner));
    }
    Err(e) => {
      return Err(e).context("failed to insert update row");
    }
  }

  mark_update_available(state, container, &to_tag).await?;

  if decision.is_scope_violation {
    create_scope_violation_update(state, container, decision)
      .await?;
  }

  // Changelog enrichment, best effort.
  if !is_digest_update {
    enrich_with_changelog(state, container, &mut update).await;
  }

  // CVE enrichment, best effort.
  if container.vulnforge_enabled
    && let Err(e) =
      vulnforge::enrich_update(state, container, &mut update)
        .await
  {
    warn!(
      "vulnforge enrichment failed for {} | {e:#}",
      container.name
    );
  }

  // Auto-approval.
  if update.status == UpdateStatus::Pending
    && settings::auto_update_enabled(state).await?
    && should_auto_approve(container.policy, &update)
  {
    state
      .db
      .updates
      .update_one(
        doc! { "_id": oid(&update.id)? },
        doc! { "$set": {
          "status": "approved",
          "approved_by": "system",
          "approved_at": tidewatch_timestamp(),
          "updated_at": tidewatch_timestamp(),
        } },
      )
      .await
      .context("failed to auto-approve update")?;
    update.status = UpdateStatus::Approved;
    update.approved_by = Some("system".to_string());
  }

  // Notify.
  if update.reason_type == ReasonType::Security
    && !update.cves_fixed.is_empty()
  {
    alert::send_alert(
      state,
      AlertData::SecurityUpdateAvailable {
        container_id: container.id.clone(),
        container_name: container.name.clone(),
        from_tag: update.from_tag.clone(),
        to_tag: update.to_tag.clone(),
        cves_fixed: update.cves_fixed.clone(),
      },
    )
    .await;
  } else {
    alert::send_alert(
      state,
      AlertData::UpdateAvailable {
        container_id: container.id.clone(),
        container_name: container.name.clone(),
        from_tag: update.from_tag.clone(),
        to_tag: update.to_tag.clone(),
        reason_summary: update.reason_summary.clone(),
      },
    )
    .await;
  }

  state.events.publish_kind(
    EventKind::UpdateAvailable,
    &container.id,
    &container.name,
    json!({
      "from_tag": update.from_tag,
      "to_tag": update.to_tag,
      "change_type": update.change_type,
      "update_kind": update.update_kind,
      "status": update.status,
    }),
  );

  Ok(Some(update))
}

async fn mark_update_available(
  state: &State,
  container: &Container,
  to_tag: &str,
) -> anyhow::Result<()> {
  state
    .db
    .containers
    .update_one(
      doc! { "_id": oid(&container.id)? },
      doc! { "$set": {
        "update_available": true,
        "latest_tag": to_tag,
      } },
    )
    .await
    .context("failed to mark update available")?;
  Ok(())
}

/// The dedicated row surfacing a major the scope blocked. Never
/// auto-approved; deduplicated against identical active rows.
async fn create_scope_violation_update(
  state: &State,
  container: &Container,
  decision: &UpdateDecision,
) -> anyhow::Result<()> {
  let Some(major_tag) = &decision.latest_major_tag else {
    return Ok(());
  };

  let existing = state
    .db
    .updates
    .find_one(doc! {
      "container_id": &container.id,
      "from_tag": &container.current_tag,
      "to_tag": major_tag,
      "status": { "$in": ["pending", "approved", "pending_retry"] },
    })
    .await
    .context("failed to query scope violation dedupe")?;
  if existing.is_some() {
    return Ok(());
  }

  let update = Update::builder()
    .container_id(container.id.clone())
    .from_tag(container.current_tag.clone())
    .to_tag(major_tag.clone())
    .registry(container.registry)
    .reason_type(ReasonType::Feature)
    .reason_summary(format!(
      "Major version update available (blocked by scope={})",
      container.scope
    ))
    .recommendation(Some(
      "Review required — change scope to major to apply"
        .to_string(),
    ))
    .scope_violation(true)
    .change_type(
      crate::version::change_type(
        &container.current_tag,
        major_tag,
      ),
    )
    .created_at(tidewatch_timestamp())
    .updated_at(tidewatch_timestamp())
    .build()
    .context("failed to build scope violation row")?;

  match state.db.updates.insert_one(&update).await {
    Ok(_) => Ok(()),
    // Lost a race against an identical row: fine.
    Err(e) if is_duplicate_key_error(&e) => Ok(()),
    Err(e) => {
      Err(e).context("failed to insert scope violation row")
    }
  }
}

/// Fetches the release notes, reclassifies the update, and
/// persists a freshly detected release source.
async fn enrich_with_changelog(
  state: &State,
  container: &Container,
  update: &mut Update,
) {
  let (release_source, detected) =
    match &container.release_source {
      Some(source) => (source.clone(), false),
      None => {
        match changelog::extract_release_source(
          &container.image,
        ) {
          Some(source) => (source, true),
          None => return,
        }
      }
    };

  let fetched = match state
    .changelogs
    .fetch(&release_source, &update.to_tag)
    .await
  {
    Ok(Some(fetched)) => fetched,
    Ok(None) => return,
    Err(e) => {
      debug!(
        "changelog fetch failed for {} | {e:#}",
        container.name
      );
      return;
    }
  };

  let (classified, summary) = changelog::classify(&fetched.body);
  if classified != ReasonType::Unknown {
    update.reason_type = classified;
  }
  if !summary.is_empty() {
    update.reason_summary = summary;
  }
  if update.cves_fixed.is_empty() {
    update.cves_fixed = changelog::extract_cves(&fetched.body);
  }
  update.changelog = Some(json!({
    "type": "release_notes",
    "body": fetched.body,
  }));
  update.changelog_url = fetched.url.clone();

  let Ok(update_oid) = oid(&update.id) else {
    return;
  };
  let set = doc! {
    "reason_type": update.reason_type.as_ref(),
    "reason_summary": &update.reason_summary,
    "cves_fixed": &update.cves_fixed,
    "changelog": to_bson(update.changelog.as_ref().unwrap())
      .unwrap_or(Bson::Null),
    "changelog_url": update
      .changelog_url
      .as_ref()
      .map(|url| Bson::String(url.clone()))
      .unwrap_or(Bson::Null),
    "updated_at": tidewatch_timestamp(),
  };
  if let Err(e) = state
    .db
    .updates
    .update_one(
      doc! { "_id": update_oid },
      doc! { "$set": set },
    )
    .await
  {
    warn!("failed to persist changelog enrichment | {e:#}");
  }

  // The detected source sticks once it produced a changelog.
  if detected
    && let Ok(container_oid) = oid(&container.id)
    && let Err(e) = state
      .db
      .containers
      .update_one(
        doc! { "_id": container_oid },
        doc! { "$set": { "release_source": &release_source } },
      )
      .await
  {
    warn!("failed to persist release source | {e:#}");
  }
}

#[cfg(test)]
mod tests {
  use tidewatch_client::entities::update::ChangeType;

  use super::*;

  fn update(
    reason: ReasonType,
    change: ChangeType,
    scope_violation: bool,
  ) -> Update {
    Update::builder()
      .container_id("abc".to_string())
      .from_tag("1.0.0".to_string())
      .to_tag("1.0.1".to_string())
      .reason_type(reason)
      .change_type(change)
      .scope_violation(scope_violation)
      .build()
      .unwrap()
  }

  #[test]
  fn approval_policy_table() {
    let patch =
      update(ReasonType::Bugfix, ChangeType::Patch, false);
    let minor =
      update(ReasonType::Feature, ChangeType::Minor, false);
    let security =
      update(ReasonType::Security, ChangeType::Patch, false);

    assert!(!should_auto_approve(UpdatePolicy::Disabled, &patch));
    assert!(!should_auto_approve(UpdatePolicy::Manual, &patch));
    assert!(should_auto_approve(UpdatePolicy::Auto, &minor));
    assert!(should_auto_approve(
      UpdatePolicy::Security,
      &security
    ));
    assert!(!should_auto_approve(UpdatePolicy::Security, &patch));
    assert!(should_auto_approve(UpdatePolicy::PatchOnly, &patch));
    assert!(!should_auto_approve(
      UpdatePolicy::PatchOnly,
      &minor
    ));
    assert!(should_auto_approve(
      UpdatePolicy::MinorAndPatch,
      &minor
    ));
    assert!(should_auto_approve(
      UpdatePolicy::MinorAndPatch,
      &patch
    ));
    assert!(!should_auto_approve(
      UpdatePolicy::MinorAndPatch,
      &update(ReasonType::Feature, ChangeType::Major, false)
    ));
  }

  #[test]
  fn scope_violations_never_auto_approve() {
    let violation =
      update(ReasonType::Feature, ChangeType::Major, true);
    assert!(!should_auto_approve(
      UpdatePolicy::Auto,
      &violation
    ));
  }
}
