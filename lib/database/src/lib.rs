use std::str::FromStr;

use anyhow::{Context, anyhow};
use mongo_indexed::create_index;
use mungos::{
  find::find_collect,
  init::MongoBuilder,
  mongodb::{
    Collection, Database, IndexModel,
    bson::{doc, oid::ObjectId},
    options::IndexOptions,
  },
};
use tidewatch_client::entities::{
  alerter::{Alert, Alerter},
  config::DatabaseConfig,
  container::Container,
  history::UpdateHistory,
  restart::RestartState,
  scan::PendingScanJob,
  setting::Setting,
  update::Update,
};

pub use mongo_indexed;
pub use mungos;

#[derive(Debug)]
pub struct Client {
  pub containers: Collection<Container>,
  pub updates: Collection<Update>,
  pub update_history: Collection<UpdateHistory>,
  pub restart_states: Collection<RestartState>,
  pub pending_scans: Collection<PendingScanJob>,
  pub settings: Collection<Setting>,
  pub alerters: Collection<Alerter>,
  pub alerts: Collection<Alert>,
  //
  pub db: Database,
}

impl Client {
  pub async fn new(
    config: &DatabaseConfig,
  ) -> anyhow::Result<Client> {
    let db = init(config).await?;
    Self::from_database(db).await
  }

  pub async fn from_database(
    db: Database,
  ) -> anyhow::Result<Client> {
    let client = Client {
      containers: mongo_indexed::collection(&db, true).await?,
      updates: mongo_indexed::collection(&db, true).await?,
      update_history: mongo_indexed::collection(&db, true).await?,
      restart_states: mongo_indexed::collection(&db, true).await?,
      pending_scans: mongo_indexed::collection(&db, true).await?,
      settings: mongo_indexed::collection(&db, true).await?,
      alerters: mongo_indexed::collection(&db, true).await?,
      alerts: mongo_indexed::collection(&db, true).await?,
      //
      db,
    };

    client.create_guard_indexes().await?;

    Ok(client)
  }

  /// The two uniqueness invariants the rest of the system leans
  /// on. Partial indexes, so terminal rows never hold the slot.
  async fn create_guard_indexes(&self) -> anyhow::Result<()> {
    // At most one active Update per (container, from, to).
    self
      .updates
      .create_index(
        IndexModel::builder()
          .keys(doc! {
            "container_id": 1,
            "from_tag": 1,
            "to_tag": 1,
          })
          .options(
            IndexOptions::builder()
              .unique(true)
              .partial_filter_expression(doc! {
                "status": { "$in": [
                  "pending", "approved", "pending_retry",
                ] }
              })
              .build(),
          )
          .build(),
      )
      .await
      .context("failed to create active update guard index")?;

    // At most one in-progress apply per container.
    self
      .update_history
      .create_index(
        IndexModel::builder()
          .keys(doc! { "container_id": 1 })
          .options(
            IndexOptions::builder()
              .unique(true)
              .partial_filter_expression(doc! {
                "status": "in_progress"
              })
              .build(),
          )
          .build(),
      )
      .await
      .context("failed to create in-progress guard index")?;

    // Retry queue scans hit (status, next_retry_at).
    create_index(&self.updates, "next_retry_at")
      .await
      .context("failed to create retry queue index")?;

    Ok(())
  }

  /// Removes a container and everything it owns.
  pub async fn cascade_delete_container(
    &self,
    container_id: &str,
  ) -> anyhow::Result<()> {
    let update_ids = find_collect(
      &self.updates,
      doc! { "container_id": container_id },
      None,
    )
    .await
    .context("failed to list updates for cascade delete")?
    .into_iter()
    .map(|update| update.id)
    .collect::<Vec<_>>();

    self
      .pending_scans
      .delete_many(doc! { "update_id": { "$in": &update_ids } })
      .await
      .context("failed to delete pending scans")?;
    self
      .updates
      .delete_many(doc! { "container_id": container_id })
      .await
      .context("failed to delete updates")?;
    self
      .update_history
      .delete_many(doc! { "container_id": container_id })
      .await
      .context("failed to delete update history")?;
    self
      .restart_states
      .delete_many(doc! { "container_id": container_id })
      .await
      .context("failed to delete restart state")?;

    let oid = ObjectId::from_str(container_id)
      .context("container id is not a valid ObjectId")?;
    self
      .containers
      .delete_one(doc! { "_id": oid })
      .await
      .context("failed to delete container")?;
    Ok(())
  }
}

/// Initializes an unindexed database handle.
pub async fn init(
  DatabaseConfig {
    uri,
    address,
    username,
    password,
    app_name,
    db_name,
  }: &DatabaseConfig,
) -> anyhow::Result<Database> {
  let mut client = MongoBuilder::default().app_name(app_name);

  match (
    !uri.is_empty(),
    !address.is_empty(),
    !username.is_empty(),
    !password.is_empty(),
  ) {
    (true, _, _, _) => {
      client = client.uri(uri);
    }
    (_, true, true, true) => {
      client = client
        .address(address)
        .username(username)
        .password(password);
    }
    (_, true, _, _) => {
      client = client.address(address);
    }
    _ => {
      return Err(anyhow!(
        "'config.database' not configured correctly. must pass either 'config.database.uri', or 'config.database.address' + 'config.database.username' + 'config.database.password'"
      ));
    }
  }

  let client = client
    .build()
    .await
    .context("Failed to initialize database connection.")?;

  Ok(client.database(db_name))
}
