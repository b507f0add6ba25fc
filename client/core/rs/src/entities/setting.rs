use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::entities::{I64, JsonValue, MongoId};

/// A runtime-mutable key/value setting. Settings override the
/// matching [CoreConfig][crate::entities::config::core::CoreConfig]
/// fields where both exist.
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone, Builder)]
#[cfg_attr(
  feature = "mongo",
  derive(mongo_indexed::derive::MongoIndexed)
)]
pub struct Setting {
  /// The Mongo ID of the setting.
  /// This field is de/serialized from/to JSON as
  /// `{ "_id": { "$oid": "..." }, ...(rest of serialized Setting) }`
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  #[builder(setter(skip))]
  pub id: MongoId,

  #[cfg_attr(feature = "mongo", unique_index)]
  pub key: String,

  #[serde(default)]
  #[builder(default)]
  pub value: JsonValue,

  #[serde(default)]
  #[builder(default)]
  #[cfg_attr(feature = "mongo", index)]
  pub category: String,

  /// Sensitive values are masked in API reads.
  #[serde(default)]
  #[builder(default)]
  pub sensitive: bool,

  #[serde(default)]
  #[builder(default)]
  pub updated_at: I64,
}

impl Setting {
  pub fn builder() -> SettingBuilder {
    SettingBuilder::default()
  }
}
