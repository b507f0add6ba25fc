use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use serror::Serror;
use typeshare::typeshare;

/// Subtypes of [Alerter][alerter::Alerter] and [Alert][alerter::Alert].
pub mod alerter;
/// [CoreConfig][config::core::CoreConfig] and [DatabaseConfig][config::DatabaseConfig].
pub mod config;
/// Subtypes of [Container][container::Container].
pub mod container;
/// Event bus payloads.
pub mod event;
/// Subtypes of [UpdateHistory][history::UpdateHistory].
pub mod history;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Subtypes of [RestartState][restart::RestartState].
pub mod restart;
/// Subtypes of [PendingScanJob][scan::PendingScanJob].
pub mod scan;
/// Subtypes of [Setting][setting::Setting].
pub mod setting;
/// Subtypes of [Update][update::Update].
pub mod update;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;
#[typeshare(serialized_as = "any")]
pub type MongoDocument = bson::Document;
#[typeshare(serialized_as = "any")]
pub type JsonValue = serde_json::Value;
#[typeshare(serialized_as = "MongoIdObj")]
pub type MongoId = String;
#[typeshare(serialized_as = "__Serror")]
pub type _Serror = Serror;

#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MongoIdObj {
  #[serde(rename = "$oid")]
  pub oid: String,
}

#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct __Serror {
  pub error: String,
  pub trace: Vec<String>,
}

/// Unix timestamp in milliseconds as i64
pub fn tidewatch_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

/// The output of one stage of a longer running operation
/// (compose pull, compose up, tar helper, ...).
#[typeshare]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Log {
  /// A label for the stage this log comes from
  pub stage: String,
  /// The command associated with the log
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  /// Unix ms the stage started
  pub start_ts: I64,
  /// Unix ms the stage finished
  pub end_ts: I64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    Log {
      stage: stage.to_string(),
      command: String::new(),
      stdout: msg,
      stderr: String::new(),
      success: true,
      start_ts: tidewatch_timestamp(),
      end_ts: tidewatch_timestamp(),
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    Log {
      stage: stage.to_string(),
      command: String::new(),
      stdout: String::new(),
      stderr: msg,
      success: false,
      start_ts: tidewatch_timestamp(),
      end_ts: tidewatch_timestamp(),
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  for log in logs {
    if !log.success {
      return false;
    }
  }
  true
}
