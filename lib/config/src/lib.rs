//! # TideWatch Config
//!
//! Loads TideWatch config files from one or more paths, merging them
//! into a final configuration object. Supports interpolating
//! environment variables with '${VAR}' syntax.

use std::path::{Path, PathBuf};

use colored::Colorize;
use indexmap::IndexSet;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub type Result<T> = ::core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("failed to read config file at {path:?}")]
  ReadFile {
    path: PathBuf,
    #[source]
    e: std::io::Error,
  },
  #[error("failed to parse toml file at {path:?}")]
  ParseToml {
    path: PathBuf,
    #[source]
    e: toml::de::Error,
  },
  #[error("failed to parse yaml file at {path:?}")]
  ParseYaml {
    path: PathBuf,
    #[source]
    e: serde_yaml_ng::Error,
  },
  #[error("failed to parse json file at {path:?}")]
  ParseJson {
    path: PathBuf,
    #[source]
    e: serde_json::Error,
  },
  #[error("unsupported config file type at {path:?}")]
  UnsupportedFileType { path: PathBuf },
  #[error("config must deserialize to an object")]
  NotAnObject,
  #[error(
    "config field '{key}' has mismatched types across files"
  )]
  FieldTypeMismatch { key: String },
  #[error("failed to parse merged config")]
  ParseFinal(#[source] serde_json::Error),
  #[error("failed to serialize config for merge")]
  Serialize(#[source] serde_json::Error),
}

/// Set the configuration for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories to include in the final
  /// configuration. Later paths override earlier ones.
  pub paths: &'outer [&'inner Path],
  /// Wildcard patterns to match file names inside directory paths.
  /// Later patterns override earlier ones within a directory.
  pub match_wildcards: &'outer [&'inner str],
  /// Whether nested config objects merge key-by-key, or are
  /// replaced whole by the highest priority file.
  pub merge_nested: bool,
  /// Whether arrays extend across files, or are replaced whole.
  pub extend_array: bool,
  /// Print extra information on config load.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let mut wildcards =
      Vec::with_capacity(self.match_wildcards.len());
    for &wc in self.match_wildcards {
      match wildcard::Wildcard::new(wc.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!(
            "{}: Keyword '{}' is invalid wildcard | {e:?}",
            "ERROR".red(),
            wc.bold(),
          );
        }
      }
    }

    let mut all_files = IndexSet::new();
    for &path in self.paths {
      let Ok(metadata) = std::fs::metadata(path) else {
        continue;
      };
      if metadata.is_dir() {
        let mut matched = collect_dir_files(path, &wildcards);
        matched.sort_by(|(a_index, a_path), (b_index, b_path)| {
          a_index.cmp(b_index).then(a_path.cmp(b_path))
        });
        all_files.extend(matched.into_iter().map(|(_, path)| path));
      } else if metadata.is_file() {
        let path = path.to_path_buf();
        // A repeated path moves to the back, keeping the
        // later (higher priority) position.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }

    if self.debug_print {
      println!(
        "{}: {}: {all_files:?}",
        "DEBUG".cyan(),
        "Found Files".dimmed()
      );
    }

    let mut target = serde_json::Map::new();
    for file in &all_files {
      let source = match parse_config_file(file) {
        Ok(source) => source,
        Err(e) => {
          eprintln!("{}: {e}", "WARN".yellow());
          continue;
        }
      };
      target = match merge_objects(
        target.clone(),
        source,
        self.merge_nested,
        self.extend_array,
      ) {
        Ok(target) => target,
        Err(e) => {
          eprintln!("{}: {e}", "WARN".yellow());
          target
        }
      };
    }

    serde_json::from_value(serde_json::Value::Object(target))
      .map_err(Error::ParseFinal)
  }
}

fn collect_dir_files(
  path: &Path,
  keywords: &[wildcard::Wildcard],
) -> Vec<(usize, PathBuf)> {
  let mut files = Vec::new();
  let Ok(folder) = path.canonicalize() else {
    return files;
  };
  let Ok(read_dir) = std::fs::read_dir(&folder) else {
    return files;
  };
  for dir_entry in read_dir.flatten() {
    let path = dir_entry.path();
    let Ok(metadata) = dir_entry.metadata() else {
      continue;
    };
    if !metadata.is_file() {
      continue;
    }
    let file_name = dir_entry.file_name();
    let Some(file_name) = file_name.to_str() else {
      continue;
    };
    let index = if keywords.is_empty() {
      0
    } else if let Some(index) = keywords
      .iter()
      .position(|wc| wc.is_match(file_name.as_bytes()))
    {
      index + 1
    } else {
      continue;
    };
    let Ok(path) = path.canonicalize() else {
      continue;
    };
    files.push((index, path));
  }
  files
}

fn parse_config_file(
  file: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  let contents =
    std::fs::read_to_string(file).map_err(|e| Error::ReadFile {
      e,
      path: file.to_path_buf(),
    })?;
  let contents = interpolate_env(&contents);
  match file.extension().and_then(|e| e.to_str()) {
    Some("toml") => {
      toml::from_str(&contents).map_err(|e| Error::ParseToml {
        e,
        path: file.to_path_buf(),
      })
    }
    Some("yaml") | Some("yml") => serde_yaml_ng::from_str(&contents)
      .map_err(|e| Error::ParseYaml {
        e,
        path: file.to_path_buf(),
      }),
    Some("json") => serde_json::from_str(&contents).map_err(|e| {
      Error::ParseJson {
        e,
        path: file.to_path_buf(),
      }
    }),
    Some(_) | None => Err(Error::UnsupportedFileType {
      path: file.to_path_buf(),
    }),
  }
}

/// - Source overrides target.
/// - Recurses into objects if merge_nested, otherwise replaces.
/// - Extends arrays if extend_array, otherwise replaces.
pub fn merge_objects(
  mut target: serde_json::Map<String, serde_json::Value>,
  source: serde_json::Map<String, serde_json::Value>,
  merge_nested: bool,
  extend_array: bool,
) -> Result<serde_json::Map<String, serde_json::Value>> {
  for (key, value) in source {
    let Some(curr) = target.remove(&key) else {
      target.insert(key, value);
      continue;
    };
    match curr {
      serde_json::Value::Object(target_obj) => {
        if !merge_nested {
          target.insert(key, value);
          continue;
        }
        match value {
          serde_json::Value::Object(source_obj) => {
            target.insert(
              key,
              serde_json::Value::Object(merge_objects(
                target_obj,
                source_obj,
                merge_nested,
                extend_array,
              )?),
            );
          }
          _ => return Err(Error::FieldTypeMismatch { key }),
        }
      }
      serde_json::Value::Array(mut target_arr) => {
        if !extend_array {
          target.insert(key, value);
          continue;
        }
        match value {
          serde_json::Value::Array(source_arr) => {
            target_arr.extend(source_arr);
            target
              .insert(key, serde_json::Value::Array(target_arr));
          }
          _ => return Err(Error::FieldTypeMismatch { key }),
        }
      }
      _ => {
        target.insert(key, value);
      }
    }
  }
  Ok(target)
}

/// Source overrides target.
pub fn merge_config<T: Serialize + DeserializeOwned>(
  target: T,
  source: T,
  merge_nested: bool,
  extend_array: bool,
) -> Result<T> {
  let serde_json::Value::Object(target) =
    serde_json::to_value(target).map_err(Error::Serialize)?
  else {
    return Err(Error::NotAnObject);
  };
  let serde_json::Value::Object(source) =
    serde_json::to_value(source).map_err(Error::Serialize)?
  else {
    return Err(Error::NotAnObject);
  };
  let object =
    merge_objects(target, source, merge_nested, extend_array)?;
  serde_json::from_value(serde_json::Value::Object(object))
    .map_err(Error::ParseFinal)
}

/// Only supports '${VAR}' syntax.
fn interpolate_env(input: &str) -> String {
  let re = regex::Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap();
  let first_pass = re
    .replace_all(input, |caps: &regex::Captures| {
      std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned();
  // Twice, in case an env var expands to another env var.
  re.replace_all(&first_pass, |caps: &regex::Captures| {
    std::env::var(&caps[1]).unwrap_or_default()
  })
  .into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn merge_replaces_scalars_and_merges_objects() {
    let target = serde_json::json!({
      "port": 8080,
      "database": { "uri": "mongodb://localhost:27017" }
    });
    let source = serde_json::json!({
      "port": 9120,
      "database": { "db_name": "tidewatch" }
    });
    let (serde_json::Value::Object(target), serde_json::Value::Object(source)) =
      (target, source)
    else {
      unreachable!()
    };
    let merged =
      merge_objects(target, source, true, false).unwrap();
    assert_eq!(merged["port"], 9120);
    assert_eq!(
      merged["database"]["uri"],
      "mongodb://localhost:27017"
    );
    assert_eq!(merged["database"]["db_name"], "tidewatch");
  }

  #[test]
  fn merge_object_type_mismatch_errors() {
    let target = serde_json::json!({ "database": { "uri": "x" } });
    let source = serde_json::json!({ "database": "inline" });
    let (serde_json::Value::Object(target), serde_json::Value::Object(source)) =
      (target, source)
    else {
      unreachable!()
    };
    assert!(merge_objects(target, source, true, false).is_err());
  }
}
