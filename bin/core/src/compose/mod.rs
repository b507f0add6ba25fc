use std::{
  path::{Path, PathBuf},
  sync::LazyLock,
};

use anyhow::{Context, anyhow};
use tidewatch_client::entities::tidewatch_timestamp;
use tokio::fs;

pub mod discovery;

static TAG_FORMAT: LazyLock<regex::Regex> = LazyLock::new(|| {
  regex::Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127}$")
    .unwrap()
});

static DIGEST_FORMAT: LazyLock<regex::Regex> =
  LazyLock::new(|| {
    regex::Regex::new(r"^sha256:[a-f0-9]{64}$").unwrap()
  });

/// Docker tag grammar, or a pinned digest.
pub fn valid_tag(tag: &str) -> bool {
  TAG_FORMAT.is_match(tag) || DIGEST_FORMAT.is_match(tag)
}

/// Validates a compose file path against traversal and escapes.
///
/// The path must be clean (no `..`, `//`, backslash, NUL), carry
/// a yaml suffix, resolve to a regular file, and stay inside one
/// of the allowed bases after resolution.
pub fn validate_compose_path(
  path: &str,
  allowed_bases: &[PathBuf],
) -> anyhow::Result<PathBuf> {
  if path.contains("..")
    || path.contains("//")
    || path.contains('\\')
    || path.contains('\0')
  {
    return Err(anyhow!("compose path contains unsafe sequences"));
  }
  let path = Path::new(path);
  match path.extension().and_then(|e| e.to_str()) {
    Some("yml") | Some("yaml") => {}
    _ => {
      return Err(anyhow!(
        "compose path must end in .yml or .yaml"
      ));
    }
  }

  let resolved = path
    .canonicalize()
    .with_context(|| format!("cannot resolve {path:?}"))?;
  if !resolved.is_file() {
    return Err(anyhow!("compose path is not a regular file"));
  }

  let contained = allowed_bases.iter().any(|base| {
    base
      .canonicalize()
      .map(|base| resolved.starts_with(base))
      .unwrap_or(false)
  });
  if !contained {
    return Err(anyhow!(
      "compose path escapes the allowed directories"
    ));
  }

  Ok(resolved)
}

/// The docker daemon runs on the host, so paths under the
/// in-container compose mount must be rewritten to their
/// host-visible location before being passed via `-f`.
pub fn translate_to_host_path(
  path: &Path,
  compose_dir: &Path,
  host_base: &str,
) -> anyhow::Result<PathBuf> {
  if host_base.is_empty() {
    return Ok(path.to_path_buf());
  }
  let relative = path.strip_prefix(compose_dir).with_context(|| {
    format!("{path:?} is not under {compose_dir:?}")
  })?;
  let translated = Path::new(host_base).join(relative);
  // Containment holds independently of the input validation.
  let normalized =
    translated.components().collect::<PathBuf>();
  if !normalized.starts_with(host_base) {
    return Err(anyhow!(
      "translated path escapes the host compose base"
    ));
  }
  Ok(normalized)
}

/// Rewrites `services.{service}.image` to carry `new_tag`,
/// touching nothing else: comments, anchors, quoting, and every
/// other byte survive. Returns the new contents and the previous
/// image string.
pub fn set_image_tag(
  contents: &str,
  service_name: &str,
  new_tag: &str,
) -> anyhow::Result<(String, String)> {
  if !tidewatch_client::entities::container::valid_container_name(
    service_name,
  ) {
    return Err(anyhow!(
      "invalid service name: {service_name}"
    ));
  }
  if !valid_tag(new_tag) {
    return Err(anyhow!("invalid tag format: {new_tag}"));
  }

  // Structural check up front, so a malformed file never gets a
  // speculative text edit.
  let parsed: serde_yaml_ng::Value =
    serde_yaml_ng::from_str(contents)
      .context("compose file is not valid yaml")?;
  parsed
    .get("services")
    .and_then(|services| services.get(service_name))
    .and_then(|service| service.get("image"))
    .and_then(|image| image.as_str())
    .context("service or image key not found in compose file")?;

  let service_header = regex::Regex::new(&format!(
    r"^(\s*){}:\s*(#.*)?$",
    regex::escape(service_name)
  ))
  .unwrap();
  let image_line = regex::Regex::new(
    r#"^(\s*image:\s*["']?)([^"'#\s]+)(.*)$"#,
  )
  .unwrap();

  let mut out = Vec::new();
  let mut in_service = false;
  let mut service_indent = 0usize;
  let mut previous_image = None;

  for line in contents.lines() {
    if previous_image.is_none() {
      if let Some(caps) = service_header.captures(line) {
        in_service = true;
        service_indent = caps[1].len();
        out.push(line.to_string());
        continue;
      }
      if in_service {
        let indent =
          line.len() - line.trim_start_matches(' ').len();
        let blank = line.trim().is_empty();
        if !blank && indent <= service_indent {
          // Left the service block without finding the image.
          in_service = false;
        } else if let Some(caps) = image_line.captures(line) {
          let old_image = caps[2].to_string();
          let base = match old_image.rsplit_once(':') {
            Some((base, tag)) if !tag.contains('/') => base,
            _ => old_image.as_str(),
          };
          out.push(format!(
            "{}{}:{}{}",
            &caps[1], base, new_tag, &caps[3]
          ));
          previous_image = Some(old_image);
          continue;
        }
      }
    }
    out.push(line.to_string());
  }

  let previous_image = previous_image.context(
    "image line not found in service block (anchored images are \
     resolved by yaml but not editable in place)",
  )?;

  let mut rewritten = out.join("\n");
  if contents.ends_with('\n') {
    rewritten.push('\n');
  }
  Ok((rewritten, previous_image))
}

/// Applies [set_image_tag] to the file, atomically: the new
/// contents land in a sibling temp file which is renamed over
/// the original.
pub async fn rewrite_compose_file(
  path: &Path,
  service_name: &str,
  new_tag: &str,
) -> anyhow::Result<String> {
  let contents = fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read {path:?}"))?;
  let (rewritten, previous_image) =
    set_image_tag(&contents, service_name, new_tag)?;

  let tmp = path.with_extension("yml.tidewatch-tmp");
  fs::write(&tmp, &rewritten)
    .await
    .with_context(|| format!("failed to write {tmp:?}"))?;
  fs::rename(&tmp, path)
    .await
    .with_context(|| format!("failed to move {tmp:?} over {path:?}"))?;

  Ok(previous_image)
}

/// Copies the compose file into the backup directory before any
/// mutation. Returns the backup path.
pub async fn backup_compose_file(
  path: &Path,
  backup_dir: &Path,
) -> anyhow::Result<PathBuf> {
  fs::create_dir_all(backup_dir)
    .await
    .context("failed to create compose backup directory")?;
  let name = path
    .file_name()
    .and_then(|name| name.to_str())
    .context("compose path has no file name")?;
  let backup = backup_dir
    .join(format!("{name}.{}.backup", tidewatch_timestamp()));
  fs::copy(path, &backup)
    .await
    .with_context(|| format!("failed to back up {path:?}"))?;
  Ok(backup)
}

/// Restore is a plain overwrite from the backup.
pub async fn restore_compose_file(
  path: &Path,
  backup: &Path,
) -> anyhow::Result<()> {
  fs::copy(backup, path).await.with_context(|| {
    format!("failed to restore {path:?} from {backup:?}")
  })?;
  Ok(())
}

static HEALTH_URL: LazyLock<regex::Regex> = LazyLock::new(|| {
  regex::Regex::new(r#"https?://[^\s'"\\]{1,2000}"#).unwrap()
});

static TRAEFIK_HOST: LazyLock<regex::Regex> =
  LazyLock::new(|| {
    regex::Regex::new(r"Host\(`([^`]+)`\)").unwrap()
  });

/// Best-effort health URL for a service: an http url inside
/// `healthcheck.test` wins, a Traefik ``Host(`...`)`` router rule
/// is the fallback. Localhost urls are rewritten onto the
/// service name, which is what resolves on the compose network.
pub fn extract_health_url(
  service: &serde_yaml_ng::Value,
  service_name: &str,
) -> Option<String> {
  if let Some(test) =
    service.get("healthcheck").and_then(|h| h.get("test"))
  {
    let candidates: Vec<&str> = match test {
      serde_yaml_ng::Value::String(s) => vec![s.as_str()],
      serde_yaml_ng::Value::Sequence(seq) => {
        seq.iter().filter_map(|v| v.as_str()).collect()
      }
      _ => Vec::new(),
    };
    for candidate in candidates {
      if candidate.len() > 4096 {
        continue;
      }
      if let Some(m) = HEALTH_URL.find(candidate) {
        return Some(normalize_health_url(
          m.as_str(),
          service_name,
        ));
      }
    }
  }

  for label in service_labels(service) {
    if label.contains(".rule")
      && let Some(caps) = TRAEFIK_HOST.captures(&label)
    {
      return Some(format!("https://{}", &caps[1]));
    }
  }

  None
}

fn normalize_health_url(url: &str, service_name: &str) -> String {
  url
    .replacen("://localhost", &format!("://{service_name}"), 1)
    .replacen("://127.0.0.1", &format!("://{service_name}"), 1)
}

/// Labels normalized to `key=value` strings, whichever yaml shape
/// (list or map) the file uses.
pub fn service_labels(
  service: &serde_yaml_ng::Value,
) -> Vec<String> {
  match service.get("labels") {
    Some(serde_yaml_ng::Value::Sequence(seq)) => seq
      .iter()
      .filter_map(|v| v.as_str())
      .map(str::to_string)
      .collect(),
    Some(serde_yaml_ng::Value::Mapping(map)) => map
      .iter()
      .filter_map(|(key, value)| {
        let key = key.as_str()?;
        let value = match value {
          serde_yaml_ng::Value::String(s) => s.clone(),
          serde_yaml_ng::Value::Bool(b) => b.to_string(),
          serde_yaml_ng::Value::Number(n) => n.to_string(),
          _ => return None,
        };
        Some(format!("{key}={value}"))
      })
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const COMPOSE: &str = r#"# edge stack
x-common: &common
  restart: unless-stopped

services:
  web:
    <<: *common
    image: nginx:1.25.0  # keep pinned
    ports:
      - "8080:80"
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:8080/health"]
  db:
    image: "postgres:16.1"
"#;

  #[test]
  fn tag_validation() {
    assert!(valid_tag("1.25.3"));
    assert!(valid_tag("v2.0-alpine"));
    assert!(valid_tag(&format!("sha256:{}", "a".repeat(64))));
    assert!(!valid_tag(""));
    assert!(!valid_tag("bad tag"));
    assert!(!valid_tag("-leading"));
    assert!(!valid_tag("$(injection)"));
  }

  #[test]
  fn rewrite_preserves_every_other_byte() {
    let (rewritten, previous) =
      set_image_tag(COMPOSE, "web", "1.25.3").unwrap();
    assert_eq!(previous, "nginx:1.25.0");
    assert!(
      rewritten.contains("image: nginx:1.25.3  # keep pinned")
    );
    // comments, anchors, quoting of the other service untouched
    assert!(rewritten.contains("# edge stack"));
    assert!(rewritten.contains("x-common: &common"));
    assert!(rewritten.contains("image: \"postgres:16.1\""));
  }

  #[test]
  fn rewrite_round_trip_is_byte_identical() {
    let (forward, _) =
      set_image_tag(COMPOSE, "web", "1.25.3").unwrap();
    let (back, _) =
      set_image_tag(&forward, "web", "1.25.0").unwrap();
    assert_eq!(back, COMPOSE);
  }

  #[test]
  fn rewrite_respects_quote_style() {
    let (rewritten, previous) =
      set_image_tag(COMPOSE, "db", "16.2").unwrap();
    assert_eq!(previous, "postgres:16.1");
    assert!(rewritten.contains("image: \"postgres:16.2\""));
  }

  #[test]
  fn rewrite_unknown_service_errors() {
    assert!(set_image_tag(COMPOSE, "ghost", "1.0").is_err());
    assert!(set_image_tag(COMPOSE, "web", "bad tag").is_err());
    assert!(set_image_tag(COMPOSE, "web; rm", "1.0").is_err());
  }

  #[test]
  fn health_url_from_healthcheck() {
    let parsed: serde_yaml_ng::Value =
      serde_yaml_ng::from_str(COMPOSE).unwrap();
    let service = parsed.get("services").unwrap().get("web").unwrap();
    assert_eq!(
      extract_health_url(service, "web"),
      Some("http://web:8080/health".to_string())
    );
  }

  #[test]
  fn health_url_from_traefik_label() {
    let yaml = r#"
image: ghcr.io/owner/app:1.0
labels:
  - "traefik.http.routers.app.rule=Host(`app.example.com`)"
"#;
    let service: serde_yaml_ng::Value =
      serde_yaml_ng::from_str(yaml).unwrap();
    assert_eq!(
      extract_health_url(&service, "app"),
      Some("https://app.example.com".to_string())
    );
  }

  #[test]
  fn labels_read_from_both_shapes() {
    let list: serde_yaml_ng::Value =
      serde_yaml_ng::from_str("labels:\n  - a=1\n  - b=2")
        .unwrap();
    assert_eq!(service_labels(&list), vec!["a=1", "b=2"]);
    let map: serde_yaml_ng::Value =
      serde_yaml_ng::from_str("labels:\n  a: \"1\"\n  b: true")
        .unwrap();
    assert_eq!(service_labels(&map), vec!["a=1", "b=true"]);
  }

  #[test]
  fn host_path_translation() {
    let translated = translate_to_host_path(
      Path::new("/compose/media/plex.yml"),
      Path::new("/compose"),
      "/srv/raid0/docker/compose",
    )
    .unwrap();
    assert_eq!(
      translated,
      PathBuf::from("/srv/raid0/docker/compose/media/plex.yml")
    );
    // empty base means daemon shares the mount namespace
    let untouched = translate_to_host_path(
      Path::new("/compose/web.yml"),
      Path::new("/compose"),
      "",
    )
    .unwrap();
    assert_eq!(untouched, PathBuf::from("/compose/web.yml"));
  }

  #[tokio::test]
  async fn path_validation_rejects_traversal() {
    let base = std::env::temp_dir().join("tidewatch-compose-test");
    tokio::fs::create_dir_all(&base).await.unwrap();
    let file = base.join("web.yml");
    tokio::fs::write(&file, "services: {}\n").await.unwrap();

    let bases = vec![base.clone()];
    assert!(
      validate_compose_path(file.to_str().unwrap(), &bases)
        .is_ok()
    );
    for bad in [
      "/compose/../etc/passwd.yml",
      "/compose//web.yml",
      "/compose/web.txt",
      "/compose/web\\evil.yml",
    ] {
      assert!(
        validate_compose_path(bad, &bases).is_err(),
        "accepted: {bad}"
      );
    }
    // outside the allowed base
    let outside = std::env::temp_dir().join("outside.yml");
    tokio::fs::write(&outside, "services: {}\n").await.unwrap();
    assert!(
      validate_compose_path(outside.to_str().unwrap(), &bases)
        .is_err()
    );
  }

  #[tokio::test]
  async fn rewrite_backup_restore_cycle() {
    let dir = std::env::temp_dir().join("tidewatch-rewrite-test");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let file = dir.join("stack.yml");
    tokio::fs::write(&file, COMPOSE).await.unwrap();

    let backup_dir = dir.join("backups");
    let backup =
      backup_compose_file(&file, &backup_dir).await.unwrap();

    let previous =
      rewrite_compose_file(&file, "web", "1.25.3").await.unwrap();
    assert_eq!(previous, "nginx:1.25.0");
    let mutated =
      tokio::fs::read_to_string(&file).await.unwrap();
    assert!(mutated.contains("nginx:1.25.3"));

    restore_compose_file(&file, &backup).await.unwrap();
    let restored =
      tokio::fs::read_to_string(&file).await.unwrap();
    assert_eq!(restored, COMPOSE);
  }
}
