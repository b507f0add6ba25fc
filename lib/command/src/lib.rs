use std::{process::Stdio, time::Duration};

use anyhow::{Context, anyhow};
use tidewatch_client::entities::{Log, tidewatch_timestamp};
use tokio::{io::AsyncReadExt, process::Command};

/// Characters that would let a configured command template escape
/// into the shell. Templates are parsed into argv and executed
/// directly, so these are rejected outright.
const INJECTION_CHARS: &[char] =
  &[';', '|', '&', '$', '`', '<', '>', '\n'];

/// Splits a configured command template (eg. `docker compose`,
/// `docker-compose`) into an argv prefix. Whitespace-separated
/// words only; anything shell-flavored is an error.
pub fn parse_command_template(
  template: &str,
) -> anyhow::Result<Vec<String>> {
  if template.contains(INJECTION_CHARS) {
    return Err(anyhow!(
      "Command template '{template}' contains shell control characters"
    ));
  }
  let argv = template
    .split_whitespace()
    .map(str::to_string)
    .collect::<Vec<_>>();
  if argv.is_empty() {
    return Err(anyhow!("Command template is empty"));
  }
  Ok(argv)
}

/// Runs an argv directly (no shell), capturing output into a [Log].
/// The process is killed if it outlives `timeout`.
pub async fn run_tidewatch_command(
  stage: &str,
  argv: &[String],
  envs: &[(String, String)],
  timeout: Duration,
) -> Log {
  let start_ts = tidewatch_timestamp();
  let command = argv.join(" ");
  match run_inner(argv, envs, timeout).await {
    Ok((success, stdout, stderr)) => Log {
      stage: stage.to_string(),
      command,
      stdout,
      stderr,
      success,
      start_ts,
      end_ts: tidewatch_timestamp(),
    },
    Err(e) => Log {
      stage: stage.to_string(),
      command,
      stdout: String::new(),
      stderr: format!("{e:#}"),
      success: false,
      start_ts,
      end_ts: tidewatch_timestamp(),
    },
  }
}

async fn run_inner(
  argv: &[String],
  envs: &[(String, String)],
  timeout: Duration,
) -> anyhow::Result<(bool, String, String)> {
  let (program, args) = argv
    .split_first()
    .context("cannot run empty command")?;

  let mut command = Command::new(program);
  command
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  for (key, value) in envs {
    command.env(key, value);
  }

  let mut child = command
    .spawn()
    .with_context(|| format!("failed to spawn '{program}'"))?;

  let mut stdout_pipe =
    child.stdout.take().context("child stdout not piped")?;
  let mut stderr_pipe =
    child.stderr.take().context("child stderr not piped")?;

  let mut stdout = String::new();
  let mut stderr = String::new();

  let wait = async {
    let (_, _, status) = tokio::join!(
      stdout_pipe.read_to_string(&mut stdout),
      stderr_pipe.read_to_string(&mut stderr),
      child.wait(),
    );
    status
  };

  let status = match tokio::time::timeout(timeout, wait).await {
    Ok(status) => status.context("failed to wait on child")?,
    Err(_) => {
      // kill_on_drop reaps the child when `child` goes out of scope
      return Err(anyhow!(
        "command timed out after {} seconds",
        timeout.as_secs()
      ));
    }
  };

  Ok((status.success(), stdout, stderr))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn template_splits_into_argv() {
    assert_eq!(
      parse_command_template("docker compose").unwrap(),
      vec!["docker".to_string(), "compose".to_string()]
    );
    assert_eq!(
      parse_command_template("docker-compose").unwrap(),
      vec!["docker-compose".to_string()]
    );
  }

  #[test]
  fn template_rejects_shell_control_characters() {
    for template in [
      "docker compose; rm -rf /",
      "docker compose | tee",
      "docker compose && true",
      "docker $(compose)",
      "docker `compose`",
      "docker > /dev/null",
      "docker\ncompose",
    ] {
      assert!(
        parse_command_template(template).is_err(),
        "accepted: {template}"
      );
    }
  }

  #[test]
  fn template_rejects_empty() {
    assert!(parse_command_template("   ").is_err());
  }

  #[tokio::test]
  async fn runs_argv_and_captures_output() {
    let argv = vec!["echo".to_string(), "hello".to_string()];
    let log = run_tidewatch_command(
      "Test",
      &argv,
      &[],
      Duration::from_secs(5),
    )
    .await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "hello");
    assert_eq!(log.stage, "Test");
  }

  #[tokio::test]
  async fn reports_timeout_as_failure() {
    let argv = vec!["sleep".to_string(), "5".to_string()];
    let log = run_tidewatch_command(
      "Test",
      &argv,
      &[],
      Duration::from_millis(50),
    )
    .await;
    assert!(!log.success);
    assert!(log.stderr.contains("timed out"));
  }
}
