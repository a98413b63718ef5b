use std::fmt;

use serde::{Deserialize, Serialize};

use super::transport::CommandOutput;

/// Outcome of one command stage on a remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
  pub stage: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default)]
  pub return_code: i32,
  #[serde(default)]
  pub stdout: String,
  #[serde(default)]
  pub stderr: String,
}

impl StageResult {
  pub fn failed(stage: impl Into<String>, error: impl ToString) -> Self {
    Self {
      stage: stage.into(),
      error: Some(error.to_string()),
      ..Self::default()
    }
  }

  pub fn from_output(stage: impl Into<String>, output: CommandOutput) -> Self {
    let error = (output.exit_status != 0)
      .then(|| format!("Process exited with status {}", output.exit_status));
    Self {
      stage: stage.into(),
      error,
      return_code: output.exit_status as i32,
      stdout: output.stdout,
      stderr: output.stderr,
    }
  }

  pub fn is_success(&self) -> bool {
    self.error.is_none()
  }
}

impl fmt::Display for StageResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.error {
      Some(err) => write!(
        f,
        "Stage: {}, return code({}), error: {}, stderr: {}",
        self.stage, self.return_code, err, self.stderr
      ),
      None => write!(f, "Stage: complete, all stdout: {}", self.stdout),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn non_zero_exit_is_an_error() {
    let result = StageResult::from_output(
      "Command",
      CommandOutput { exit_status: 2, stdout: String::new(), stderr: "nope".into() },
    );
    assert_eq!(result.return_code, 2);
    assert_eq!(
      result.to_string(),
      "Stage: Command, return code(2), error: Process exited with status 2, stderr: nope"
    );
  }

  #[test]
  fn success_summary_shows_stdout() {
    let result = StageResult::from_output(
      "Command",
      CommandOutput { exit_status: 0, stdout: "up 3 days".into(), stderr: String::new() },
    );
    assert!(result.is_success());
    assert_eq!(result.to_string(), "Stage: complete, all stdout: up 3 days");
  }
}
