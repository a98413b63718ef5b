use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ssh::StageResult;
use crate::store::{Entity, IndexField};

/// One labeled command within a task's command sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
  pub label: String,
  pub command: String,
}

impl Stage {
  pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      command: command.into(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  #[serde(default)]
  pub id: u64,
  pub name: String,
  pub uuid: Uuid,
  #[serde(default)]
  pub owner_id: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pre_script: Option<String>,
  pub command: Vec<Stage>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_script: Option<String>,
  pub created: DateTime<Utc>,
  #[serde(default)]
  pub done: Option<DateTime<Utc>>,
  /// Six-field cron expression; empty means run once.
  #[serde(default)]
  pub spec: String,
  #[serde(default)]
  pub comment: String,
  #[serde(default)]
  pub required_approval: bool,
  #[serde(default)]
  pub suspended: bool,
  #[serde(default)]
  pub hosts: Vec<String>,
}

impl Task {
  pub fn is_scheduled(&self) -> bool {
    !self.spec.is_empty()
  }

  pub fn is_finished(&self) -> bool {
    self.done.is_some()
  }

  /// Full stage sequence: pre-script, module stages, post-script.
  pub fn stages(&self) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(self.command.len() + 2);
    if let Some(pre) = self.pre_script.as_deref().filter(|s| !s.is_empty()) {
      stages.push(Stage::new("PreScript", pre));
    }
    stages.extend(self.command.iter().cloned());
    if let Some(post) = self.post_script.as_deref().filter(|s| !s.is_empty()) {
      stages.push(Stage::new("PostScript", post));
    }
    stages
  }
}

impl Entity for Task {
  const BUCKET: &'static str = "tasks";

  fn id(&self) -> u64 {
    self.id
  }

  fn set_id(&mut self, id: u64) {
    self.id = id;
  }

  fn indexed(&self, field: IndexField) -> Option<String> {
    match field {
      IndexField::Name => Some(self.name.clone()),
      IndexField::Uuid => Some(self.uuid.to_string()),
      IndexField::Hostname => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronKind {
  #[serde(alias = "url")]
  Http,
  #[serde(alias = "cmd", alias = "command")]
  Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
  #[serde(default)]
  pub id: u64,
  pub name: String,
  #[serde(rename = "type")]
  pub kind: CronKind,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub cmd: Vec<String>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub url: String,
  pub spec: String,
  #[serde(default)]
  pub suspended: bool,
  #[serde(default)]
  pub running: bool,
  #[serde(default)]
  pub times: u32,
  #[serde(default = "Utc::now")]
  pub created: DateTime<Utc>,
  #[serde(default = "Utc::now")]
  pub updated: DateTime<Utc>,
  #[serde(skip)]
  pub last_error: Option<String>,
  #[serde(skip)]
  pub last_output: Option<String>,
  #[serde(skip)]
  pub failures: u32,
}

impl CronJob {
  pub fn attempts(&self) -> u32 {
    self.times.max(1)
  }

  pub(crate) fn record_failure(&mut self, error: String) {
    self.last_error = Some(error);
    self.failures += 1;
  }

  pub(crate) fn record_success(&mut self, output: String) {
    self.last_output = Some(output);
    self.last_error = None;
    self.failures = 0;
  }
}

impl Entity for CronJob {
  const BUCKET: &'static str = "crons";

  fn id(&self) -> u64 {
    self.id
  }

  fn set_id(&mut self, id: u64) {
    self.id = id;
  }

  fn indexed(&self, field: IndexField) -> Option<String> {
    match field {
      IndexField::Name => Some(self.name.clone()),
      _ => None,
    }
  }
}

/// Transient view of a live cron registration, diagnostics included.
#[derive(Debug, Clone, Serialize)]
pub struct CronStatus {
  #[serde(flatten)]
  pub job: CronJob,
  pub last_error: Option<String>,
  pub last_output: Option<String>,
  pub consecutive_failures: u32,
}

impl From<CronJob> for CronStatus {
  fn from(job: CronJob) -> Self {
    Self {
      last_error: job.last_error.clone(),
      last_output: job.last_output.clone(),
      consecutive_failures: job.failures,
      job,
    }
  }
}

fn default_ssh_port() -> u16 {
  22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
  #[serde(default)]
  pub id: u64,
  pub hostname: String,
  #[serde(default)]
  pub username: String,
  #[serde(default = "default_ssh_port")]
  pub port: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub identity_file: Option<PathBuf>,
  #[serde(default)]
  pub hostgroup_id: u64,
  #[serde(default)]
  pub comment: String,
  #[serde(default)]
  pub is_active: bool,
}

impl Entity for Host {
  const BUCKET: &'static str = "hosts";

  fn id(&self) -> u64 {
    self.id
  }

  fn set_id(&mut self, id: u64) {
    self.id = id;
  }

  fn indexed(&self, field: IndexField) -> Option<String> {
    match field {
      IndexField::Hostname => Some(self.hostname.clone()),
      _ => None,
    }
  }
}

/// What happened on one host during a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
  NotFound,
  Inactive,
  Failed { error: String },
  Finished(StageResult),
}

impl HostOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, HostOutcome::Finished(result) if result.error.is_none())
  }
}

impl fmt::Display for HostOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HostOutcome::NotFound => f.write_str("Host not found"),
      HostOutcome::Inactive => f.write_str("Host is inactive"),
      HostOutcome::Failed { error } => f.write_str(error),
      HostOutcome::Finished(result) => result.fmt(f),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
  pub task_id: u64,
  pub task_uuid: Uuid,
  pub task_name: String,
  pub done: DateTime<Utc>,
  pub result: BTreeMap<String, HostOutcome>,
}

/// Sender settings overriding the configured default relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
  pub host: String,
  #[serde(default = "default_smtp_port")]
  pub port: u16,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub password: String,
  #[serde(default)]
  pub from_alias: String,
}

fn default_smtp_port() -> u16 {
  25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
  #[serde(default)]
  pub id: u64,
  #[serde(default = "Uuid::new_v4")]
  pub uuid: Uuid,
  #[serde(default)]
  pub from_user_id: u64,
  #[serde(default, skip_serializing)]
  pub sender: Option<SenderConfig>,
  pub subject: String,
  pub content: String,
  /// Comma-separated recipient list.
  pub tos: String,
  #[serde(default = "Utc::now")]
  pub created: DateTime<Utc>,
  #[serde(default)]
  pub done: Option<DateTime<Utc>>,
  #[serde(default)]
  pub error: Option<String>,
}

impl OutboundMessage {
  pub fn recipients(&self) -> Vec<String> {
    self
      .tos
      .split(',')
      .map(str::trim)
      .filter(|to| !to.is_empty())
      .map(str::to_string)
      .collect()
  }
}

impl Entity for OutboundMessage {
  const BUCKET: &'static str = "emails";

  fn id(&self) -> u64 {
    self.id
  }

  fn set_id(&mut self, id: u64) {
    self.id = id;
  }

  fn indexed(&self, field: IndexField) -> Option<String> {
    match field {
      IndexField::Uuid => Some(self.uuid.to_string()),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task() -> Task {
    Task {
      id: 0,
      name: "deploy".into(),
      uuid: Uuid::new_v4(),
      owner_id: 1,
      pre_script: Some("echo pre".into()),
      command: vec![Stage::new("Command", "uptime")],
      post_script: None,
      created: Utc::now(),
      done: None,
      spec: String::new(),
      comment: String::new(),
      required_approval: false,
      suspended: false,
      hosts: vec![],
    }
  }

  #[test]
  fn stages_wrap_module_commands() {
    let mut t = task();
    t.post_script = Some("echo post".into());
    let labels: Vec<_> = t.stages().into_iter().map(|s| s.label).collect();
    assert_eq!(labels, vec!["PreScript", "Command", "PostScript"]);
  }

  #[test]
  fn empty_scripts_are_not_stages() {
    let mut t = task();
    t.pre_script = Some(String::new());
    assert_eq!(t.stages().len(), 1);
  }

  #[test]
  fn cron_diagnostics_are_not_serialized() {
    let mut job: CronJob = serde_json::from_value(serde_json::json!({
      "name": "probe",
      "type": "url",
      "url": "http://localhost",
      "spec": "0 * * * * *"
    }))
    .unwrap();
    assert_eq!(job.kind, CronKind::Http);
    assert_eq!(job.attempts(), 1);
    job.record_failure("boom".into());
    let value = serde_json::to_value(&job).unwrap();
    assert!(value.get("last_error").is_none());
    let back: CronJob = serde_json::from_value(value).unwrap();
    assert!(back.last_error.is_none());
    assert_eq!(back.failures, 0);
  }

  #[test]
  fn cron_kind_accepts_aliases() {
    for (raw, kind) in [("cmd", CronKind::Shell), ("command", CronKind::Shell), ("shell", CronKind::Shell), ("http", CronKind::Http)] {
      let parsed: CronKind = serde_json::from_value(serde_json::json!(raw)).unwrap();
      assert_eq!(parsed, kind);
    }
  }

  #[test]
  fn recipients_split_on_commas() {
    let msg: OutboundMessage = serde_json::from_value(serde_json::json!({
      "subject": "s", "content": "c", "tos": "a@x.io, b@x.io,,"
    }))
    .unwrap();
    assert_eq!(msg.recipients(), vec!["a@x.io", "b@x.io"]);
  }
}
