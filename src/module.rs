//! Turns structured job descriptions into ordered command stages.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Stage;

#[derive(Debug, Error)]
pub enum ModuleError {
  #[error("module `{0}` is not implemented yet")]
  Unknown(String),

  #[error("invalid `{module}` payload: {source}")]
  InvalidPayload {
    module: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("command is not allowed")]
  DangerousCommand,

  #[error("{0}")]
  Invalid(String),
}

pub trait Module: Send {
  fn name(&self) -> &'static str;
  fn build(&self) -> Result<Vec<Stage>, ModuleError>;
}

static SAFE_WORD: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").expect("valid safe-word pattern"));

static DANGER_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\b(rm|dd|reboot|halt|init|shutdown)\b").expect("valid danger-command pattern")
});

/// Quotes `word` for a POSIX shell unless it is already safe.
pub fn shell_escape(word: &str) -> String {
  if SAFE_WORD.is_match(word) {
    return word.to_string();
  }
  format!("'{}'", word.replace('\'', r"'\''"))
}

/// A command line plus the environment it runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCommand {
  pub environment: Vec<String>,
  pub command: String,
  pub arguments: Vec<String>,
}

impl ExecCommand {
  fn command_line(&self) -> String {
    std::iter::once(self.command.clone())
      .chain(self.arguments.iter().map(|a| shell_escape(a)))
      .collect::<Vec<_>>()
      .join(" ")
  }

  pub fn script(&self) -> String {
    let mut script = String::new();
    for var in &self.environment {
      script.push_str("export ");
      script.push_str(&shell_escape(var));
      script.push('\n');
    }
    script.push_str(&self.command_line());
    script
  }

  pub fn into_stages(self) -> Vec<Stage> {
    vec![Stage::new("Command", self.script())]
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Shell {
  #[serde(default)]
  pub environment: Vec<String>,
  pub command: String,
  #[serde(default)]
  pub filter: bool,
}

impl Module for Shell {
  fn name(&self) -> &'static str {
    "shell"
  }

  fn build(&self) -> Result<Vec<Stage>, ModuleError> {
    if self.command.trim().is_empty() {
      return Err(ModuleError::Invalid("shell command must not be empty".into()));
    }
    if self.filter && DANGER_COMMAND.is_match(&self.command) {
      return Err(ModuleError::DangerousCommand);
    }
    Ok(
      ExecCommand {
        environment: self.environment.clone(),
        command: self.command.clone(),
        arguments: vec![],
      }
      .into_stages(),
    )
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvnEvent {
  #[default]
  Info,
  Log,
  Checkout,
  Export,
  Switch,
  Update,
  Revert,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subversion {
  #[serde(default)]
  pub environment: Vec<String>,
  #[serde(default)]
  pub dest: String,
  #[serde(default)]
  pub repo: String,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub password: String,
  #[serde(default)]
  pub svn_path: String,
  #[serde(default)]
  pub revision: String,
  #[serde(default)]
  pub force: bool,
  #[serde(default)]
  pub event: SvnEvent,
}

fn or_default(value: &str, fallback: &str) -> String {
  if value.is_empty() { fallback.to_string() } else { value.to_string() }
}

impl Module for Subversion {
  fn name(&self) -> &'static str {
    "subversion"
  }

  fn build(&self) -> Result<Vec<Stage>, ModuleError> {
    if self.dest.is_empty() {
      return Err(ModuleError::Invalid("subversion dest must not be empty".into()));
    }
    let revision = or_default(&self.revision, "HEAD");
    let mut args: Vec<String> = ["--non-interactive", "--trust-server-cert", "--no-auth-cache"]
      .map(String::from)
      .to_vec();
    if !self.username.is_empty() {
      args.extend(["--username".into(), self.username.clone()]);
    }
    if !self.password.is_empty() {
      args.extend(["--password".into(), self.password.clone()]);
    }
    let dest = self.dest.clone();
    let repo = self.repo.clone();
    match self.event {
      SvnEvent::Info => args.extend(["info".into(), dest]),
      SvnEvent::Log => args.extend(["log".into(), dest, "-r".into(), revision]),
      SvnEvent::Checkout => args.extend(["checkout".into(), "-r".into(), revision, repo, dest]),
      SvnEvent::Export => {
        args.push("export".into());
        if self.force {
          args.push("--force".into());
        }
        args.extend(["-r".into(), revision, repo, dest]);
      }
      SvnEvent::Switch => args.extend(["switch".into(), repo, dest]),
      SvnEvent::Update => args.extend(["update".into(), "-r".into(), revision, dest]),
      SvnEvent::Revert => args.extend(["revert".into(), "-R".into(), dest]),
    }
    Ok(
      ExecCommand {
        environment: self.environment.clone(),
        command: or_default(&self.svn_path, "/usr/bin/svn"),
        arguments: args,
      }
      .into_stages(),
    )
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitEvent {
  #[default]
  Clone,
  Pull,
  Checkout,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Git {
  #[serde(default)]
  pub environment: Vec<String>,
  #[serde(default)]
  pub dest: String,
  #[serde(default)]
  pub repo: String,
  #[serde(default)]
  pub git_path: String,
  #[serde(default)]
  pub revision: String,
  #[serde(default)]
  pub force: bool,
  #[serde(default)]
  pub event: GitEvent,
}

impl Module for Git {
  fn name(&self) -> &'static str {
    "git"
  }

  fn build(&self) -> Result<Vec<Stage>, ModuleError> {
    if self.dest.is_empty() {
      return Err(ModuleError::Invalid("git dest must not be empty".into()));
    }
    let dest = self.dest.clone();
    let arguments = match self.event {
      GitEvent::Clone => {
        if self.repo.is_empty() {
          return Err(ModuleError::Invalid("git clone requires a repo".into()));
        }
        vec!["clone".into(), self.repo.clone(), dest]
      }
      GitEvent::Pull => vec!["-C".into(), dest, "pull".into()],
      GitEvent::Checkout => {
        let mut args = vec!["-C".into(), dest, "checkout".into()];
        if self.force {
          args.push("--force".into());
        }
        args.push(or_default(&self.revision, "HEAD"));
        args
      }
    };
    Ok(
      ExecCommand {
        environment: self.environment.clone(),
        command: or_default(&self.git_path, "/usr/bin/git"),
        arguments,
      }
      .into_stages(),
    )
  }
}

type Builder = fn(serde_json::Value) -> Result<Box<dyn Module>, serde_json::Error>;

fn decode<M: Module + DeserializeOwned + 'static>(
  payload: serde_json::Value,
) -> Result<Box<dyn Module>, serde_json::Error> {
  Ok(Box::new(serde_json::from_value::<M>(payload)?))
}

/// Module builders keyed by lower-cased type name.
pub struct ModuleRegistry {
  builders: HashMap<String, Builder>,
}

impl ModuleRegistry {
  pub fn empty() -> Self {
    Self {
      builders: HashMap::new(),
    }
  }

  pub fn with_builtins() -> Self {
    let mut registry = Self::empty();
    registry.register("shell", decode::<Shell>);
    registry.register("subversion", decode::<Subversion>);
    registry.register("git", decode::<Git>);
    registry
  }

  pub fn register(&mut self, name: &str, builder: Builder) {
    self.builders.insert(name.to_lowercase(), builder);
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<_> = self.builders.keys().cloned().collect();
    names.sort();
    names
  }

  pub fn build(&self, kind: &str, payload: serde_json::Value) -> Result<Vec<Stage>, ModuleError> {
    let kind = kind.to_lowercase();
    let builder = self
      .builders
      .get(&kind)
      .ok_or_else(|| ModuleError::Unknown(kind.clone()))?;
    let module = builder(payload).map_err(|source| ModuleError::InvalidPayload { module: kind, source })?;
    module.build()
  }
}

impl Default for ModuleRegistry {
  fn default() -> Self {
    Self::with_builtins()
  }
}
