use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::models::Host;

#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("not connected")]
  NotConnected,

  #[error("connect failed: {0}")]
  Connect(String),

  #[error("authentication failed: {0}")]
  Auth(String),

  #[error("channel error: {0}")]
  Channel(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  pub exit_status: u32,
  pub stdout: String,
  pub stderr: String,
}

/// Opens authenticated connections to hosts.
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, RemoteError>;
}

/// Byte stream fed to a remote command's stdin.
pub type Input = Box<dyn AsyncRead + Send + Unpin>;

/// An established connection. Every `exec` runs in a fresh session.
#[async_trait]
pub trait Connection: Send + Sync {
  async fn exec(&self, command: &str, stdin: Option<Input>) -> Result<CommandOutput, RemoteError>;
  async fn close(&self);
}

struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
  type Error = russh::Error;

  async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
    Ok(true)
  }
}

pub struct SshConnector {
  config: Arc<client::Config>,
}

impl SshConnector {
  pub fn new() -> Self {
    Self {
      config: Arc::new(client::Config {
        inactivity_timeout: Some(Duration::from_secs(300)),
        ..Default::default()
      }),
    }
  }
}

impl Default for SshConnector {
  fn default() -> Self {
    Self::new()
  }
}

fn default_identity_file() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_default()
    .join(".ssh")
    .join("id_rsa")
}

fn auth_error(err: impl ToString) -> RemoteError {
  RemoteError::Auth(err.to_string())
}

fn channel_error(err: russh::Error) -> RemoteError {
  RemoteError::Channel(err.to_string())
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut Handle<AcceptingHandler>, user: &str) -> bool {
  let Ok(mut agent) = russh_keys::agent::client::AgentClient::connect_env().await else {
    return false;
  };
  let identities = agent.request_identities().await.unwrap_or_default();
  for identity in identities {
    let (returned, accepted) = handle.authenticate_future(user, identity, agent).await;
    agent = returned;
    if matches!(accepted, Ok(true)) {
      return true;
    }
  }
  false
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut Handle<AcceptingHandler>, _user: &str) -> bool {
  false
}

// Password first, then agent identities, then the identity file.
async fn authenticate(handle: &mut Handle<AcceptingHandler>, host: &Host) -> Result<(), RemoteError> {
  let user = host.username.clone();

  if let Some(password) = host.password.as_deref().filter(|p| !p.is_empty()) {
    if handle.authenticate_password(user.clone(), password).await.map_err(auth_error)? {
      return Ok(());
    }
  }

  if authenticate_with_agent(handle, &user).await {
    return Ok(());
  }

  let path = host.identity_file.clone().unwrap_or_else(default_identity_file);
  let key = russh_keys::load_secret_key(&path, None)
    .map_err(|e| RemoteError::Auth(format!("{}: {e}", path.display())))?;
  if handle.authenticate_publickey(user, Arc::new(key)).await.map_err(auth_error)? {
    return Ok(());
  }
  Err(RemoteError::Auth(format!("all methods rejected for user `{}`", host.username)))
}

#[async_trait]
impl Connector for SshConnector {
  async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, RemoteError> {
    let mut handle = client::connect(
      Arc::clone(&self.config),
      (host.hostname.as_str(), host.port),
      AcceptingHandler,
    )
    .await
    .map_err(|e| RemoteError::Connect(e.to_string()))?;
    authenticate(&mut handle, host).await?;
    debug!(host = %host.hostname, "SSH session established");
    Ok(Box::new(SshConnection { handle }))
  }
}

struct SshConnection {
  handle: Handle<AcceptingHandler>,
}

#[async_trait]
impl Connection for SshConnection {
  async fn exec(&self, command: &str, stdin: Option<Input>) -> Result<CommandOutput, RemoteError> {
    let mut channel = self.handle.channel_open_session().await.map_err(channel_error)?;
    channel.exec(true, command).await.map_err(channel_error)?;
    if let Some(input) = stdin {
      channel.data(input).await.map_err(channel_error)?;
      channel.eof().await.map_err(channel_error)?;
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
      match msg {
        ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
        ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
        ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
        _ => {}
      }
    }

    let exit_status = exit_status
      .ok_or_else(|| RemoteError::Channel(format!("no exit status for `{command}`")))?;
    Ok(CommandOutput {
      exit_status,
      stdout: String::from_utf8_lossy(&stdout).into_owned(),
      stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
  }

  async fn close(&self) {
    if let Err(e) = self.handle.disconnect(Disconnect::ByApplication, "", "English").await {
      debug!(error = %e, "SSH disconnect failed");
    }
  }
}
