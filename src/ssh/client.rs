use std::fs::Metadata;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{info, warn};

use super::result::StageResult;
use super::transport::{Connection, Connector, Input, RemoteError};
use crate::models::{Host, Stage};

const DEFAULT_CONNECT_RETRIES: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
  pub connect_retries: usize,
  pub retry_delay: Duration,
  pub stage_timeout: Duration,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      connect_retries: DEFAULT_CONNECT_RETRIES,
      retry_delay: DEFAULT_RETRY_DELAY,
      stage_timeout: DEFAULT_STAGE_TIMEOUT,
    }
  }
}

/// Remote shell client bound to a single host.
pub struct RemoteClient {
  host: Host,
  connector: Arc<dyn Connector>,
  options: ClientOptions,
  connection: Option<Box<dyn Connection>>,
}

impl RemoteClient {
  pub fn new(host: Host, connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
    Self {
      host,
      connector,
      options,
      connection: None,
    }
  }

  pub fn is_connected(&self) -> bool {
    self.connection.is_some()
  }

  /// Dials the host, retrying with a fixed delay. Returns the last error once
  /// every attempt has failed.
  pub async fn connect(&mut self) -> Result<(), RemoteError> {
    let retries = self.options.connect_retries.max(1) - 1;
    let strategy = FixedInterval::new(self.options.retry_delay).take(retries);
    let host = &self.host;
    let connector = &self.connector;
    let connection = Retry::spawn(strategy, || async move {
      connector.connect(host).await.inspect_err(|e| {
        warn!(host = %host.hostname, error = %e, "Connect attempt failed");
      })
    })
    .await?;
    self.connection = Some(connection);
    Ok(())
  }

  /// Runs `stages` in order, each in its own session and under the stage
  /// timeout. Stops at the first failing stage.
  pub async fn run(&self, stages: &[Stage]) -> StageResult {
    let Some(connection) = self.connection.as_deref() else {
      return StageResult::failed("Connect", RemoteError::NotConnected);
    };
    let mut last = StageResult::default();
    for stage in stages {
      let exec = connection.exec(&stage.command, None);
      last = match tokio::time::timeout(self.options.stage_timeout, exec).await {
        Err(_) => {
          warn!(host = %self.host.hostname, stage = %stage.label, "Stage timed out");
          return StageResult::failed("Runtime", "Execution timed out");
        }
        Ok(Err(e)) => return StageResult::failed(&stage.label, e),
        Ok(Ok(output)) => StageResult::from_output(&stage.label, output),
      };
      if !last.is_success() {
        return last;
      }
    }
    last
  }

  /// Streams a local file into `dest` on the host over the scp protocol.
  pub async fn scp(&self, file: &Path, dest: &str) -> Result<(), RemoteError> {
    let connection = self.connection.as_deref().ok_or(RemoteError::NotConnected)?;
    let name = file
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| RemoteError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "file has no name")))?;
    let source = File::open(file).await?;
    let metadata = source.metadata().await?;

    let header = format!("C{:04o} {} {}\n", file_mode(&metadata), metadata.len(), name).into_bytes();
    let input: Input = Box::new(Cursor::new(header).chain(source).chain(&b"\0"[..]));

    let output = connection.exec(&format!("scp -qt {dest}"), Some(input)).await?;
    if output.exit_status != 0 {
      return Err(RemoteError::Channel(format!(
        "scp exited with status {}: {}",
        output.exit_status,
        output.stderr.trim()
      )));
    }
    info!(host = %self.host.hostname, file = %file.display(), dest, "File transferred");
    Ok(())
  }

  /// Closes the connection, if one was made.
  pub async fn cleanup(&mut self) {
    if let Some(connection) = self.connection.take() {
      connection.close().await;
    }
  }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &Metadata) -> u32 {
  0o644
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ssh::testing::{FakeConnector, Reply, host};
  use std::io::Write;

  fn options() -> ClientOptions {
    ClientOptions {
      connect_retries: 3,
      retry_delay: Duration::from_secs(3),
      stage_timeout: Duration::from_secs(60),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn connect_retries_then_succeeds() {
    let connector = Arc::new(FakeConnector::new().failing_connects(2));
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(connector.connect_attempts(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn connect_returns_last_error() {
    let connector = Arc::new(FakeConnector::new().failing_connects(5));
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, RemoteError::Connect(msg) if msg.contains("attempt 3")));
    assert_eq!(connector.connect_attempts(), 3);
    client.cleanup().await;
  }

  #[tokio::test]
  async fn failing_stage_stops_the_sequence() {
    let connector = Arc::new(
      FakeConnector::new()
        .reply("false", Reply::exit(1, "", "boom"))
        .reply("echo second", Reply::ok("second")),
    );
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    client.connect().await.unwrap();
    let result = client
      .run(&[Stage::new("First", "false"), Stage::new("Second", "echo second")])
      .await;
    assert_eq!(result.stage, "First");
    assert_eq!(result.return_code, 1);
    assert_eq!(connector.executed(), vec!["false"]);
  }

  #[tokio::test]
  async fn success_reports_final_stage_only() {
    let connector = Arc::new(
      FakeConnector::new()
        .reply("echo one", Reply::ok("one"))
        .reply("echo two", Reply::ok("two")),
    );
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    client.connect().await.unwrap();
    let result = client
      .run(&[Stage::new("PreScript", "echo one"), Stage::new("Command", "echo two")])
      .await;
    assert!(result.is_success());
    assert_eq!(result.stage, "Command");
    assert_eq!(result.stdout, "two");
  }

  #[tokio::test(start_paused = true)]
  async fn slow_stage_times_out() {
    let connector = Arc::new(
      FakeConnector::new()
        .reply("sleep 999", Reply::Hang)
        .reply("echo after", Reply::ok("after")),
    );
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    client.connect().await.unwrap();
    let result = client
      .run(&[Stage::new("Command", "sleep 999"), Stage::new("PostScript", "echo after")])
      .await;
    assert_eq!(result.stage, "Runtime");
    assert_eq!(result.error.as_deref(), Some("Execution timed out"));
    assert_eq!(connector.executed(), vec!["sleep 999"]);
  }

  #[tokio::test]
  async fn run_without_connect_fails() {
    let client = RemoteClient::new(host("web-1"), Arc::new(FakeConnector::new()), options());
    let result = client.run(&[Stage::new("Command", "uptime")]).await;
    assert_eq!(result.error.as_deref(), Some("not connected"));
  }

  #[tokio::test]
  async fn cleanup_is_safe_without_connection() {
    let mut client = RemoteClient::new(host("web-1"), Arc::new(FakeConnector::new()), options());
    client.cleanup().await;
    client.cleanup().await;
    assert!(!client.is_connected());
  }

  #[tokio::test]
  async fn scp_streams_header_payload_and_terminator() {
    let mut file = tempfile::Builder::new().prefix("payload").tempfile().unwrap();
    file.write_all(b"hello").unwrap();
    let name = file.path().file_name().unwrap().to_str().unwrap().to_string();

    let connector = Arc::new(FakeConnector::new().reply("scp -qt /tmp", Reply::ok("")));
    let mut client = RemoteClient::new(host("web-1"), connector.clone(), options());
    client.connect().await.unwrap();
    client.scp(file.path(), "/tmp").await.unwrap();

    let input = connector.last_stdin().unwrap();
    let header = format!(" 5 {name}\n");
    assert!(input.starts_with(b"C0"));
    let text = String::from_utf8_lossy(&input).into_owned();
    assert!(text.contains(&header));
    assert!(input.ends_with(b"hello\0"));
  }
}
