use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::delivery::DeliveryOptions;
use crate::models::SenderConfig;
use crate::ssh::ClientOptions;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: Option<String>,
  pub server_port: u16,
  pub queue_size: usize,
  pub cache_sweep: Duration,
  pub ssh: ClientOptions,
  pub smtp: SenderConfig,
  pub mail_max_retry: u32,
  pub mail_concurrency: usize,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    dotenvy::dotenv().ok();
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let number = |key: &str, default: u64| -> Result<u64> {
      match value(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
      }
    };

    let queue_size = number("QUEUE_SIZE", 128)? as usize;
    let sweep_minutes = number("CACHE_SWEEP_MINUTES", 30)?;
    anyhow::ensure!(sweep_minutes > 0, "CACHE_SWEEP_MINUTES must be at least 1");
    let (smtp_host, smtp_port) = split_server(&value("SMTP_SERVER").unwrap_or_else(|| "localhost:25".into()))?;

    Ok(Self {
      database_url: value("DATABASE_URL"),
      server_port: parse("SERVER_PORT", &value("SERVER_PORT").unwrap_or_else(|| "8080".into()))?,
      queue_size,
      cache_sweep: Duration::from_secs(sweep_minutes * 60),
      ssh: ClientOptions {
        connect_retries: number("SSH_CONNECT_RETRIES", 3)? as usize,
        retry_delay: Duration::from_secs(number("SSH_RETRY_DELAY_SECS", 3)?),
        stage_timeout: Duration::from_secs(number("SSH_STAGE_TIMEOUT_SECS", 60)?),
      },
      smtp: SenderConfig {
        host: smtp_host,
        port: smtp_port,
        username: value("SMTP_USERNAME").unwrap_or_default(),
        password: value("SMTP_PASSWORD").unwrap_or_default(),
        from_alias: value("SMTP_FROM").unwrap_or_else(|| "taskfleet".into()),
      },
      mail_max_retry: number("MAIL_MAX_RETRY", 3)? as u32,
      mail_concurrency: number("MAIL_CONCURRENCY", queue_size as u64)? as usize,
    })
  }

  pub fn delivery_options(&self) -> DeliveryOptions {
    DeliveryOptions {
      max_retry: self.mail_max_retry,
      concurrency: self.mail_concurrency,
      queue_size: self.queue_size,
    }
  }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  raw
    .trim()
    .parse()
    .with_context(|| format!("{key} has an invalid value `{raw}`"))
}

fn split_server(server: &str) -> Result<(String, u16)> {
  match server.rsplit_once(':') {
    Some((host, port)) => Ok((host.to_string(), parse("SMTP_SERVER", port)?)),
    None => Ok((server.to_string(), 25)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(pairs: &[(&str, &str)]) -> Result<Config> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup(|key| vars.get(key).cloned())
  }

  #[test]
  fn defaults_apply_when_unset() {
    let c = config(&[]).unwrap();
    assert_eq!(c.database_url, None);
    assert_eq!(c.server_port, 8080);
    assert_eq!(c.queue_size, 128);
    assert_eq!(c.cache_sweep, Duration::from_secs(30 * 60));
    assert_eq!(c.ssh.connect_retries, 3);
    assert_eq!(c.ssh.stage_timeout, Duration::from_secs(60));
    assert_eq!((c.smtp.host.as_str(), c.smtp.port), ("localhost", 25));
    assert_eq!(c.smtp.from_alias, "taskfleet");
    assert_eq!(c.mail_concurrency, 128);
  }

  #[test]
  fn overrides_are_parsed() {
    let c = config(&[
      ("DATABASE_URL", "postgres://fleet@db/fleet"),
      ("QUEUE_SIZE", "16"),
      ("SMTP_SERVER", "mail.internal"),
      ("SSH_RETRY_DELAY_SECS", "0"),
      ("MAIL_CONCURRENCY", "4"),
    ])
    .unwrap();
    assert_eq!(c.database_url.as_deref(), Some("postgres://fleet@db/fleet"));
    assert_eq!(c.queue_size, 16);
    assert_eq!((c.smtp.host.as_str(), c.smtp.port), ("mail.internal", 25));
    assert_eq!(c.ssh.retry_delay, Duration::ZERO);
    assert_eq!(c.delivery_options().concurrency, 4);
  }

  #[test]
  fn malformed_numbers_fail_startup() {
    let err = config(&[("SERVER_PORT", "http")]).unwrap_err();
    assert!(err.to_string().contains("SERVER_PORT"));
    assert!(config(&[("SMTP_SERVER", "mail:abc")]).is_err());
  }

  #[test]
  fn zero_sweep_interval_fails_startup() {
    let err = config(&[("CACHE_SWEEP_MINUTES", "0")]).unwrap_err();
    assert!(err.to_string().contains("CACHE_SWEEP_MINUTES"));
    assert_eq!(config(&[("CACHE_SWEEP_MINUTES", "1")]).unwrap().cache_sweep, Duration::from_secs(60));
  }
}
