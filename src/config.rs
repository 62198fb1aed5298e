//! YAML configuration. Every field has a default, so an empty file (or none
//! at all) yields a usable configuration.
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteSettings,
    pub credentials: Credentials,
    pub session: SessionSettings,
    pub scheduler: SchedulerSettings,
    pub store: StoreSettings,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;

        Self::parse(&text).map_err(|source| ConfigError::Yaml {
            path: display,
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}

/// Where the remote service lives.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub host: String,
    pub port: u16,
    /// Local UDP port. The service identifies clients by address and port,
    /// so this should stay fixed across restarts.
    pub local_port: u16,
    pub request_timeout_secs: u64,
}

impl RemoteSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            host: "api.anidb.net".to_owned(),
            port: 9000,
            local_port: 4556,
            request_timeout_secs: 20,
        }
    }
}

#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

// Keeps the password out of debug logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub client: String,
    pub client_version: u32,
    /// Minimum spacing between two requests. `null` disables pacing.
    pub request_interval_ms: Option<u64>,
    /// Send `PING` after this long without any request.
    pub ping_interval_secs: u64,
    /// Log out after this long without a non-ping request.
    pub idle_logout_secs: u64,
    /// Cooldown applied on server-busy style replies.
    pub busy_backoff_secs: u64,
    /// Lift a ban automatically this long after it started. `null` means only
    /// an operator can lift it.
    pub ban_cooldown_secs: Option<u64>,
    pub maintenance_tick_secs: u64,
}

impl SessionSettings {
    pub fn request_interval(&self) -> Option<Duration> {
        self.request_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_logout(&self) -> Duration {
        Duration::from_secs(self.idle_logout_secs)
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_secs(self.busy_backoff_secs)
    }

    pub fn ban_cooldown(&self) -> Option<Duration> {
        self.ban_cooldown_secs.map(Duration::from_secs)
    }

    pub fn maintenance_tick(&self) -> Duration {
        Duration::from_secs(self.maintenance_tick_secs.max(1))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            client: "enrichd".to_owned(),
            client_version: 1,
            request_interval_ms: Some(2200),
            ping_interval_secs: 45,
            idle_logout_secs: 300,
            busy_backoff_secs: 300,
            ban_cooldown_secs: Some(90 * 60),
            maintenance_tick_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    /// Attempts allowed for job-declared retryable errors. `null` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl SchedulerSettings {
    /// `retry_base * 2^(attempt-1)`, capped at `retry_max`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let secs = self
            .retry_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_secs);
        Duration::from_secs(secs)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_base_secs: 30,
            retry_max_secs: 60 * 60,
            max_attempts: Some(10),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Enables write-ahead logging and sets the directory to store WAL files
    /// in. Without it, jobs live in memory only.
    pub wal_dir: Option<PathBuf>,
    /// Rewrite the log once this many entries were appended to it.
    pub compact_after: u64,
    pub fsync: bool,
    /// How many dropped-job reports to keep.
    pub dropped_history: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            wal_dir: None,
            compact_after: 10_000,
            fsync: true,
            dropped_history: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.remote.port, 9000);
        assert_eq!(config.session.busy_backoff(), Duration::from_secs(300));
        assert_eq!(
            config.session.request_interval(),
            Some(Duration::from_millis(2200))
        );
        assert!(config.store.wal_dir.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            "
credentials:
  username: alice
  password: secret
session:
  request_interval_ms: null
  ban_cooldown_secs: null
store:
  wal_dir: /var/lib/enrichd
",
        )
        .unwrap();

        assert!(config.credentials.is_complete());
        assert_eq!(config.session.request_interval(), None);
        assert_eq!(config.session.ban_cooldown(), None);
        assert_eq!(config.session.ping_interval_secs, 45);
        assert_eq!(
            config.store.wal_dir.as_deref(),
            Some(Path::new("/var/lib/enrichd"))
        );
        assert!(!format!("{:?}", config.credentials).contains("secret"));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let s = SchedulerSettings::default();
        assert_eq!(s.retry_delay(1), Duration::from_secs(30));
        assert_eq!(s.retry_delay(2), Duration::from_secs(60));
        assert_eq!(s.retry_delay(3), Duration::from_secs(120));
        assert_eq!(s.retry_delay(20), Duration::from_secs(3600));
        assert_eq!(s.retry_delay(u32::MAX), Duration::from_secs(3600));
    }
}
