use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::IdentityKey;
use crate::error::ConfigError;
use crate::monitor::MonitorConfig;
use crate::transport::telegram::DEFAULT_API_URL;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovpn-watch/config.toml";
pub const DEFAULT_ENV_FILE: &str = ".env";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_SAMPLE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LONG_POLL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 10;

/// Environment variables that override the file, named as the bot always has.
pub const ENV_STATUS_FILE: &str = "OPENVPN_STATUS_LOG_FILE";
pub const ENV_TOKEN: &str = "TOKEN";
pub const ENV_WHITELIST: &str = "WHITELIST";

/// Root configuration structure, as deserialized from the TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    /// Path of the file written by OpenVPN's `--status` option.
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub identity_key: IdentityKey,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Wait after a failed sample. Must exceed `poll_interval_secs`.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_secs: u64,
    /// Keep polling while nobody is subscribed.
    #[serde(default = "default_true")]
    pub idle_polling: bool,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: None,
            identity_key: IdentityKey::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
            sample_timeout_secs: DEFAULT_SAMPLE_TIMEOUT_SECS,
            idle_polling: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AccessConfig {
    /// Usernames (or numeric ids) allowed to run privileged commands.
    #[serde(default)]
    pub allow_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub token: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            long_poll_timeout_secs: DEFAULT_LONG_POLL_TIMEOUT_SECS,
            delivery_timeout_secs: DEFAULT_DELIVERY_TIMEOUT_SECS,
        }
    }
}

/// What the process is about to do; decides which settings are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Long-running bot: needs the token and a non-empty allow-list.
    Bot,
    /// Print one stats dump and exit: only the status file is needed.
    Once,
}

/// Validated settings. Every duration is non-zero.
#[derive(Debug, Clone)]
pub struct Settings {
    pub status_path: PathBuf,
    pub identity_key: IdentityKey,
    pub sample_timeout: Duration,
    pub monitor: MonitorConfig,
    pub allow_list: Vec<String>,
    /// `None` only in [`RunMode::Once`].
    pub telegram: Option<TelegramSettings>,
}

#[derive(Clone)]
pub struct TelegramSettings {
    pub token: String,
    pub api_url: String,
    pub long_poll_timeout: Duration,
    pub delivery_timeout: Duration,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("long_poll_timeout", &self.long_poll_timeout)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl Config {
    /// Applies `OPENVPN_STATUS_LOG_FILE`, `TOKEN` and `WHITELIST` (comma-separated)
    /// on top of the file. Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup(ENV_STATUS_FILE) {
            self.status.path = Some(PathBuf::from(path));
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.telegram.token = Some(token);
        }
        if let Some(list) = lookup(ENV_WHITELIST) {
            self.access.allow_list = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn validate(self, mode: RunMode) -> Result<Settings, ConfigError> {
        let status_path = self.status.path.ok_or(ConfigError::Missing {
            field: "status.path",
            env: ENV_STATUS_FILE,
        })?;

        let poll_interval = non_zero("status.poll_interval_secs", self.status.poll_interval_secs)?;
        let sample_timeout =
            non_zero("status.sample_timeout_secs", self.status.sample_timeout_secs)?;
        if self.status.retry_backoff_secs <= self.status.poll_interval_secs {
            return Err(ConfigError::Invalid {
                field: "status.retry_backoff_secs",
                reason: format!(
                    "must be longer than the poll interval ({}s)",
                    self.status.poll_interval_secs
                ),
            });
        }

        let telegram = match mode {
            RunMode::Once => None,
            RunMode::Bot => {
                if self.access.allow_list.is_empty() {
                    return Err(ConfigError::Missing {
                        field: "access.allow_list",
                        env: ENV_WHITELIST,
                    });
                }
                let token = self
                    .telegram
                    .token
                    .filter(|t| !t.trim().is_empty())
                    .ok_or(ConfigError::Missing {
                        field: "telegram.token",
                        env: ENV_TOKEN,
                    })?;
                Some(TelegramSettings {
                    token,
                    api_url: self.telegram.api_url,
                    long_poll_timeout: non_zero(
                        "telegram.long_poll_timeout_secs",
                        self.telegram.long_poll_timeout_secs,
                    )?,
                    delivery_timeout: non_zero(
                        "telegram.delivery_timeout_secs",
                        self.telegram.delivery_timeout_secs,
                    )?,
                })
            }
        };

        Ok(Settings {
            status_path,
            identity_key: self.status.identity_key,
            sample_timeout,
            monitor: MonitorConfig {
                poll_interval,
                retry_backoff: Duration::from_secs(self.status.retry_backoff_secs),
                idle_polling: self.status.idle_polling,
            },
            allow_list: self.access.allow_list,
            telegram,
        })
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads `KEY=value` pairs from a dotenv file. A missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let to_error = |source: dotenvy::Error| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    match dotenvy::from_path_iter(path) {
        Ok(entries) => entries.collect::<Result<_, _>>().map_err(to_error),
        Err(e) if e.not_found() => Ok(HashMap::new()),
        Err(e) => Err(to_error(e)),
    }
}

/// File, then environment, then validation.
///
/// The process environment takes precedence over `env_file`, which only
/// fills in variables that are not already set.
pub fn load(path: &Path, env_file: &Path, mode: RunMode) -> Result<Settings, ConfigError> {
    resolve(path, env_file, |name| std::env::var(name).ok(), mode)
}

fn resolve(
    path: &Path,
    env_file: &Path,
    process_env: impl Fn(&str) -> Option<String>,
    mode: RunMode,
) -> Result<Settings, ConfigError> {
    let mut config = load_or_default(path)?;
    let dotenv = read_env_file(env_file)?;
    config.apply_env_overrides(|name| process_env(name).or_else(|| dotenv.get(name).cloned()));
    config.validate(mode)
}

fn non_zero(field: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_retry_backoff() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}

fn default_sample_timeout() -> u64 {
    DEFAULT_SAMPLE_TIMEOUT_SECS
}

fn default_long_poll_timeout() -> u64 {
    DEFAULT_LONG_POLL_TIMEOUT_SECS
}

fn default_delivery_timeout() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_true() -> bool {
    true
}
