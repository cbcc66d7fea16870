//! Configuration of the sync core.
//!
//! The config is usually loaded from a TOML file with [`Config::load`], which also applies
//! overrides from environment variables prefixed with [`ENV_PREFIX`].

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;
use url::Url;

/// Prefix of environment variables overriding config fields.
///
/// For example `BASKET_SYNC_REMOTE_ONLY=true` sets [`Config::remote_only`].
pub const ENV_PREFIX: &str = "BASKET_SYNC_";

/// Deployment environment.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    /// Production builds.
    #[default]
    Production,
    /// Development builds, which keep their local stores apart from production data.
    Development,
}

/// Configuration errors.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[snafu(display("Failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for a [`Config`].
    #[snafu(display("Failed to parse config"))]
    Parse { source: toml::de::Error },
    /// An environment override could not be parsed.
    #[snafu(display("Invalid value {value:?} for {name}"))]
    Env { name: String, value: String },
    /// The config is malformed.
    #[snafu(display("Invalid config: {reason}"))]
    Invalid { reason: String },
}

/// Configuration consumed by the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base url of the remote CouchDB server.
    pub remote_url: Option<Url>,
    /// Work against the remote store directly, without a local cache.
    pub remote_only: bool,
    /// Destroy and recreate local stores when opening them.  For debugging.
    pub wipe_local_database: bool,
    /// Log store and replication events at info level.
    pub debug: bool,
    /// Deployment environment.
    pub environment: Environment,
    /// Server side session lifetime in seconds.
    pub session_timeout_secs: u64,
    /// Number of remote authentication attempts before giving up.
    pub auth_retry_attempts: usize,
    /// Delay between remote authentication attempts in milliseconds.
    pub auth_retry_delay_ms: u64,
    /// Delay before authenticating after a reconnect, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Limit applied to remote queries without one, in remote-only mode.
    pub remote_find_limit: usize,
    /// Documents per replication batch.
    pub replication_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_only: false,
            wipe_local_database: false,
            debug: false,
            environment: Environment::Production,
            session_timeout_secs: 600,
            auth_retry_attempts: 10,
            auth_retry_delay_ms: 500,
            reconnect_delay_ms: 500,
            remote_find_limit: 100_000,
            replication_batch_size: 100,
        }
    }
}

impl Config {
    /// Loads the config from a file, applies environment overrides and validates it.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let mut config = Self::from_toml(&s)?;
        config.apply_env_vars(std::env::vars())?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parses a config from TOML.  Missing fields keep their defaults.
    pub fn from_toml(s: &str) -> Result<Config, ConfigError> {
        toml::from_str(s).context(ParseSnafu)
    }

    /// Applies overrides from `vars`, ignoring variables without [`ENV_PREFIX`].
    pub fn apply_env_vars(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "REMOTE_URL" => self.remote_url = Some(parse_env(&name, &value)?),
                "REMOTE_ONLY" => self.remote_only = parse_env(&name, &value)?,
                "WIPE_LOCAL_DATABASE" => self.wipe_local_database = parse_env(&name, &value)?,
                "DEBUG" => self.debug = parse_env(&name, &value)?,
                "ENVIRONMENT" => self.environment = parse_env(&name, &value)?,
                _ => continue,
            }
            debug!(%name, "config override from environment");
        }
        Ok(())
    }

    /// Rejects configurations the sync core can not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };
        if self.auth_retry_attempts == 0 {
            return invalid("auth_retry_attempts must be at least 1");
        }
        if self.session_timeout_secs == 0 {
            return invalid("session_timeout_secs must be positive");
        }
        if self.replication_batch_size == 0 {
            return invalid("replication_batch_size must be at least 1");
        }
        if self.remote_find_limit == 0 {
            return invalid("remote_find_limit must be at least 1");
        }
        if let Some(url) = &self.remote_url {
            if url.cannot_be_a_base() {
                return invalid("remote_url must be a base url");
            }
        }
        Ok(())
    }

    /// The remote url, which must be configured to reach a server.
    pub fn require_remote_url(&self) -> Result<&Url, ConfigError> {
        self.remote_url.as_ref().ok_or_else(|| ConfigError::Invalid {
            reason: "remote_url is not set".to_string(),
        })
    }

    /// Server side session lifetime.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Delay between remote authentication attempts.
    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auth_retry_delay_ms)
    }

    /// Delay before authenticating after a reconnect.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}
