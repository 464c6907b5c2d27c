//! Startup configuration.
//!
//! Deserialized from a JSON file, with `PROCTOR_CONFIG_*` environment
//! variables merged on top (double underscores separate nested keys, e.g.
//! `PROCTOR_CONFIG_SERVER__LISTEN_ADDR` maps to `server.listen_addr`).
//! Durations are human-readable strings like `"5m"` or `"1h30m"`; bad input
//! fails the load.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::Path,
};

use figment::{
    Figment,
    providers::{Env, Format as _, Json},
};
use serde::Deserialize;
use types::{DurationString, Package};
use url::Url;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "PROCTOR_CONFIG_";

#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    #[error("failed to load config: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("no packages configured")]
    NoPackages,

    #[error("duplicate package name: {0}")]
    DuplicatePackage(String),

    #[error("server.api_key must not be empty")]
    MissingApiKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The packages the control plane schedules runs for.
    pub packages: Vec<Package>,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// When absent, no Slack alerter is registered.
    #[serde(default)]
    pub slack: Option<SlackSettings>,

    pub server: ServerSettings,

    pub database: DatabaseSettings,
}

impl Config {
    /// Load configuration from `path`, merging environment overrides, and
    /// validate it. Any error here aborts startup.
    pub fn load(path: &Path) -> Result<Self, LoadConfigError> {
        let config: Config = Figment::new()
            .merge(Json::file_exact(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadConfigError> {
        if self.packages.is_empty() {
            return Err(LoadConfigError::NoPackages);
        }
        let mut names = HashSet::new();
        for pkg in &self.packages {
            if !names.insert(pkg.name.as_str()) {
                return Err(LoadConfigError::DuplicatePackage(pkg.name.clone()));
            }
        }
        if self.server.api_key.is_empty() {
            return Err(LoadConfigError::MissingApiKey);
        }
        Ok(())
    }
}

/// Scheduler cadence overrides. Unset values fall back to the scheduler's
/// built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSettings {
    pub run_timeout: Option<DurationString>,
    pub run_delay: Option<DurationString>,
}

/// Slack alerting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackSettings {
    pub webhook_url: Url,

    #[serde(default = "default_slack_username")]
    pub username: String,

    /// Channels every failure is posted to.
    #[serde(default)]
    pub default_channels: Vec<String>,

    /// Additional channels per package name.
    #[serde(default)]
    pub custom_channels: HashMap<String, Vec<String>>,
}

fn default_slack_username() -> String {
    "proctor".to_owned()
}

#[derive(Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// The shared secret workers present as their basic-auth password.
    pub api_key: String,

    /// Base URL the dashboard is reachable at, used in alert links.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("listen_addr", &self.listen_addr)
            .field("api_key", &"..")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Serde default for [`DatabaseSettings::pool_size`].
fn default_pool_size() -> u32 {
    results_db::DEFAULT_POOL_SIZE
}
