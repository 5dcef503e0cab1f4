//! Discovery configuration
//!
//! Static settings are deserialized with `serde` and loaded through the `config`
//! crate. `LiveConfig` holds the current snapshot and publishes a change signal
//! whenever a new snapshot is installed.

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::discovery::node_source::SourceKind;
use crate::error::Result;

/// Default polling cadence for node monitors
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Default polling cadence for the service catalog
pub const DEFAULT_CATALOG_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Fall back to the master environment when a service is not deployed
    /// under the originating one
    pub environment_fallback_enabled: bool,
    /// Environment this process is deployed under
    pub deployment_environment: String,
    /// Fallback-of-last-resort environment
    pub master_environment: String,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub catalog_reload_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub default_reload_interval: Duration,
    /// Per-service overrides, keyed by logical service name
    pub services: HashMap<String, ServiceConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            environment_fallback_enabled: false,
            deployment_environment: "dev".to_string(),
            master_environment: "prod".to_string(),
            catalog_reload_interval: DEFAULT_CATALOG_RELOAD_INTERVAL,
            default_reload_interval: DEFAULT_RELOAD_INTERVAL,
            services: HashMap::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Look up the overrides for a service (case-insensitive)
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name).or_else(|| {
            self.services
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, config)| config)
        })
    }

    /// Effective settings for a service, defaults applied
    #[must_use]
    pub fn service_or_default(&self, name: &str) -> ServiceConfig {
        self.service(name).cloned().unwrap_or_default()
    }

    /// Node monitor polling cadence for a service
    #[must_use]
    pub fn reload_interval(&self, name: &str) -> Duration {
        self.service(name)
            .and_then(|s| s.reload_interval)
            .unwrap_or(self.default_reload_interval)
    }

    /// Whether this process runs in the master environment itself
    #[must_use]
    pub fn is_master_environment(&self) -> bool {
        self.deployment_environment
            .eq_ignore_ascii_case(&self.master_environment)
    }
}

/// Per-service discovery settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub source: SourceKind,
    /// Comma-separated `host[:port]` list, used by the `Config` source
    pub hosts: Option<String>,
    #[serde(
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration"
    )]
    pub reload_interval: Option<Duration>,
    /// Scoping beyond the deployment environment is not supported; any value
    /// other than `Environment` is ignored with a warning
    pub scope: Option<String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // WAYPOINT__DISCOVERY__DEPLOYMENT_ENVIRONMENT=staging
        builder = builder.add_source(
            Environment::with_prefix("WAYPOINT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }
}

/// Live discovery configuration
///
/// Every installed snapshot is a "configuration changed" signal to the
/// receivers handed out by [`LiveConfig::subscribe`].
#[derive(Debug, Clone)]
pub struct LiveConfig {
    tx: Arc<watch::Sender<Arc<DiscoveryConfig>>>,
}

impl LiveConfig {
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    #[must_use]
    pub fn current(&self) -> Arc<DiscoveryConfig> {
        self.tx.borrow().clone()
    }

    /// Receive a notification for every snapshot installed after this call
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<DiscoveryConfig>> {
        self.tx.subscribe()
    }

    /// Install a new snapshot and raise the change signal
    pub fn update(&self, config: DiscoveryConfig) {
        self.tx.send_replace(Arc::new(config));
        tracing::debug!("Discovery configuration updated");
    }

    /// Apply an edit to a copy of the current snapshot and install it
    pub fn modify(&self, edit: impl FnOnce(&mut DiscoveryConfig)) {
        let mut next = (*self.current()).clone();
        edit(&mut next);
        self.update(next);
    }

    /// Re-read configuration from file and environment; the current snapshot
    /// is kept if loading fails
    pub fn reload(&self, config_file: Option<&str>) -> Result<()> {
        match Config::load(config_file) {
            Ok(config) => {
                self.update(config.discovery);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Configuration reload failed, keeping current settings");
                Err(e)
            }
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
        .transpose()
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn serialize_optional_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match duration {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}
