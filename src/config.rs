use crate::endpoint::{ChannelConfig, ChannelRemap};
use crate::error::Result as RelayResult;
use crate::filter::{FilterAction, FilterChain, FilterRule};
use crate::message::{EndpointId, FingerprintMode};
use crate::router::RoutingPolicy;
use crate::supervisor::SupervisorConfig;
use crate::topology::Topology;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub endpoint: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Capacity of the inbound queue between endpoint tasks and the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// 0 disables the periodic stats log.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
    #[serde(default = "default_stats_history_secs")]
    pub stats_history_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            event_bus_capacity: default_event_bus_capacity(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
            stats_history_secs: default_stats_history_secs(),
        }
    }
}

fn default_queue_capacity() -> usize { 1024 }
fn default_event_bus_capacity() -> usize { 1000 }
fn default_stats_log_interval_secs() -> u64 { 60 }
fn default_stats_history_secs() -> u64 { 3600 }

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub fingerprint: FingerprintMode,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            fingerprint: FingerprintMode::default(),
        }
    }
}

fn default_ttl_secs() -> u64 { 600 }
fn default_max_entries() -> usize { 1000 }
fn default_sweep_interval_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// When false the configured rules are ignored and `default_action` applies.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default_action: FilterAction,
    #[serde(default, rename = "rule")]
    pub rules: Vec<FilterRule>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_action: FilterAction::Allow,
            rules: Vec::new(),
        }
    }
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default)]
    pub topology: Topology,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            topology: Topology::default(),
        }
    }
}

fn default_send_timeout_ms() -> u64 { 5000 }

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_min_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Unset disables heartbeat supervision.
    pub heartbeat_timeout_secs: Option<u64>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            backoff_min_secs: default_backoff_secs(),
            backoff_max_secs: default_backoff_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            connect_timeout_secs: default_connect_timeout_secs(),
            heartbeat_timeout_secs: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_max_restarts() -> u32 { 5 }
fn default_restart_window_secs() -> u64 { 60 }
fn default_backoff_secs() -> u64 { 10 }
fn default_backoff_multiplier() -> f64 { 1.0 }
fn default_connect_timeout_secs() -> u64 { 30 }
fn default_shutdown_grace_secs() -> u64 { 30 }

/// Per-endpoint settings, matched by id when the endpoint is added.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,
    #[serde(default)]
    pub channel_map: Vec<ChannelRemap>,
}

impl RelayConfig {
    /// Parse and validate a TOML document.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(toml_str)
            .context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.general.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be at least 1");
        }

        if self.tracker.ttl_secs == 0 {
            anyhow::bail!("tracker ttl_secs must be positive");
        }
        if self.tracker.max_entries == 0 {
            anyhow::bail!("tracker max_entries must be at least 1");
        }
        if self.tracker.sweep_interval_secs == 0 {
            anyhow::bail!("tracker sweep_interval_secs must be positive");
        }

        if self.router.send_timeout_ms == 0 {
            anyhow::bail!("router send_timeout_ms must be positive");
        }
        if let Topology::HubAndSpoke { hub } = &self.router.topology {
            if hub.as_str().is_empty() {
                anyhow::bail!("hub-and-spoke topology needs a hub endpoint id");
            }
        }

        let sup = &self.supervisor;
        if sup.backoff_min_secs > sup.backoff_max_secs {
            anyhow::bail!(
                "backoff_min_secs ({}) exceeds backoff_max_secs ({})",
                sup.backoff_min_secs, sup.backoff_max_secs
            );
        }
        if !sup.backoff_multiplier.is_finite() || sup.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be finite and >= 1.0, got {}", sup.backoff_multiplier);
        }
        if sup.heartbeat_timeout_secs == Some(0) {
            anyhow::bail!("heartbeat_timeout_secs must be positive when set");
        }

        let mut ids = HashSet::new();
        for (i, endpoint) in self.endpoint.iter().enumerate() {
            if endpoint.id.as_str().is_empty() {
                anyhow::bail!("Endpoint {} has an empty id", i);
            }
            if !ids.insert(endpoint.id.as_str()) {
                anyhow::bail!("Duplicate endpoint id '{}' (endpoint {})", endpoint.id, i);
            }
        }

        let mut names = HashSet::new();
        for rule in &self.filter.rules {
            if !names.insert(rule.name.as_str()) {
                anyhow::bail!("Duplicate filter rule name '{}'", rule.name);
            }
        }

        Ok(())
    }

    pub fn filter_chain(&self) -> FilterChain {
        if self.filter.enabled {
            FilterChain::new(self.filter.rules.clone(), self.filter.default_action)
        } else {
            FilterChain::new(Vec::new(), self.filter.default_action)
        }
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy::new(self.filter_chain(), self.router.topology.clone())
            .with_fingerprint_mode(self.tracker.fingerprint)
            .with_send_timeout(Duration::from_millis(self.router.send_timeout_ms))
            .with_tracker_limits(Duration::from_secs(self.tracker.ttl_secs), self.tracker.max_entries)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let sup = &self.supervisor;
        SupervisorConfig {
            max_restarts: sup.max_restarts,
            restart_window: Duration::from_secs(sup.restart_window_secs),
            backoff_min: Duration::from_secs(sup.backoff_min_secs),
            backoff_max: Duration::from_secs(sup.backoff_max_secs),
            backoff_multiplier: sup.backoff_multiplier,
            connect_timeout: Duration::from_secs(sup.connect_timeout_secs),
            heartbeat_timeout: sup.heartbeat_timeout_secs.map(Duration::from_secs),
            shutdown_grace: Duration::from_secs(sup.shutdown_grace_secs),
        }
    }

    /// Channel settings for `id`; endpoints without an entry get no remapping.
    pub fn channel_config(&self, id: &EndpointId) -> ChannelConfig {
        self.endpoint
            .iter()
            .find(|e| e.id == *id)
            .map(|e| ChannelConfig { remap: e.channel_map.clone() })
            .unwrap_or_default()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.sweep_interval_secs)
    }
}

/// Source of relay configuration, consulted at start and on every reload.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load(&self) -> RelayResult<RelayConfig>;
}

/// A fixed configuration held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub RelayConfig);

#[async_trait]
impl ConfigProvider for StaticConfig {
    async fn load(&self) -> RelayResult<RelayConfig> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

/// Reads a TOML file on every load.
#[derive(Debug, Clone)]
pub struct TomlFileConfig {
    path: PathBuf,
}

impl TomlFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigProvider for TomlFileConfig {
    async fn load(&self) -> RelayResult<RelayConfig> {
        Ok(RelayConfig::load(&self.path).await?)
    }
}
