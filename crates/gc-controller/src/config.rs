//! Controller Configuration
//!
//! Loaded from a YAML file mounted from a ConfigMap. Every key is optional;
//! missing keys take the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::leader::LeaseSettings;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "GC_CONTROLLER_CONFIG";

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Seconds between evaluation passes of one policy
    #[serde(rename = "gcIntervalSeconds", default = "default_gc_interval")]
    pub gc_interval_seconds: u64,

    /// Policies reconciled concurrently
    #[serde(rename = "maxConcurrentEvaluations", default = "default_max_concurrent")]
    pub max_concurrent_evaluations: u16,

    /// Rate used by policies that do not set `maxDeletionsPerSecond`
    #[serde(rename = "defaultMaxDeletionsPerSecond", default = "default_max_deletions")]
    pub default_max_deletions_per_second: u32,

    /// Batch size used by policies that do not set `batchSize`
    #[serde(rename = "defaultBatchSize", default = "default_batch_size")]
    pub default_batch_size: u32,

    /// Only reconcile policies in this namespace
    #[serde(rename = "watchNamespace", default, skip_serializing_if = "Option::is_none")]
    pub watch_namespace: Option<String>,

    /// Never delete anything, whatever the policies say
    #[serde(rename = "dryRun", default)]
    pub dry_run: bool,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(rename = "leaderElection", default)]
    pub leader_election: LeaderElectionConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Retry configuration for deletions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(rename = "maxAttempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initialMillis", default = "default_initial_millis")]
    pub initial_millis: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Relative jitter, `0.1` = ±10%
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(rename = "maxDelaySeconds", default = "default_max_delay")]
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatchConfig {
    /// How long a new watch may take to fill its cache
    #[serde(rename = "readyTimeoutSeconds", default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeaderElectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "leaseName", default = "default_lease_name")]
    pub lease_name: String,

    /// Defaults to `POD_NAMESPACE`, then `default`
    #[serde(rename = "leaseNamespace", default = "default_lease_namespace")]
    pub lease_namespace: String,

    #[serde(rename = "leaseDurationSeconds", default = "default_lease_duration")]
    pub lease_duration_seconds: u64,

    #[serde(rename = "renewIntervalSeconds", default = "default_renew_interval")]
    pub renew_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(rename = "bindAddress", default = "default_bind_address")]
    pub bind_address: String,
}

fn default_gc_interval() -> u64 {
    60
}

fn default_max_concurrent() -> u16 {
    5
}

fn default_max_deletions() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_millis() -> u64 {
    100
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_delay() -> u64 {
    30
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_lease_name() -> String {
    "gc-controller-leader".to_string()
}

fn default_lease_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_interval() -> u64 {
    5
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            max_attempts: default_max_attempts(),
            initial_millis: default_initial_millis(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            ready_timeout_seconds: default_ready_timeout(),
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        LeaderElectionConfig {
            enabled: default_true(),
            lease_name: default_lease_name(),
            lease_namespace: default_lease_namespace(),
            lease_duration_seconds: default_lease_duration(),
            renew_interval_seconds: default_renew_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gc_interval_seconds: default_gc_interval(),
            max_concurrent_evaluations: default_max_concurrent(),
            default_max_deletions_per_second: default_max_deletions(),
            default_batch_size: default_batch_size(),
            watch_namespace: None,
            dry_run: false,
            backoff: BackoffConfig::default(),
            watch: WatchConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that configuration values are usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.gc_interval_seconds == 0 {
            return Err(anyhow::anyhow!("gcIntervalSeconds must be greater than zero"));
        }
        if self.max_concurrent_evaluations == 0 {
            return Err(anyhow::anyhow!("maxConcurrentEvaluations must be greater than zero"));
        }
        if self.default_max_deletions_per_second == 0 {
            return Err(anyhow::anyhow!("defaultMaxDeletionsPerSecond must be greater than zero"));
        }
        if self.default_batch_size == 0 {
            return Err(anyhow::anyhow!("defaultBatchSize must be greater than zero"));
        }
        if self.backoff.max_attempts == 0 {
            return Err(anyhow::anyhow!("backoff.maxAttempts must be at least 1"));
        }
        if !self.backoff.factor.is_finite() || self.backoff.factor < 1.0 {
            return Err(anyhow::anyhow!(format!(
                "backoff.factor must be >= 1.0, got {}",
                self.backoff.factor
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(anyhow::anyhow!(format!(
                "backoff.jitter must be within [0, 1], got {}",
                self.backoff.jitter
            )));
        }
        if self.leader_election.enabled
            && self.leader_election.renew_interval_seconds >= self.leader_election.lease_duration_seconds
        {
            return Err(anyhow::anyhow!(
                "leaderElection.renewIntervalSeconds must be shorter than leaseDurationSeconds"
            ));
        }
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(format!(
                "server.bindAddress '{}' is not a socket address",
                self.server.bind_address
            )));
        }
        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        // An empty file is valid and means "all defaults"
        if config_str.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(config_str).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.watch.ready_timeout_seconds)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.backoff.max_attempts,
            initial: Duration::from_millis(self.backoff.initial_millis),
            factor: self.backoff.factor,
            jitter: self.backoff.jitter,
            max_delay: Duration::from_secs(self.backoff.max_delay_seconds),
        }
    }

    #[must_use]
    pub fn lease_settings(&self, identity: &str) -> LeaseSettings {
        LeaseSettings {
            name: self.leader_election.lease_name.clone(),
            namespace: self.leader_election.lease_namespace.clone(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(self.leader_election.lease_duration_seconds),
            renew_interval: Duration::from_secs(self.leader_election.renew_interval_seconds),
        }
    }
}
