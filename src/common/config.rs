//! Configuration for the minifleet controller

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `MINIFLEET__RECONCILE_INTERVAL_MS=5000`
pub const ENV_PREFIX: &str = "MINIFLEET";

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bind address for the admin HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Cluster manifest (nodes, volumes, services)
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// Fixed reconciliation period
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Expected heartbeat period of node agents
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a node is marked unreachable
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,

    /// How long an unreachable node keeps its replicas before they move
    #[serde(default = "default_unreachable_grace")]
    pub unreachable_grace_ms: u64,

    /// Timeout for a single create/delete/health call
    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,

    /// Time a replica may spend provisioning before it counts as failed
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_ms: u64,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Attempts before an entity is reported as stuck
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Add ±10% jitter to retry backoff
    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Periodic endpoint sync, on top of event-driven updates
    #[serde(default = "default_router_interval")]
    pub router_interval_ms: u64,

    /// External traffic router; log-only ingress when unset
    #[serde(default)]
    pub ingress_url: Option<String>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7400))
}
fn default_manifest_path() -> PathBuf {
    PathBuf::from("./cluster.toml")
}
fn default_reconcile_interval() -> u64 {
    10_000
}
fn default_heartbeat_interval() -> u64 {
    1_000
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_unreachable_grace() -> u64 {
    30_000
}
fn default_action_timeout() -> u64 {
    5_000
}
fn default_provision_timeout() -> u64 {
    60_000
}
fn default_retry_initial_backoff() -> u64 {
    500
}
fn default_retry_max_backoff() -> u64 {
    30_000
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_router_interval() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            manifest_path: default_manifest_path(),
            reconcile_interval_ms: default_reconcile_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            unreachable_grace_ms: default_unreachable_grace(),
            action_timeout_ms: default_action_timeout(),
            provision_timeout_ms: default_provision_timeout(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_jitter: default_true(),
            router_interval_ms: default_router_interval(),
            ingress_url: None,
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// Load from an optional TOML file, then apply `MINIFLEET__*` environment overrides
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let conf: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::InvalidConfig;

        if self.reconcile_interval_ms == 0 {
            return Err(InvalidConfig("reconcile_interval_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(InvalidConfig("heartbeat_interval_ms must be > 0".into()));
        }
        if self.router_interval_ms == 0 {
            return Err(InvalidConfig("router_interval_ms must be > 0".into()));
        }
        if self.missed_heartbeats == 0 {
            return Err(InvalidConfig("missed_heartbeats must be > 0".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(InvalidConfig("retry_max_attempts must be > 0".into()));
        }
        if self.action_timeout_ms == 0 {
            return Err(InvalidConfig("action_timeout_ms must be > 0".into()));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(InvalidConfig(format!(
                "retry_initial_backoff_ms ({}) exceeds retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a node is declared unreachable
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn unreachable_grace(&self) -> Duration {
        Duration::from_millis(self.unreachable_grace_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn router_interval(&self) -> Duration {
        Duration::from_millis(self.router_interval_ms)
    }

    pub fn retry_policy(&self) -> crate::common::RetryPolicy {
        crate::common::RetryPolicy {
            initial: Duration::from_millis(self.retry_initial_backoff_ms),
            max: Duration::from_millis(self.retry_max_backoff_ms),
            max_attempts: self.retry_max_attempts,
            jitter: self.retry_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let conf = ControllerConfig::default();
        assert!(conf.validate().is_ok());
        assert_eq!(conf.heartbeat_timeout(), Duration::from_secs(3));
        assert_eq!(conf.reconcile_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let conf = ControllerConfig {
            missed_heartbeats: 0,
            ..Default::default()
        };
        assert!(conf.validate().is_err());

        let conf = ControllerConfig {
            retry_initial_backoff_ms: 10_000,
            retry_max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "reconcile_interval_ms = 2500\nmissed_heartbeats = 5\nlog_format = \"json\""
        )
        .unwrap();

        let conf = ControllerConfig::load(Some(file.path())).unwrap();
        assert_eq!(conf.reconcile_interval_ms, 2500);
        assert_eq!(conf.missed_heartbeats, 5);
        assert_eq!(conf.log_format, LogFormat::Json);
        assert_eq!(conf.action_timeout_ms, 5_000);
    }
}
