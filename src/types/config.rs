//! Configuration structures.
//!
//! Configuration is built in code (`Default` impls) or loaded from a JSON file,
//! and validated before the arbiter starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::monitor::RestartPolicy;
use crate::types::{Error, Result};

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Arbiter lifecycle configuration.
    #[serde(default)]
    pub arbiter: ArbiterConfig,

    /// Mailbox transport configuration.
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections use defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let a = &self.arbiter;
        if a.startup_timeout.is_zero() {
            return Err(Error::validation("arbiter.startup_timeout must be > 0"));
        }
        if a.heartbeat_interval.is_zero() {
            return Err(Error::validation("arbiter.heartbeat_interval must be > 0"));
        }
        if a.heartbeat_timeout <= a.heartbeat_interval {
            return Err(Error::validation(
                "arbiter.heartbeat_timeout must exceed arbiter.heartbeat_interval",
            ));
        }
        if self.mailbox.call_timeout.is_zero() {
            return Err(Error::validation("mailbox.call_timeout must be > 0"));
        }
        if self.mailbox.max_frame_bytes == 0 {
            return Err(Error::validation("mailbox.max_frame_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Arbiter lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Deadline for every declared component to report `running`.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Drain budget before stragglers are force-killed on shutdown. Also the
    /// drain budget each actor gives its in-flight handlers on `stop`.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,

    /// How often actors send `notify` and the arbiter sweeps for stale members.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a member is considered dead.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Directory for the process-mode Unix socket (defaults to the temp dir).
    pub socket_dir: Option<PathBuf>,

    /// React to SIGINT/SIGTERM/SIGQUIT.
    pub install_signal_handlers: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            socket_dir: None,
            install_signal_handlers: true,
        }
    }
}

/// Mailbox transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Maximum accepted frame size in bytes.
    pub max_frame_bytes: u32,

    /// Deadline for the correlated reply to a `call`.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error) used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// How a monitor hosts its actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// One OS process per actor.
    Process,
    /// One OS thread per actor, inside the arbiter process.
    #[default]
    Thread,
}

/// Per-monitor pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub concurrency: Concurrency,
    pub pool_size: usize,
    pub restart_policy: RestartPolicy,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::validation("pool_size must be >= 1"));
        }
        self.restart_policy.validate()
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Thread,
            pool_size: 1,
            restart_policy: RestartPolicy::Always,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
        MonitorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let cfg = MonitorConfig {
            pool_size: 0,
            ..MonitorConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut cfg = Config::default();
        cfg.arbiter.heartbeat_timeout = cfg.arbiter.heartbeat_interval;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"arbiter": {{"startup_timeout": "2s", "heartbeat_interval": "250ms", "heartbeat_timeout": "1s"}},
                "mailbox": {{"call_timeout": "750ms"}}}}"#
        )
        .unwrap();

        let cfg = Config::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.arbiter.startup_timeout, Duration::from_secs(2));
        assert_eq!(cfg.arbiter.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.mailbox.call_timeout, Duration::from_millis(750));
        // untouched fields keep their defaults
        assert_eq!(cfg.arbiter.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(cfg.mailbox.max_frame_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_monitor_config_from_json() {
        let cfg: MonitorConfig = serde_json::from_str(
            r#"{"concurrency": "process", "pool_size": 3,
                "restart_policy": {"backoff": {"max_restarts": 2, "base_delay": "100ms"}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.concurrency, Concurrency::Process);
        assert_eq!(cfg.pool_size, 3);
        assert!(matches!(cfg.restart_policy, RestartPolicy::Backoff { max_restarts: 2, .. }));
    }
}
