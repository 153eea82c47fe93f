//! vipwatch.toml configuration.
//!
//! Every field has a default, so an absent or empty file yields the
//! reference timings: a 5s cycle, a 2s/5s probe, a 5s retry backoff and a
//! 30s bootstrap grace period.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VipwatchConfig {
    pub monitor: MonitorConfig,
    pub failover: FailoverConfig,
    pub fallback: FallbackConfig,
    pub aws: AwsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between monitoring cycles.
    pub interval: String,
    /// Per-packet wait handed to the probe (`ping -W`).
    pub probe_packet_timeout: String,
    /// Hard limit on the whole probe process.
    pub probe_timeout: String,
    pub ping_binary: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            probe_packet_timeout: "2s".to_string(),
            probe_timeout: "5s".to_string(),
            ping_binary: "ping".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Pause before retrying when no alternate AZ or subnet exists.
    pub retry_backoff: String,
    /// Blind wait after launch for the bootstrap payload to finish.
    pub bootstrap_grace: String,
    pub running_timeout: String,
    pub status_ok_timeout: String,
    pub wait_poll_interval: String,
    /// Prefix of the `Name` tag given to replacements.
    pub name_prefix: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry_backoff: "5s".to_string(),
            bootstrap_grace: "30s".to_string(),
            running_timeout: "10m".to_string(),
            status_ok_timeout: "15m".to_string(),
            wait_poll_interval: "15s".to_string(),
            name_prefix: "sec-ip-vip".to_string(),
        }
    }
}

/// Image and size used when nothing is known about the lost instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub image_id: String,
    pub instance_type: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            image_id: "ami-0c02fb55956c7d316".to_string(),
            instance_type: "t3.micro".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Path or name of the `aws` command line.
    pub cli: String,
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            cli: "aws".to_string(),
            region: None,
            profile: None,
        }
    }
}

/// Resolved timings, all validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub interval: Duration,
    pub probe_packet_timeout: Duration,
    pub probe_timeout: Duration,
    pub retry_backoff: Duration,
    pub bootstrap_grace: Duration,
    pub running_timeout: Duration,
    pub status_ok_timeout: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_packet_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(5),
            bootstrap_grace: Duration::from_secs(30),
            running_timeout: Duration::from_secs(600),
            status_ok_timeout: Duration::from_secs(900),
            wait_poll_interval: Duration::from_secs(15),
        }
    }
}

impl VipwatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: VipwatchConfig = toml::from_str(content)?;
        config.timings()?;
        Ok(config)
    }

    /// Parse every duration field.
    pub fn timings(&self) -> Result<Timings, ConfigError> {
        Ok(Timings {
            interval: field("monitor.interval", &self.monitor.interval)?,
            probe_packet_timeout: field(
                "monitor.probe_packet_timeout",
                &self.monitor.probe_packet_timeout,
            )?,
            probe_timeout: field("monitor.probe_timeout", &self.monitor.probe_timeout)?,
            retry_backoff: field("failover.retry_backoff", &self.failover.retry_backoff)?,
            bootstrap_grace: field("failover.bootstrap_grace", &self.failover.bootstrap_grace)?,
            running_timeout: field("failover.running_timeout", &self.failover.running_timeout)?,
            status_ok_timeout: field(
                "failover.status_ok_timeout",
                &self.failover.status_ok_timeout,
            )?,
            wait_poll_interval: field(
                "failover.wait_poll_interval",
                &self.failover.wait_poll_interval,
            )?,
        })
    }
}

fn field(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_reference_timings() {
        let config = VipwatchConfig::from_toml("").unwrap();
        assert_eq!(config.timings().unwrap(), Timings::default());
        assert_eq!(config.fallback.instance_type, "t3.micro");
        assert_eq!(config.failover.name_prefix, "sec-ip-vip");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = VipwatchConfig::from_toml(
            r#"
[monitor]
interval = "10s"

[aws]
region = "eu-west-1"
"#,
        )
        .unwrap();
        let timings = config.timings().unwrap();
        assert_eq!(timings.interval, Duration::from_secs(10));
        assert_eq!(timings.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.aws.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.aws.cli, "aws");
    }

    #[test]
    fn bad_duration_is_rejected_at_load() {
        let err = VipwatchConfig::from_toml(
            r#"
[failover]
bootstrap_grace = "half a minute"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "failover.bootstrap_grace", .. }
        ));
    }

    #[test]
    fn unknown_toml_is_a_parse_error() {
        let err = VipwatchConfig::from_toml("monitor = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
