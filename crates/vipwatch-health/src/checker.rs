//! Reachability probe logic.
//!
//! Sends a single ICMP echo through the system `ping` binary. Exit status
//! zero is the only success; a non-zero exit, a hard timeout, or a failure
//! to start the process all count as unreachable.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Result of a single reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered the echo request.
    Reachable,
    /// The probe ran and the target did not answer in time.
    Unreachable,
    /// The probe could not be executed or was killed at the hard limit.
    Failed,
}

impl ProbeResult {
    pub fn is_reachable(self) -> bool {
        self == ProbeResult::Reachable
    }
}

/// Why a probe could not produce an answer.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe to {target} exceeded {after:?}")]
    TimedOut { target: Ipv4Addr, after: Duration },
}

/// Something that can tell whether an address answers.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: Ipv4Addr) -> ProbeResult;
}

/// Probes with one `ping` packet.
#[derive(Debug, Clone)]
pub struct PingProber {
    binary: String,
    /// Per-packet wait passed to `ping -W`.
    packet_timeout: Duration,
    /// Hard limit on the whole process.
    overall_timeout: Duration,
}

impl PingProber {
    pub fn new(binary: &str, packet_timeout: Duration, overall_timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            packet_timeout,
            overall_timeout,
        }
    }

    fn args(&self, target: Ipv4Addr) -> Vec<String> {
        // `-W` only takes whole seconds on most ping builds.
        let wait = self.packet_timeout.as_secs().max(1);
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            wait.to_string(),
            target.to_string(),
        ]
    }

    /// Run the probe once. `Ok(true)` iff ping exited zero.
    pub async fn ping_once(&self, target: Ipv4Addr) -> Result<bool, ProbeError> {
        let child = Command::new(&self.binary)
            .args(self.args(target))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.overall_timeout, child)
            .await
            .map_err(|_| ProbeError::TimedOut {
                target,
                after: self.overall_timeout,
            })?
            .map_err(|source| ProbeError::Launch {
                binary: self.binary.clone(),
                source,
            })?;

        debug!(
            %target,
            status = %output.status,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "ping completed"
        );
        Ok(output.status.success())
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new("ping", Duration::from_secs(2), Duration::from_secs(5))
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: Ipv4Addr) -> ProbeResult {
        match self.ping_once(target).await {
            Ok(true) => ProbeResult::Reachable,
            Ok(false) => ProbeResult::Unreachable,
            Err(e) => {
                debug!(%target, error = %e, "ping failed");
                ProbeResult::Failed
            }
        }
    }
}
