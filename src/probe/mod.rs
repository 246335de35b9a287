//! Interfaces to the world outside this process
//!
//! The scheduler never trusts its own bookkeeping for what is running or what
//! is on disk. Everything is re-derived from these collaborators on each read:
//!
//! - [`ProcessController`]: start/stop/inspect backend processes and read logs
//! - [`GpuMeter`]: live GPU memory usage
//! - [`ArtifactStore`]: whether a model's weights are fully downloaded
//!
//! Implementations should be cheap to call concurrently. Timeouts are imposed
//! by the caller through [`bounded`], so a hung subprocess can never hold the
//! switch slot forever.

pub mod artifacts;
pub mod docker;
pub mod nvidia;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub use artifacts::HfCacheStore;
pub use docker::DockerController;
pub use nvidia::NvidiaSmiMeter;

/// Errors from an external collaborator call
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProbeError {
    /// The call did not finish within its own deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The collaborator ran but reported failure; the text is surfaced verbatim
    #[error("{operation} failed: {detail}")]
    Failed { operation: String, detail: String },
}

impl ProbeError {
    pub fn failed(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Health reported by the backend's own readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Starting,
    Unhealthy,
    /// The process exposes no health probe, or it has not reported yet
    #[default]
    Unknown,
}

/// Raw result of inspecting one backend process
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessInspection {
    pub present: bool,
    pub running: bool,
    /// Exit code of the last run, meaningful only when not running
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub health: HealthState,
}

impl ProcessInspection {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn running(started_at: DateTime<Utc>, health: HealthState) -> Self {
        Self {
            present: true,
            running: true,
            exit_code: None,
            started_at: Some(started_at),
            health,
        }
    }

    pub fn exited(exit_code: i64) -> Self {
        Self {
            present: true,
            running: false,
            exit_code: Some(exit_code),
            started_at: None,
            health: HealthState::Unknown,
        }
    }
}

/// Point-in-time GPU memory reading. Never reused across scheduling decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMemorySnapshot {
    pub used_gb: f64,
    pub total_gb: f64,
    pub available_gb: f64,
    pub sampled_at: DateTime<Utc>,
}

impl GpuMemorySnapshot {
    pub fn new(used_gb: f64, total_gb: f64) -> Self {
        Self {
            used_gb,
            total_gb,
            available_gb: (total_gb - used_gb).max(0.0),
            sampled_at: Utc::now(),
        }
    }
}

/// Controls the backend processes that each serve one model
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Start the process. Must succeed without side effects if it already runs.
    async fn start(&self, name: &str) -> Result<(), ProbeError>;

    /// Stop the process. Stopping an absent or stopped process succeeds.
    async fn stop(&self, name: &str) -> Result<(), ProbeError>;

    async fn inspect(&self, name: &str) -> Result<ProcessInspection, ProbeError>;

    /// Last `tail_lines` lines of combined output.
    async fn logs(&self, name: &str, tail_lines: usize) -> Result<String, ProbeError>;
}

/// Reports GPU memory usage
#[async_trait]
pub trait GpuMeter: Send + Sync {
    async fn sample(&self) -> Result<GpuMemorySnapshot, ProbeError>;
}

/// Knows whether model weights are present locally
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn is_complete(&self, artifact_key: &str) -> bool;

    /// Human readable on-disk size, if the artifact exists at all.
    async fn approx_size(&self, artifact_key: &str) -> Option<String>;
}

/// Run a collaborator call under its own deadline.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Format a byte count the way operators read model sizes.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_converts_timeout() {
        let result: Result<(), ProbeError> = bounded("stop model-a", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(ProbeError::Timeout {
                operation: "stop model-a".to_string(),
                timeout: Duration::from_millis(10),
            })
        );
    }

    #[tokio::test]
    async fn test_bounded_passes_through_errors() {
        let result: Result<(), ProbeError> = bounded("inspect", Duration::from_secs(1), async {
            Err(ProbeError::failed("inspect", "boom"))
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "inspect failed: boom");
    }

    #[test]
    fn test_snapshot_available_never_negative() {
        let snapshot = GpuMemorySnapshot::new(97.0, 96.0);
        assert_eq!(snapshot.available_gb, 0.0);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(66_893_012_992), "62.3 GB");
    }
}
