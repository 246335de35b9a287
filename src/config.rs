//! Configuration for vram-switcher

use crate::classifier::Classifier;
use crate::coordinator::Timings;
use crate::registry::{ModelRegistry, ModelSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Models this host can serve
    pub models: Vec<ModelSpec>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Command used to control backend containers
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    /// Command used to sample GPU memory. Can be overridden for testing.
    #[serde(default = "default_nvidia_smi_command")]
    pub nvidia_smi_command: String,

    #[serde(default)]
    pub gpu_index: u32,

    /// Hugging Face cache holding model weights
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// Control API port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Serve Prometheus metrics on `metrics_port`
    #[serde(default)]
    pub metrics: bool,

    /// Switch to the largest downloaded model at boot
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_nvidia_smi_command() -> String {
    "nvidia-smi".to_string()
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("/root/.cache/huggingface/hub")
}

fn default_port() -> u16 {
    3000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_auto_start() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate the model catalog
    pub fn registry(&self) -> Result<ModelRegistry> {
        ModelRegistry::new(self.models.clone()).context("Invalid model catalog")
    }
}

/// Timeouts and classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between GPU samples while waiting for evicted memory
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_release_timeout")]
    pub release_timeout_secs: u64,

    /// Deadline for each docker / nvidia-smi call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    #[serde(default = "default_starting_grace")]
    pub starting_grace_secs: u64,

    #[serde(default = "default_health_grace")]
    pub health_grace_secs: u64,

    /// Unhealthy backends older than this are reported failed
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    #[serde(default = "default_oom_margin")]
    pub oom_margin_gb: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            release_timeout_secs: default_release_timeout(),
            call_timeout_secs: default_call_timeout(),
            log_tail_lines: default_log_tail_lines(),
            starting_grace_secs: default_starting_grace(),
            health_grace_secs: default_health_grace(),
            stuck_after_secs: default_stuck_after(),
            oom_margin_gb: default_oom_margin(),
        }
    }
}

fn default_poll_interval() -> u64 {
    3
}

fn default_release_timeout() -> u64 {
    60
}

fn default_call_timeout() -> u64 {
    30
}

fn default_log_tail_lines() -> usize {
    200
}

fn default_starting_grace() -> u64 {
    60
}

fn default_health_grace() -> u64 {
    90
}

fn default_stuck_after() -> u64 {
    900
}

fn default_oom_margin() -> f64 {
    5.0
}

impl SchedulerConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            release_timeout: Duration::from_secs(self.release_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            log_tail_lines: self.log_tail_lines,
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier {
            starting_grace: Duration::from_secs(self.starting_grace_secs),
            health_grace: Duration::from_secs(self.health_grace_secs),
            stuck_after: Duration::from_secs(self.stuck_after_secs),
            oom_margin_gb: self.oom_margin_gb,
        }
    }
}
