//! [`ProcessController`] backed by the `docker` CLI.
//!
//! Each model is served by a pre-created container (`docker create`/compose),
//! so start and stop never change the container definition, they only toggle
//! it. State comes from `docker inspect`, which also carries the result of the
//! container's HEALTHCHECK.

use super::{HealthState, ProbeError, ProcessController, ProcessInspection};
use crate::registry::ModelRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DockerController {
    command: String,
    containers: HashMap<String, String>,
}

/// Subset of `docker inspect --format '{{json .State}}'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerHealth {
    status: String,
}

impl DockerController {
    pub fn new(command: impl Into<String>, containers: HashMap<String, String>) -> Self {
        Self {
            command: command.into(),
            containers,
        }
    }

    /// Map every registered model to its container name.
    pub fn from_registry(command: impl Into<String>, registry: &ModelRegistry) -> Self {
        let containers = registry
            .iter()
            .map(|spec| (spec.name.clone(), spec.process_name().to_string()))
            .collect();
        Self::new(command, containers)
    }

    fn container<'a>(&'a self, name: &'a str) -> &'a str {
        self.containers.get(name).map(String::as_str).unwrap_or(name)
    }

    async fn run(&self, operation: &str, args: &[&str]) -> Result<Output, ProbeError> {
        debug!(command = %self.command, ?args, "Running docker command");
        Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::failed(operation, format!("failed to run {}: {}", self.command, e)))
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn parse_health(status: &str) -> HealthState {
    match status {
        "healthy" => HealthState::Healthy,
        "starting" => HealthState::Starting,
        "unhealthy" => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

/// Docker reports never-started containers with the zero time `0001-01-01T00:00:00Z`.
fn parse_started_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.year() > 1970).then_some(parsed)
}

fn parse_inspection(json: &str) -> Result<ProcessInspection, serde_json::Error> {
    let state: ContainerState = serde_json::from_str(json.trim())?;
    let health = state
        .health
        .as_ref()
        .map(|h| parse_health(&h.status))
        .unwrap_or_default();

    Ok(ProcessInspection {
        present: true,
        running: state.running,
        exit_code: (!state.running).then_some(state.exit_code),
        started_at: parse_started_at(state.started_at.as_deref()),
        health,
    })
}

#[async_trait]
impl ProcessController for DockerController {
    async fn start(&self, name: &str) -> Result<(), ProbeError> {
        let container = self.container(name);
        let operation = format!("start {}", container);
        // `docker start` on a running container is a successful no-op
        let output = self.run(&operation, &["start", container]).await?;
        if !output.status.success() {
            return Err(ProbeError::failed(
                operation,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!(model = %name, container = %container, "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ProbeError> {
        let container = self.container(name);
        let operation = format!("stop {}", container);
        let output = self.run(&operation, &["stop", container]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                debug!(model = %name, container = %container, "Container absent, nothing to stop");
                return Ok(());
            }
            return Err(ProbeError::failed(operation, stderr.trim().to_string()));
        }
        info!(model = %name, container = %container, "Container stopped");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ProcessInspection, ProbeError> {
        let container = self.container(name);
        let operation = format!("inspect {}", container);
        let output = self
            .run(&operation, &["inspect", "--format", "{{json .State}}", container])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(ProcessInspection::absent());
            }
            return Err(ProbeError::failed(operation, stderr.trim().to_string()));
        }

        parse_inspection(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| ProbeError::failed(operation, format!("unexpected inspect output: {}", e)))
    }

    async fn logs(&self, name: &str, tail_lines: usize) -> Result<String, ProbeError> {
        let container = self.container(name);
        let operation = format!("logs {}", container);
        let tail = tail_lines.to_string();
        let output = self
            .run(&operation, &["logs", "--tail", &tail, container])
            .await?;

        if !output.status.success() {
            return Err(ProbeError::failed(
                operation,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        // vLLM writes most of its output to stderr
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}
