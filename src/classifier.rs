//! Lifecycle classification of backend processes
//!
//! Backends are opaque: all we can see is whether the process exists, how it
//! exited, what its health probe says and the tail of its log. This module
//! turns those signals into one canonical [`LifecycleState`].
//!
//! The classifier is conservative. A process is only ever
//! `Running` with a positive health signal, and failure causes are derived
//! again from the current log on every poll rather than remembered.

use crate::probe::{HealthState, ProcessInspection};
use crate::registry::ModelSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Canonical state of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotFound,
    Stopped,
    Starting,
    Running,
    Failed,
    InsufficientResources,
}

impl LifecycleState {
    /// States that carry a failure the operator needs to see
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::InsufficientResources)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::InsufficientResources => "insufficient_resources",
        };
        f.write_str(s)
    }
}

/// Why a process failed, as far as its log tells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    OutOfMemory,
    InitFailure,
    /// Nothing in the log explains the failure
    Unknown,
}

/// Result of scanning a log tail for failure markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFinding {
    pub diagnosis: Diagnosis,
    /// The most recent line that matched
    pub evidence: Option<String>,
}

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "outofmemoryerror",
    "less than desired gpu memory utilization",
    "decrease gpu memory utilization",
    "no available memory for the cache blocks",
    "increasing `gpu_memory_utilization`",
    "insufficient gpu memory",
];

const INIT_FAILURE_MARKERS: &[&str] = &[
    "engine core initialization failed",
    "initialization failed",
    "failed to initialize",
    "error while loading",
    "traceback (most recent call last)",
    "runtimeerror",
    "valueerror",
];

fn last_match(text: &str, markers: &[&str]) -> Option<String> {
    text.lines()
        .rev()
        .find(|line| {
            let lower = line.to_lowercase();
            markers.iter().any(|m| lower.contains(m))
        })
        .map(|line| line.trim().to_string())
}

/// Map raw log text to a diagnosis. Out-of-memory markers win over generic
/// initialization failures wherever they appear in the tail.
pub fn scan_logs(text: &str) -> LogFinding {
    if let Some(evidence) = last_match(text, OOM_MARKERS) {
        return LogFinding {
            diagnosis: Diagnosis::OutOfMemory,
            evidence: Some(evidence),
        };
    }
    if let Some(evidence) = last_match(text, INIT_FAILURE_MARKERS) {
        return LogFinding {
            diagnosis: Diagnosis::InitFailure,
            evidence: Some(evidence),
        };
    }
    LogFinding {
        diagnosis: Diagnosis::Unknown,
        evidence: None,
    }
}

/// Output of [`Classifier::classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub state: LifecycleState,
    pub diagnosis: Option<Diagnosis>,
    pub detail: Option<String>,
}

impl Classification {
    fn plain(state: LifecycleState) -> Self {
        Self {
            state,
            diagnosis: None,
            detail: None,
        }
    }

    fn failure(state: LifecycleState, diagnosis: Diagnosis, detail: Option<String>) -> Self {
        Self {
            state,
            diagnosis: Some(diagnosis),
            detail,
        }
    }
}

/// Timing thresholds and safety margin used by the classification rules
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Below this uptime a running process is always `Starting`
    pub starting_grace: Duration,
    /// Below this uptime an unhealthy process is still given time to load
    pub health_grace: Duration,
    /// Past this uptime a process that never became healthy is `Failed`
    pub stuck_after: Duration,
    /// Slack added to available memory before blaming an init failure on it
    pub oom_margin_gb: f64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            starting_grace: Duration::from_secs(60),
            health_grace: Duration::from_secs(90),
            stuck_after: Duration::from_secs(900),
            oom_margin_gb: 5.0,
        }
    }
}

impl Classifier {
    fn uptime(&self, inspection: &ProcessInspection, now: DateTime<Utc>) -> Duration {
        match inspection.started_at {
            Some(started) => (now - started).to_std().unwrap_or(Duration::ZERO),
            // No start time: skip the warm-up window and let health decide
            None => self.starting_grace,
        }
    }

    /// Whether [`classify`](Self::classify) will look at the log tail for
    /// this inspection. Lets callers skip fetching logs for healthy processes.
    pub fn needs_logs(&self, inspection: &ProcessInspection, now: DateTime<Utc>) -> bool {
        if !inspection.present {
            return false;
        }
        if !inspection.running {
            return inspection.exit_code.unwrap_or(0) != 0;
        }
        inspection.health != HealthState::Healthy
            && self.uptime(inspection, now) >= self.health_grace
    }

    pub fn classify(
        &self,
        spec: &ModelSpec,
        inspection: &ProcessInspection,
        logs: Option<&str>,
        available_gb: Option<f64>,
        now: DateTime<Utc>,
    ) -> Classification {
        if !inspection.present {
            return Classification::plain(LifecycleState::NotFound);
        }

        if !inspection.running {
            return match inspection.exit_code.unwrap_or(0) {
                0 => Classification::plain(LifecycleState::Stopped),
                code => {
                    let mut result = self.diagnose(spec, logs, available_gb);
                    if result.detail.is_none() {
                        result.detail = Some(format!("exited with code {}", code));
                    }
                    result
                }
            };
        }

        let uptime = self.uptime(inspection, now);
        if uptime < self.starting_grace {
            return Classification::plain(LifecycleState::Starting);
        }
        if inspection.health == HealthState::Healthy {
            return Classification::plain(LifecycleState::Running);
        }
        if uptime < self.health_grace {
            return Classification::plain(LifecycleState::Starting);
        }

        // Still not healthy after the grace period: treat a stuck load as a
        // failure signal and look for its cause
        let result = self.diagnose(spec, logs, available_gb);
        match result.diagnosis {
            Some(Diagnosis::Unknown) if uptime < self.stuck_after => {
                Classification::plain(LifecycleState::Starting)
            }
            Some(Diagnosis::Unknown) => Classification::failure(
                LifecycleState::Failed,
                Diagnosis::Unknown,
                Some(format!(
                    "not healthy after {}s ({:?})",
                    uptime.as_secs(),
                    inspection.health
                )),
            ),
            _ => result,
        }
    }

    /// The failure branch shared by exited and stuck processes
    fn diagnose(
        &self,
        spec: &ModelSpec,
        logs: Option<&str>,
        available_gb: Option<f64>,
    ) -> Classification {
        let finding = scan_logs(logs.unwrap_or_default());
        match finding.diagnosis {
            Diagnosis::OutOfMemory => Classification::failure(
                LifecycleState::InsufficientResources,
                Diagnosis::OutOfMemory,
                finding.evidence,
            ),
            Diagnosis::InitFailure => {
                let starved = available_gb
                    .is_some_and(|available| spec.required_memory_gb > available + self.oom_margin_gb);
                let state = if starved {
                    LifecycleState::InsufficientResources
                } else {
                    LifecycleState::Failed
                };
                Classification::failure(state, Diagnosis::InitFailure, finding.evidence)
            }
            Diagnosis::Unknown => {
                Classification::failure(LifecycleState::Failed, Diagnosis::Unknown, None)
            }
        }
    }
}
