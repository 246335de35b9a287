//! Boot-time choice of a default model
//!
//! Picks the largest fully downloaded model and hands it to
//! [`Scheduler::switch_to`]. There is no separate start path here: whatever
//! admission decides for a normal switch is what happens at boot.

use crate::coordinator::{Scheduler, SwitchResult, SwitchStatus};
use crate::probe::ArtifactStore;
use crate::registry::{ModelRegistry, ModelSpec};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StartupOutcome {
    /// No model has a complete artifact on disk
    NoCandidate,
    Switched(SwitchResult),
    /// The chosen model could not be brought up; nothing is retried
    Skipped { model: String, reason: String },
}

/// The downloaded model with the largest reservation. Ties go to the model
/// listed first.
pub async fn select_default<'a>(
    registry: &'a ModelRegistry,
    artifacts: &dyn ArtifactStore,
    timeout: Duration,
) -> Option<&'a ModelSpec> {
    let mut best: Option<&ModelSpec> = None;
    for spec in registry.iter() {
        let complete = tokio::time::timeout(timeout, artifacts.is_complete(&spec.artifact_key))
            .await
            .unwrap_or_else(|_| {
                warn!(model = %spec.name, "Artifact check timed out, treating as missing");
                false
            });
        debug!(model = %spec.name, complete, "Artifact check");
        if !complete {
            continue;
        }
        if best.is_none_or(|b| spec.required_memory_gb > b.required_memory_gb) {
            best = Some(spec);
        }
    }
    best
}

/// Select a default model and switch to it.
pub async fn auto_start(scheduler: &Scheduler) -> StartupOutcome {
    let timeout = scheduler.timings().call_timeout;
    let Some(spec) = select_default(scheduler.registry(), scheduler.artifacts(), timeout).await
    else {
        warn!("No downloaded model found, skipping auto-start");
        return StartupOutcome::NoCandidate;
    };
    let model = spec.name.clone();
    info!(model = %model, required_gb = spec.required_memory_gb, "Auto-starting default model");

    match scheduler.switch_to(&model).await {
        Ok(result)
            if matches!(
                result.status,
                SwitchStatus::Success | SwitchStatus::AlreadySatisfied
            ) =>
        {
            info!(model = %model, status = ?result.status, "Auto-start complete");
            StartupOutcome::Switched(result)
        }
        Ok(result) => {
            let reason = result
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", result.status));
            warn!(model = %model, status = ?result.status, %reason, "Auto-start skipped");
            StartupOutcome::Skipped { model, reason }
        }
        Err(e) => {
            warn!(model = %model, error = %e, "Auto-start skipped");
            StartupOutcome::Skipped {
                model,
                reason: e.to_string(),
            }
        }
    }
}
