//! Admission: which running models must go so that a target fits
//!
//! All arithmetic uses the reserved memory from the registry, never live
//! per-process measurement, so a plan does not depend on measurement noise.
//! Live GPU samples only say how much is free right now.

use crate::classifier::LifecycleState;
use crate::probe::GpuMemorySnapshot;
use crate::process::BackendProcess;
use crate::registry::{ModelRegistry, ModelSpec};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Victims to evict, in eviction order, to admit `target`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchPlan {
    pub target: String,
    pub victims: Vec<String>,
    /// Reserved memory of the victims
    pub projected_freed_gb: f64,
    pub shortfall_gb: f64,
    pub feasible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Target is already running and healthy
    AlreadySatisfied,
    Plan(SwitchPlan),
}

/// Compute the eviction plan for `target`.
///
/// Largest reservations go first so the fewest models are evicted; ties are
/// broken by name to keep plans stable.
pub fn plan(
    target: &ModelSpec,
    processes: &HashMap<String, BackendProcess>,
    registry: &ModelRegistry,
    snapshot: &GpuMemorySnapshot,
) -> Admission {
    if processes
        .get(&target.name)
        .is_some_and(BackendProcess::is_healthy_running)
    {
        return Admission::AlreadySatisfied;
    }

    let shortfall_gb = (target.required_memory_gb - snapshot.available_gb).max(0.0);
    let mut plan = SwitchPlan {
        target: target.name.clone(),
        victims: Vec::new(),
        projected_freed_gb: 0.0,
        shortfall_gb,
        feasible: true,
    };

    if shortfall_gb == 0.0 {
        return Admission::Plan(plan);
    }

    // Evicting everything cannot make room for a model larger than the card
    if target.required_memory_gb > snapshot.total_gb {
        plan.feasible = false;
        return Admission::Plan(plan);
    }

    let mut candidates: Vec<(&str, f64)> = processes
        .values()
        .filter(|p| p.state == LifecycleState::Running && p.model_name != target.name)
        .map(|p| (p.model_name.as_str(), registry.reserved_gb(&p.model_name)))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    for (name, reserved_gb) in candidates {
        if plan.projected_freed_gb >= shortfall_gb {
            break;
        }
        plan.victims.push(name.to_string());
        plan.projected_freed_gb += reserved_gb;
    }

    plan.feasible = plan.projected_freed_gb >= shortfall_gb;
    Admission::Plan(plan)
}
