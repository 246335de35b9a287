//! Switch coordinator - the single place that changes what is on the GPU
//!
//! A switch is one serialized operation:
//!
//! ```text
//! Idle -> Planning -> Evicting -> AwaitingRelease -> Starting -> Completed
//!                 \__________________________________________\-> Failed
//! ```
//!
//! Exactly one mutating operation (switch, start, stop, restart) holds the
//! switch slot at a time. A second caller gets [`SchedulerError::ResourceBusy`]
//! instead of interleaving with the first. Operations run on their own task,
//! so a caller that goes away mid-switch does not leave victims evicted and
//! the target never started.
//!
//! Evictions are recorded optimistically and never rolled back: if the target
//! fails to start, the evicted models stay stopped and the failure is visible
//! through [`Scheduler::status_snapshot`].

use crate::admission::{self, Admission};
use crate::classifier::{Classifier, Diagnosis, LifecycleState};
use crate::errors::SchedulerError;
use crate::probe::{
    ArtifactStore, GpuMemorySnapshot, GpuMeter, HealthState, ProbeError, ProcessController, bounded,
};
use crate::process::BackendProcess;
use crate::registry::{ModelRegistry, ModelSpec};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Where the in-flight operation is, if any
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SwitchPhase {
    Idle,
    Planning { target: String },
    Evicting { target: String, victim: String },
    AwaitingRelease { target: String },
    Starting { target: String },
    Completed { target: String },
    Failed { target: String, reason: String },
}

impl SwitchPhase {
    /// Whether an operation currently holds the switch slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Planning { .. }
                | Self::Evicting { .. }
                | Self::AwaitingRelease { .. }
                | Self::Starting { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    AlreadySatisfied,
    Success,
    InsufficientMemory,
    ProcessControlError,
}

/// Outcome of [`Scheduler::switch_to`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchResult {
    pub target: String,
    pub status: SwitchStatus,
    pub unloaded_models: Vec<String>,
    /// Reserved memory of the evicted models, not a live measurement
    pub freed_gb: f64,
    pub required_gb: f64,
    pub available_before_gb: f64,
    pub available_after_gb: f64,
    pub estimated_load_time_seconds: u64,
    /// Diagnostic text for failed switches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

/// Outcome of a single-model start/stop/restart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlOutcome {
    pub model: String,
    pub action: ControlAction,
    /// False when the model was already in the requested state
    pub changed: bool,
    pub state: LifecycleState,
}

/// Per-model entry of [`StatusSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub state: LifecycleState,
    pub health: HealthState,
    pub diagnosis: Option<Diagnosis>,
    pub detail: Option<String>,
    pub required_memory_gb: f64,
    pub downloaded: bool,
    pub approx_size: Option<String>,
    pub description: String,
    pub estimated_load_time_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub switching: SwitchPhase,
    pub gpu: Option<GpuMemorySnapshot>,
    pub models: BTreeMap<String, ModelStatus>,
}

/// Polling and deadline settings for the coordinator
#[derive(Debug, Clone)]
pub struct Timings {
    /// Interval between GPU samples while waiting for memory to be released
    pub poll_interval: Duration,
    /// How long evicted memory may take to show up as free
    pub release_timeout: Duration,
    /// Deadline for every individual collaborator call
    pub call_timeout: Duration,
    pub log_tail_lines: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            release_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            log_tail_lines: 200,
        }
    }
}

struct SchedulerInner {
    registry: Arc<ModelRegistry>,
    controller: Arc<dyn ProcessController>,
    meter: Arc<dyn GpuMeter>,
    artifacts: Arc<dyn ArtifactStore>,
    classifier: Classifier,
    timings: Timings,
    records: DashMap<String, BackendProcess>,
    switch_slot: Arc<Mutex<()>>,
    phase: watch::Sender<SwitchPhase>,
}

/// Bookkeeping carried through a switch so failures can still report it
#[derive(Default)]
struct SwitchProgress {
    unloaded_models: Vec<String>,
    freed_gb: f64,
    available_before_gb: f64,
}

/// Owns the collaborators and serializes every change to GPU residency.
///
/// Cheap to clone; clones share the same state and switch slot.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[bon::bon]
impl Scheduler {
    #[builder]
    pub fn new(
        registry: ModelRegistry,
        controller: Arc<dyn ProcessController>,
        meter: Arc<dyn GpuMeter>,
        artifacts: Arc<dyn ArtifactStore>,
        #[builder(default)] classifier: Classifier,
        #[builder(default)] timings: Timings,
    ) -> Self {
        let records = registry
            .iter()
            .map(|spec| (spec.name.clone(), BackendProcess::new(spec.name.clone())))
            .collect();
        let (phase, _) = watch::channel(SwitchPhase::Idle);

        Self {
            inner: Arc::new(SchedulerInner {
                registry: Arc::new(registry),
                controller,
                meter,
                artifacts,
                classifier,
                timings,
                records,
                switch_slot: Arc::new(Mutex::new(())),
                phase,
            }),
        }
    }
}

impl Scheduler {
    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.inner.artifacts.as_ref()
    }

    pub fn timings(&self) -> &Timings {
        &self.inner.timings
    }

    /// Current phase. Never waits on the switch slot.
    pub fn phase(&self) -> SwitchPhase {
        self.inner.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SwitchPhase> {
        self.inner.phase.subscribe()
    }

    /// Last recorded state of a model, without probing.
    pub fn record(&self, model: &str) -> Option<BackendProcess> {
        self.inner.records.get(model).map(|r| r.clone())
    }

    fn resolve(&self, model: &str) -> Result<ModelSpec, SchedulerError> {
        self.inner
            .registry
            .resolve(model)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownModel(model.to_string()))
    }

    fn set_phase(&self, phase: SwitchPhase) {
        debug!(?phase, "Switch phase");
        self.inner.phase.send_replace(phase);
    }

    fn acquire_slot(&self) -> Result<OwnedMutexGuard<()>, SchedulerError> {
        Arc::clone(&self.inner.switch_slot)
            .try_lock_owned()
            .map_err(|_| SchedulerError::ResourceBusy)
    }

    /// Run `op` on its own task while holding `slot`, so it completes even if
    /// the caller's future is dropped.
    async fn detached<T, F, Fut>(
        &self,
        target: &str,
        slot: OwnedMutexGuard<()>,
        op: F,
    ) -> Result<T, SchedulerError>
    where
        F: FnOnce(Scheduler) -> Fut,
        Fut: Future<Output = Result<T, SchedulerError>> + Send + 'static,
        T: Send + 'static,
    {
        let fut = op(self.clone());
        tokio::spawn(async move {
            let _slot = slot;
            fut.await
        })
        .await
        .map_err(|e| {
            let reason = format!("scheduler task failed: {}", e);
            error!(model = %target, %reason, "Operation aborted");
            self.set_phase(SwitchPhase::Failed {
                target: target.to_string(),
                reason: reason.clone(),
            });
            SchedulerError::Internal(reason)
        })?
    }

    fn mutate_record(&self, model: &str, f: impl FnOnce(&mut BackendProcess)) {
        let mut record = self
            .inner
            .records
            .entry(model.to_string())
            .or_insert_with(|| BackendProcess::new(model));
        f(&mut record);
    }

    async fn sample(&self) -> Result<GpuMemorySnapshot, SchedulerError> {
        bounded(
            "gpu sample",
            self.inner.timings.call_timeout,
            self.inner.meter.sample(),
        )
        .await
        .map_err(|e| SchedulerError::process_control("gpu", e))
    }

    /// Inspect one backend and fold the classification into its record.
    async fn probe(
        &self,
        spec: &ModelSpec,
        available_gb: Option<f64>,
    ) -> Result<BackendProcess, ProbeError> {
        let inner = &self.inner;
        let timeout = inner.timings.call_timeout;
        let inspection = bounded(
            &format!("inspect {}", spec.name),
            timeout,
            inner.controller.inspect(&spec.name),
        )
        .await?;

        let now = Utc::now();
        let logs = if inner.classifier.needs_logs(&inspection, now) {
            bounded(
                &format!("logs {}", spec.name),
                timeout,
                inner.controller.logs(&spec.name, inner.timings.log_tail_lines),
            )
            .await
            .map_err(|e| warn!(model = %spec.name, error = %e, "Failed to read logs, classifying without them"))
            .ok()
        } else {
            None
        };

        let classification =
            inner
                .classifier
                .classify(spec, &inspection, logs.as_deref(), available_gb, now);

        let mut record = inner
            .records
            .entry(spec.name.clone())
            .or_insert_with(|| BackendProcess::new(spec.name.clone()));
        record.observe(&inspection, classification);
        Ok(record.clone())
    }

    async fn probe_all(
        &self,
        available_gb: Option<f64>,
    ) -> Result<HashMap<String, BackendProcess>, SchedulerError> {
        let probes: Vec<_> = self
            .inner
            .registry
            .iter()
            .cloned()
            .map(|spec| {
                let this = self.clone();
                async move {
                    let result = this.probe(&spec, available_gb).await;
                    (spec.name, result)
                }
            })
            .collect();
        let results = join_all(probes).await;

        let mut processes = HashMap::with_capacity(results.len());
        for (name, result) in results {
            let record = result.map_err(|e| SchedulerError::process_control(name.clone(), e))?;
            processes.insert(name, record);
        }
        Ok(processes)
    }

    async fn stop_backend(&self, model: &str) -> Result<(), SchedulerError> {
        bounded(
            &format!("stop {}", model),
            self.inner.timings.call_timeout,
            self.inner.controller.stop(model),
        )
        .await
        .map_err(|e| SchedulerError::process_control(model, e))?;
        self.mutate_record(model, BackendProcess::mark_stopped);
        Ok(())
    }

    /// Start `spec`, clearing stale failure bookkeeping first.
    async fn launch(&self, spec: &ModelSpec, prior: LifecycleState) -> Result<(), SchedulerError> {
        self.set_phase(SwitchPhase::Starting {
            target: spec.name.clone(),
        });

        if prior.is_failure() {
            debug!(model = %spec.name, ?prior, "Resetting failed record before start");
            self.mutate_record(&spec.name, BackendProcess::reset);
        }

        bounded(
            &format!("start {}", spec.name),
            self.inner.timings.call_timeout,
            self.inner.controller.start(&spec.name),
        )
        .await
        .map_err(|e| SchedulerError::process_control(spec.name.clone(), e))?;

        self.mutate_record(&spec.name, |r| r.mark_started(Utc::now()));
        info!(
            model = %spec.name,
            estimated_load_time_seconds = spec.estimated_load_time_seconds,
            "Backend started"
        );
        Ok(())
    }

    /// Poll the GPU until `required_gb` is free. Returns the last sample and
    /// whether it satisfied the requirement.
    async fn await_release(
        &self,
        required_gb: f64,
    ) -> Result<(GpuMemorySnapshot, bool), SchedulerError> {
        let timings = &self.inner.timings;
        let deadline = Instant::now() + timings.release_timeout;

        loop {
            let snapshot = self.sample().await?;
            if snapshot.available_gb >= required_gb {
                return Ok((snapshot, true));
            }
            if Instant::now() >= deadline {
                return Ok((snapshot, false));
            }
            debug!(
                available_gb = snapshot.available_gb,
                required_gb, "Waiting for GPU memory to be released"
            );
            tokio::time::sleep(timings.poll_interval).await;
        }
    }

    fn finish(&self, target: &str, result: &Result<SwitchResult, SchedulerError>) {
        let phase = match result {
            Ok(r) if matches!(r.status, SwitchStatus::Success | SwitchStatus::AlreadySatisfied) => {
                SwitchPhase::Completed {
                    target: target.to_string(),
                }
            }
            Ok(r) => SwitchPhase::Failed {
                target: target.to_string(),
                reason: r.message.clone().unwrap_or_default(),
            },
            Err(e) => SwitchPhase::Failed {
                target: target.to_string(),
                reason: e.to_string(),
            },
        };
        self.set_phase(phase);
    }

    /// Make `model` resident, evicting other models if needed.
    ///
    /// Returns [`SchedulerError::UnknownModel`] or
    /// [`SchedulerError::ResourceBusy`] before touching anything; every other
    /// outcome is reported through [`SwitchResult::status`].
    #[instrument(skip(self))]
    pub async fn switch_to(&self, model: &str) -> Result<SwitchResult, SchedulerError> {
        let spec = self.resolve(model)?;
        let slot = self.acquire_slot()?;
        let target = spec.name.clone();

        self.detached(&target, slot, move |this| async move {
            let mut progress = SwitchProgress::default();
            let outcome = this.run_switch(&spec, &mut progress).await;
            let result = match outcome {
                Err(SchedulerError::ProcessControl { model, source }) => {
                    error!(target_model = %spec.name, model = %model, error = %source, "Switch aborted");
                    Ok(this.result(&spec, SwitchStatus::ProcessControlError, progress, None)
                        .with_message(format!("{}: {}", model, source)))
                }
                other => other,
            };
            this.finish(&spec.name, &result);
            result
        })
        .await
    }

    fn result(
        &self,
        spec: &ModelSpec,
        status: SwitchStatus,
        progress: SwitchProgress,
        after: Option<&GpuMemorySnapshot>,
    ) -> SwitchResult {
        SwitchResult {
            target: spec.name.clone(),
            status,
            unloaded_models: progress.unloaded_models,
            freed_gb: progress.freed_gb,
            required_gb: spec.required_memory_gb,
            available_before_gb: progress.available_before_gb,
            available_after_gb: after
                .map(|s| s.available_gb)
                .unwrap_or(progress.available_before_gb),
            estimated_load_time_seconds: spec.estimated_load_time_seconds,
            message: None,
        }
    }

    async fn run_switch(
        &self,
        spec: &ModelSpec,
        progress: &mut SwitchProgress,
    ) -> Result<SwitchResult, SchedulerError> {
        let target = spec.name.clone();
        self.set_phase(SwitchPhase::Planning {
            target: target.clone(),
        });

        let before = self.sample().await?;
        progress.available_before_gb = before.available_gb;
        let processes = self.probe_all(Some(before.available_gb)).await?;

        let plan = match admission::plan(spec, &processes, &self.inner.registry, &before) {
            Admission::AlreadySatisfied => {
                info!(model = %target, "Model already running");
                return Ok(self.result(
                    spec,
                    SwitchStatus::AlreadySatisfied,
                    std::mem::take(progress),
                    Some(&before),
                ));
            }
            Admission::Plan(plan) => plan,
        };

        if !plan.feasible {
            warn!(
                model = %target,
                required_gb = spec.required_memory_gb,
                available_gb = before.available_gb,
                freeable_gb = plan.projected_freed_gb,
                total_gb = before.total_gb,
                "Cannot admit model, nothing evicted"
            );
            let message = format!(
                "{} needs {:.1}GB; {:.1}GB available and {:.1}GB freeable on a {:.1}GB GPU",
                target,
                spec.required_memory_gb,
                before.available_gb,
                plan.projected_freed_gb,
                before.total_gb
            );
            let mut result = self.result(
                spec,
                SwitchStatus::InsufficientMemory,
                std::mem::take(progress),
                Some(&before),
            );
            result.freed_gb = plan.projected_freed_gb;
            return Ok(result.with_message(message));
        }

        info!(
            model = %target,
            victims = ?plan.victims,
            shortfall_gb = plan.shortfall_gb,
            "Switch plan"
        );

        for victim in &plan.victims {
            self.set_phase(SwitchPhase::Evicting {
                target: target.clone(),
                victim: victim.clone(),
            });
            // Counted before the stop is confirmed; there is no rollback
            progress.unloaded_models.push(victim.clone());
            progress.freed_gb += self.inner.registry.reserved_gb(victim);
            info!(model = %victim, "Evicting");
            self.stop_backend(victim).await?;
        }

        let after = if plan.victims.is_empty() {
            before
        } else {
            self.set_phase(SwitchPhase::AwaitingRelease {
                target: target.clone(),
            });
            let (snapshot, released) = self.await_release(spec.required_memory_gb).await?;
            if !released {
                warn!(
                    model = %target,
                    required_gb = spec.required_memory_gb,
                    available_gb = snapshot.available_gb,
                    unloaded = ?progress.unloaded_models,
                    "GPU memory not released in time, evicted models stay stopped"
                );
                let message = format!(
                    "only {:.1}GB of {:.1}GB free after {}s",
                    snapshot.available_gb,
                    spec.required_memory_gb,
                    self.inner.timings.release_timeout.as_secs()
                );
                return Ok(self
                    .result(
                        spec,
                        SwitchStatus::InsufficientMemory,
                        std::mem::take(progress),
                        Some(&snapshot),
                    )
                    .with_message(message));
            }
            snapshot
        };

        let prior = processes
            .get(&target)
            .map(|p| p.state)
            .unwrap_or(LifecycleState::NotFound);
        self.launch(spec, prior).await?;

        info!(
            model = %target,
            unloaded = ?progress.unloaded_models,
            freed_gb = progress.freed_gb,
            available_gb = after.available_gb,
            "Switch complete"
        );
        Ok(self.result(
            spec,
            SwitchStatus::Success,
            std::mem::take(progress),
            Some(&after),
        ))
    }

    /// Start a model without evicting anything.
    #[instrument(skip(self))]
    pub async fn start(&self, model: &str) -> Result<ControlOutcome, SchedulerError> {
        let spec = self.resolve(model)?;
        let slot = self.acquire_slot()?;
        let target = spec.name.clone();

        self.detached(&target, slot, move |this| async move {
            let result = this.run_start(&spec).await;
            this.finish_control(&spec.name, &result);
            result
        })
        .await
    }

    async fn run_start(&self, spec: &ModelSpec) -> Result<ControlOutcome, SchedulerError> {
        self.set_phase(SwitchPhase::Planning {
            target: spec.name.clone(),
        });
        let before = self.sample().await?;
        let processes = self.probe_all(Some(before.available_gb)).await?;
        let (prior, resident) = processes
            .get(&spec.name)
            .map(|p| (p.state, p.process_running))
            .unwrap_or((LifecycleState::NotFound, false));

        if matches!(prior, LifecycleState::Running | LifecycleState::Starting) {
            return Ok(ControlOutcome {
                model: spec.name.clone(),
                action: ControlAction::Start,
                changed: false,
                state: prior,
            });
        }

        // A failed process that is still up already holds its memory
        if !resident
            && let Admission::Plan(plan) =
                admission::plan(spec, &processes, &self.inner.registry, &before)
            && plan.shortfall_gb > 0.0
        {
            return Err(SchedulerError::InsufficientMemory {
                required_gb: spec.required_memory_gb,
                available_gb: before.available_gb,
                freed_gb: 0.0,
            });
        }

        self.launch(spec, prior).await?;
        Ok(ControlOutcome {
            model: spec.name.clone(),
            action: ControlAction::Start,
            changed: true,
            state: LifecycleState::Starting,
        })
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, model: &str) -> Result<ControlOutcome, SchedulerError> {
        let spec = self.resolve(model)?;
        let slot = self.acquire_slot()?;
        let target = spec.name.clone();

        self.detached(&target, slot, move |this| async move {
            let result = this.run_stop(&spec).await.map(|(outcome, _)| outcome);
            this.finish_control(&spec.name, &result);
            result
        })
        .await
    }

    /// Returns the outcome and the state observed before stopping.
    async fn run_stop(
        &self,
        spec: &ModelSpec,
    ) -> Result<(ControlOutcome, LifecycleState), SchedulerError> {
        self.set_phase(SwitchPhase::Evicting {
            target: spec.name.clone(),
            victim: spec.name.clone(),
        });
        let prior = self
            .probe(spec, None)
            .await
            .map_err(|e| SchedulerError::process_control(spec.name.clone(), e))?;
        let changed = prior.process_running;

        self.stop_backend(&spec.name).await?;
        info!(model = %spec.name, changed, "Backend stopped");

        let outcome = ControlOutcome {
            model: spec.name.clone(),
            action: ControlAction::Stop,
            changed,
            state: LifecycleState::Stopped,
        };
        Ok((outcome, prior.state))
    }

    /// Stop and start a model, waiting for its memory to come back in between.
    #[instrument(skip(self))]
    pub async fn restart(&self, model: &str) -> Result<ControlOutcome, SchedulerError> {
        let spec = self.resolve(model)?;
        let slot = self.acquire_slot()?;
        let target = spec.name.clone();

        self.detached(&target, slot, move |this| async move {
            let result = this.run_restart(&spec).await;
            this.finish_control(&spec.name, &result);
            result
        })
        .await
    }

    async fn run_restart(&self, spec: &ModelSpec) -> Result<ControlOutcome, SchedulerError> {
        let (mut outcome, prior) = self.run_stop(spec).await?;

        // Nothing was released if nothing was running
        let (snapshot, released) = if outcome.changed {
            self.set_phase(SwitchPhase::AwaitingRelease {
                target: spec.name.clone(),
            });
            self.await_release(spec.required_memory_gb).await?
        } else {
            let snapshot = self.sample().await?;
            let released = snapshot.available_gb >= spec.required_memory_gb;
            (snapshot, released)
        };
        if !released {
            return Err(SchedulerError::InsufficientMemory {
                required_gb: spec.required_memory_gb,
                available_gb: snapshot.available_gb,
                freed_gb: if outcome.changed {
                    spec.required_memory_gb
                } else {
                    0.0
                },
            });
        }

        self.launch(spec, prior).await?;

        outcome.action = ControlAction::Restart;
        outcome.changed = true;
        outcome.state = LifecycleState::Starting;
        Ok(outcome)
    }

    fn finish_control(&self, target: &str, result: &Result<ControlOutcome, SchedulerError>) {
        let phase = match result {
            Ok(_) => SwitchPhase::Completed {
                target: target.to_string(),
            },
            Err(e) => {
                error!(model = %target, error = %e, "Control operation failed");
                SwitchPhase::Failed {
                    target: target.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        self.set_phase(phase);
    }

    /// Re-derive the state of every model from the collaborators.
    ///
    /// Does not take the switch slot, so it may show a switch in progress.
    /// A failed inspection of one model is reported in its `detail`.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let switching = self.phase();
        let gpu = self
            .sample()
            .await
            .map_err(|e| warn!(error = %e, "Failed to sample GPU for status"))
            .ok();
        let available_gb = gpu.as_ref().map(|g| g.available_gb);
        let timeout = self.inner.timings.call_timeout;

        let entries: Vec<_> = self
            .inner
            .registry
            .iter()
            .cloned()
            .map(|spec| {
                let this = self.clone();
                async move { this.model_status(spec, available_gb, timeout).await }
            })
            .collect();
        let models = join_all(entries).await.into_iter().collect();

        StatusSnapshot {
            switching,
            gpu,
            models,
        }
    }

    async fn model_status(
        &self,
        spec: ModelSpec,
        available_gb: Option<f64>,
        timeout: Duration,
    ) -> (String, ModelStatus) {
        let record = match self.probe(&spec, available_gb).await {
            Ok(record) => record,
            Err(e) => {
                warn!(model = %spec.name, error = %e, "Failed to probe backend for status");
                let mut record = self
                    .record(&spec.name)
                    .unwrap_or_else(|| BackendProcess::new(spec.name.clone()));
                record.detail = Some(e.to_string());
                record
            }
        };

        let artifacts = &self.inner.artifacts;
        let downloaded = tokio::time::timeout(timeout, artifacts.is_complete(&spec.artifact_key))
            .await
            .unwrap_or(false);
        let approx_size = tokio::time::timeout(timeout, artifacts.approx_size(&spec.artifact_key))
            .await
            .ok()
            .flatten();

        let status = ModelStatus {
            state: record.state,
            health: record.health,
            diagnosis: record.last_diagnosis,
            detail: record.detail,
            required_memory_gb: spec.required_memory_gb,
            downloaded,
            approx_size,
            description: spec.description,
            estimated_load_time_seconds: spec.estimated_load_time_seconds,
        };
        (spec.name, status)
    }
}

impl SwitchResult {
    fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProcessInspection;
    use crate::test_utils::{FakeArtifacts, FakeController, FakeMeter, spec};
    use chrono::TimeDelta;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(vec![
            spec("model-a", 81.0),
            spec("model-b", 43.0),
            spec("model-c", 10.0),
        ])
        .unwrap()
    }

    fn timings() -> Timings {
        Timings {
            poll_interval: Duration::from_millis(5),
            release_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_millis(500),
            log_tail_lines: 50,
        }
    }

    fn scheduler(controller: &FakeController, meter: &FakeMeter) -> Scheduler {
        scheduler_with(controller, meter, timings())
    }

    fn scheduler_with(controller: &FakeController, meter: &FakeMeter, timings: Timings) -> Scheduler {
        Scheduler::builder()
            .registry(registry())
            .controller(Arc::new(controller.clone()))
            .meter(Arc::new(meter.clone()))
            .artifacts(Arc::new(FakeArtifacts::all_complete()))
            .timings(timings)
            .build()
    }

    #[tokio::test]
    async fn test_switch_evicts_largest_running_model() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        controller.run_healthy("model-c", 10.0);
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-b").await.unwrap();

        assert_eq!(result.status, SwitchStatus::Success);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
        assert_eq!(result.freed_gb, 81.0);
        assert_eq!(result.available_before_gb, 5.0);
        assert!(result.available_after_gb >= 43.0);
        assert_eq!(controller.stopped(), vec!["model-a"]);
        assert_eq!(controller.started(), vec!["model-b"]);
        assert!(controller.is_running("model-c"));
        assert_eq!(
            scheduler.phase(),
            SwitchPhase::Completed {
                target: "model-b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fitting_target_evicts_nothing() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-b", 43.0);
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-c").await.unwrap();

        assert_eq!(result.status, SwitchStatus::Success);
        assert!(result.unloaded_models.is_empty());
        assert!(controller.stopped().is_empty());
        assert_eq!(controller.started(), vec!["model-c"]);
    }

    #[tokio::test]
    async fn test_running_target_is_idempotent() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-b", 43.0);
        let scheduler = scheduler(&controller, &meter);

        for _ in 0..2 {
            let result = scheduler.switch_to("model-b").await.unwrap();
            assert_eq!(result.status, SwitchStatus::AlreadySatisfied);
            assert!(result.unloaded_models.is_empty());
        }
        assert!(controller.started().is_empty());
        assert!(controller.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_is_validation_error() {
        let meter = FakeMeter::new(96.0);
        let scheduler = scheduler(&FakeController::new(&meter), &meter);
        assert_eq!(
            scheduler.switch_to("gpt-4").await,
            Err(SchedulerError::UnknownModel("gpt-4".to_string()))
        );
    }

    #[tokio::test]
    async fn test_release_timeout_leaves_victims_stopped() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        // Driver never gives the memory back
        controller.leak_on_stop("model-a");
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-b").await.unwrap();

        assert_eq!(result.status, SwitchStatus::InsufficientMemory);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
        assert!(controller.started().is_empty());
        assert!(!controller.is_running("model-a"));
        assert!(matches!(scheduler.phase(), SwitchPhase::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stop_failure_surfaces_process_control_error() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        controller.fail_stop("model-a", "permission denied");
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-b").await.unwrap();

        assert_eq!(result.status, SwitchStatus::ProcessControlError);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
        assert!(result.message.unwrap().contains("permission denied"));
        assert!(controller.started().is_empty());
    }

    #[tokio::test]
    async fn test_hung_start_times_out() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.hang_start("model-c");
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-c").await.unwrap();

        assert_eq!(result.status, SwitchStatus::ProcessControlError);
        assert!(result.message.unwrap().contains("timed out"));
        // The slot is free again
        assert!(scheduler.stop("model-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_target_record_is_reset_before_start() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.crash("model-c", 137, "torch.OutOfMemoryError: CUDA out of memory.");
        let scheduler = scheduler(&controller, &meter);

        let status = scheduler.status_snapshot().await;
        assert_eq!(
            status.models["model-c"].state,
            LifecycleState::InsufficientResources
        );

        let result = scheduler.switch_to("model-c").await.unwrap();
        assert_eq!(result.status, SwitchStatus::Success);

        let record = scheduler.record("model-c").unwrap();
        assert_eq!(record.state, LifecycleState::Starting);
        assert_eq!(record.last_diagnosis, None);
        assert_eq!(record.last_exit_code, None);
    }

    #[tokio::test]
    async fn test_start_refuses_to_overcommit() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        let scheduler = scheduler(&controller, &meter);

        let err = scheduler.start("model-b").await.unwrap_err();
        assert!(matches!(err, SchedulerError::InsufficientMemory { .. }));
        assert!(controller.stopped().is_empty());
        assert!(controller.started().is_empty());

        let outcome = scheduler.start("model-c").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(controller.started(), vec!["model-c"]);
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-b", 43.0);
        let scheduler = scheduler(&controller, &meter);

        let outcome = scheduler.restart("model-b").await.unwrap();
        assert_eq!(outcome.action, ControlAction::Restart);
        assert_eq!(controller.stopped(), vec!["model-b"]);
        assert_eq!(controller.started(), vec!["model-b"]);

        let outcome = scheduler.stop("model-b").await.unwrap();
        assert!(outcome.changed);
        let outcome = scheduler.stop("model-b").await.unwrap();
        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn test_status_snapshot_reports_every_model() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        let scheduler = scheduler(&controller, &meter);

        let status = scheduler.status_snapshot().await;

        assert_eq!(status.switching, SwitchPhase::Idle);
        assert_eq!(status.gpu.unwrap().available_gb, 15.0);
        assert_eq!(status.models.len(), 3);
        assert_eq!(status.models["model-a"].state, LifecycleState::Running);
        assert_eq!(status.models["model-b"].state, LifecycleState::NotFound);
        assert!(status.models["model-b"].downloaded);
        assert_eq!(status.models["model-a"].required_memory_gb, 81.0);
    }

    #[tokio::test]
    async fn test_start_failure_after_eviction_keeps_victims_stopped() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        controller.fail_start("model-b", "image not found");
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-b").await.unwrap();

        assert_eq!(result.status, SwitchStatus::ProcessControlError);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
        assert_eq!(result.freed_gb, 81.0);
        assert!(result.message.unwrap().contains("image not found"));
        // No compensating restart of the victim
        assert_eq!(controller.stopped(), vec!["model-a"]);
        assert!(controller.started().is_empty());
        assert!(!controller.is_running("model-a"));
        assert_eq!(
            scheduler.record("model-a").unwrap().state,
            LifecycleState::Stopped
        );
        assert!(matches!(scheduler.phase(), SwitchPhase::Failed { .. }));
    }

    #[tokio::test]
    async fn test_meter_failure_while_planning() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        meter.fail("NVML: driver not loaded");
        let scheduler = scheduler(&controller, &meter);

        let result = scheduler.switch_to("model-b").await.unwrap();

        assert_eq!(result.status, SwitchStatus::ProcessControlError);
        assert!(result.unloaded_models.is_empty());
        assert!(result.message.unwrap().contains("driver not loaded"));
        assert!(controller.stopped().is_empty());
        assert!(controller.started().is_empty());
    }

    #[tokio::test]
    async fn test_meter_failure_while_awaiting_release() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.run_healthy("model-a", 81.0);
        let gate = controller.gate_stop("model-a");
        let scheduler = scheduler(&controller, &meter);
        let mut phases = scheduler.subscribe_phase();

        let switch = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.switch_to("model-b").await }
        });
        phases
            .wait_for(|phase| matches!(phase, SwitchPhase::Evicting { .. }))
            .await
            .unwrap();
        meter.fail("NVML: unknown error");
        gate.notify_one();

        let result = switch.await.unwrap().unwrap();
        assert_eq!(result.status, SwitchStatus::ProcessControlError);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
        assert!(result.message.unwrap().contains("unknown error"));
        assert!(controller.started().is_empty());
    }

    #[tokio::test]
    async fn test_revived_failed_model_can_be_started_and_evicted() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.crash("model-a", 137, "torch.OutOfMemoryError: CUDA out of memory.");
        let scheduler = scheduler(&controller, &meter);

        let status = scheduler.status_snapshot().await;
        assert_eq!(
            status.models["model-a"].state,
            LifecycleState::InsufficientResources
        );

        // Brought back by docker's restart policy
        controller.set_inspection(
            "model-a",
            ProcessInspection::running(Utc::now() - TimeDelta::seconds(10), HealthState::Starting),
        );
        let status = scheduler.status_snapshot().await;
        assert_eq!(
            status.models["model-a"].state,
            LifecycleState::InsufficientResources
        );

        controller.run_healthy("model-a", 81.0);
        let status = scheduler.status_snapshot().await;
        assert_eq!(
            status.models["model-a"].state,
            LifecycleState::InsufficientResources
        );

        // Its memory is already resident, so start does not refuse it
        let outcome = scheduler.start("model-a").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.state, LifecycleState::Starting);
        let record = scheduler.record("model-a").unwrap();
        assert_eq!(record.last_diagnosis, None);

        let status = scheduler.status_snapshot().await;
        assert_eq!(status.models["model-a"].state, LifecycleState::Running);

        let result = scheduler.switch_to("model-b").await.unwrap();
        assert_eq!(result.status, SwitchStatus::Success);
        assert_eq!(result.unloaded_models, vec!["model-a"]);
    }

    #[tokio::test]
    async fn test_restart_resets_failed_record() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.crash("model-b", 137, "torch.OutOfMemoryError: CUDA out of memory.");
        let scheduler = scheduler(&controller, &meter);

        let status = scheduler.status_snapshot().await;
        assert_eq!(status.models["model-b"].diagnosis, Some(Diagnosis::OutOfMemory));

        let outcome = scheduler.restart("model-b").await.unwrap();
        assert_eq!(outcome.action, ControlAction::Restart);
        assert_eq!(controller.started(), vec!["model-b"]);

        let record = scheduler.record("model-b").unwrap();
        assert_eq!(record.state, LifecycleState::Starting);
        assert_eq!(record.last_exit_code, None);
        assert_eq!(record.last_diagnosis, None);
        assert_eq!(record.detail, None);
    }

    #[tokio::test]
    async fn test_restart_of_stopped_model_does_not_wait_for_release() {
        let meter = FakeMeter::new(96.0);
        // Held by something outside the registry
        meter.set_used(90.0);
        let controller = FakeController::new(&meter);
        let scheduler = scheduler_with(
            &controller,
            &meter,
            Timings {
                release_timeout: Duration::from_secs(30),
                ..timings()
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(2), scheduler.restart("model-b"))
            .await
            .expect("restart waited for memory that was never going to be freed");

        assert!(matches!(
            result,
            Err(SchedulerError::InsufficientMemory { freed_gb, .. }) if freed_gb == 0.0
        ));
        assert!(controller.started().is_empty());
        assert!(!scheduler.phase().is_active());
    }

    #[tokio::test]
    async fn test_panicked_operation_leaves_failed_phase() {
        let meter = FakeMeter::new(96.0);
        let controller = FakeController::new(&meter);
        controller.panic_start("model-c");
        let scheduler = scheduler(&controller, &meter);

        let err = scheduler.switch_to("model-c").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(_)));

        let phase = scheduler.phase();
        assert!(!phase.is_active());
        assert!(matches!(
            phase,
            SwitchPhase::Failed { ref target, .. } if target == "model-c"
        ));
        // The slot was released with the task
        assert!(scheduler.stop("model-a").await.is_ok());
    }
}
