//! In-memory record of one backend process
use crate::classifier::{Classification, Diagnosis, LifecycleState};
use crate::probe::{HealthState, ProcessInspection};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What we last learned about a model's backend process.
///
/// Records are created the first time a probe sees a model and only change
/// through [`observe`](Self::observe) (classification on read) or the
/// coordinator's start/stop bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendProcess {
    pub model_name: String,
    pub state: LifecycleState,
    pub health: HealthState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i64>,
    pub last_diagnosis: Option<Diagnosis>,
    pub detail: Option<String>,
    /// Whether the process was up at the last observation, whatever its state
    pub process_running: bool,
    /// The failure to keep reporting while the process runs; only an explicit
    /// start clears it.
    #[serde(skip)]
    latched_failure: Option<Classification>,
    /// We stopped it; a non-zero exit from SIGTERM/SIGKILL is not a failure.
    #[serde(skip)]
    stop_requested: bool,
}

impl BackendProcess {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            state: LifecycleState::NotFound,
            health: HealthState::Unknown,
            started_at: None,
            last_exit_code: None,
            last_diagnosis: None,
            detail: None,
            process_running: false,
            latched_failure: None,
            stop_requested: false,
        }
    }

    /// Fold a fresh classification into the record.
    ///
    /// A failed process is never reported `Starting` or `Running` again until
    /// [`mark_started`](Self::mark_started) records an explicit start, even if
    /// something outside this service revives it.
    pub fn observe(&mut self, inspection: &ProcessInspection, classification: Classification) {
        self.health = inspection.health;
        self.started_at = inspection.started_at;
        self.process_running = inspection.running;
        if !inspection.running {
            self.last_exit_code = inspection.exit_code;
        }

        if self.stop_requested {
            if inspection.present && !inspection.running {
                self.state = LifecycleState::Stopped;
                self.last_diagnosis = None;
                self.detail = None;
                return;
            }
            // Gone entirely, or started again by someone else
            self.stop_requested = false;
        }

        let classification = match &self.latched_failure {
            Some(failure) if inspection.running && !classification.state.is_failure() => {
                failure.clone()
            }
            _ => classification,
        };
        if classification.state.is_failure() {
            self.latched_failure = Some(classification.clone());
        }

        self.state = classification.state;
        self.last_diagnosis = classification.diagnosis;
        self.detail = classification.detail;
    }

    /// Forget error history before a fresh start.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.model_name));
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.state = LifecycleState::Starting;
        self.started_at = Some(now);
        self.health = HealthState::Unknown;
        self.process_running = true;
        self.latched_failure = None;
        self.stop_requested = false;
    }

    pub fn mark_stopped(&mut self) {
        self.state = LifecycleState::Stopped;
        self.health = HealthState::Unknown;
        self.process_running = false;
        self.stop_requested = true;
    }

    pub fn is_healthy_running(&self) -> bool {
        self.state == LifecycleState::Running
    }
}
