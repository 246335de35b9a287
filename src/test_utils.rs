//! In-memory collaborators for tests
//!
//! [`FakeController`] and [`FakeMeter`] are linked: starting a fake backend
//! adds its reserved memory to the meter and stopping it gives the memory
//! back, unless the test asks for the release to be withheld.
//!
//! Only built for tests or with the `test-utils` feature.

use crate::probe::{
    ArtifactStore, GpuMemorySnapshot, GpuMeter, HealthState, ProbeError, ProcessController,
    ProcessInspection,
};
use crate::registry::ModelSpec;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// A spec with an `org/{name}` artifact and a two minute load estimate
pub fn spec(name: &str, required_memory_gb: f64) -> ModelSpec {
    ModelSpec::builder()
        .name(name)
        .required_memory_gb(required_memory_gb)
        .artifact_key(format!("org/{}", name))
        .estimated_load_time_seconds(120)
        .description(format!("{} test model", name))
        .build()
}

#[derive(Debug)]
struct MeterState {
    used_gb: f64,
    total_gb: f64,
    failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeMeter {
    state: Arc<Mutex<MeterState>>,
}

impl FakeMeter {
    pub fn new(total_gb: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeterState {
                used_gb: 0.0,
                total_gb,
                failure: None,
            })),
        }
    }

    pub fn set_used(&self, used_gb: f64) {
        self.state.lock().unwrap().used_gb = used_gb;
    }

    pub fn used(&self) -> f64 {
        self.state.lock().unwrap().used_gb
    }

    /// Make every subsequent sample fail with `message`.
    pub fn fail(&self, message: &str) {
        self.state.lock().unwrap().failure = Some(message.to_string());
    }

    fn adjust(&self, delta_gb: f64) {
        let mut state = self.state.lock().unwrap();
        state.used_gb = (state.used_gb + delta_gb).max(0.0);
    }
}

#[async_trait]
impl GpuMeter for FakeMeter {
    async fn sample(&self) -> Result<GpuMemorySnapshot, ProbeError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.failure {
            return Err(ProbeError::failed("gpu sample", message.clone()));
        }
        Ok(GpuMemorySnapshot::new(state.used_gb, state.total_gb))
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    processes: HashMap<String, ProcessInspection>,
    logs: HashMap<String, String>,
    memory: HashMap<String, f64>,
    started: Vec<String>,
    stopped: Vec<String>,
    leak_on_stop: HashSet<String>,
    stop_failures: HashMap<String, String>,
    start_failures: HashMap<String, String>,
    hang_start: HashSet<String>,
    panic_start: HashSet<String>,
    stop_gates: HashMap<String, Arc<Notify>>,
}

/// Scriptable [`ProcessController`] that records every start and stop
#[derive(Debug, Clone)]
pub struct FakeController {
    state: Arc<Mutex<ControllerState>>,
    meter: FakeMeter,
}

impl FakeController {
    pub fn new(meter: &FakeMeter) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState::default())),
            meter: meter.clone(),
        }
    }

    /// Register how much memory a backend occupies while running.
    pub fn reserve(&self, name: &str, gb: f64) {
        self.state
            .lock()
            .unwrap()
            .memory
            .insert(name.to_string(), gb);
    }

    /// A backend that has been up and healthy for ten minutes.
    pub fn run_healthy(&self, name: &str, gb: f64) {
        self.reserve(name, gb);
        self.state.lock().unwrap().processes.insert(
            name.to_string(),
            ProcessInspection::running(Utc::now() - TimeDelta::minutes(10), HealthState::Healthy),
        );
        self.meter.adjust(gb);
    }

    /// A backend that exited with `exit_code`, leaving `logs` behind.
    pub fn crash(&self, name: &str, exit_code: i64, logs: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .processes
            .insert(name.to_string(), ProcessInspection::exited(exit_code));
        state.logs.insert(name.to_string(), logs.to_string());
    }

    /// Override what `inspect` reports for `name`.
    pub fn set_inspection(&self, name: &str, inspection: ProcessInspection) {
        self.state
            .lock()
            .unwrap()
            .processes
            .insert(name.to_string(), inspection);
    }

    /// Stopping `name` succeeds but its GPU memory is never returned.
    pub fn leak_on_stop(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .leak_on_stop
            .insert(name.to_string());
    }

    pub fn fail_stop(&self, name: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .stop_failures
            .insert(name.to_string(), message.to_string());
    }

    pub fn fail_start(&self, name: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .start_failures
            .insert(name.to_string(), message.to_string());
    }

    /// `start(name)` never returns.
    pub fn hang_start(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .hang_start
            .insert(name.to_string());
    }

    /// `start(name)` panics, taking the caller's task down with it.
    pub fn panic_start(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .panic_start
            .insert(name.to_string());
    }

    /// `stop(name)` blocks until the returned handle is notified.
    pub fn gate_stop(&self, name: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .stop_gates
            .insert(name.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .processes
            .get(name)
            .is_some_and(|p| p.running)
    }
}

#[async_trait]
impl ProcessController for FakeController {
    async fn start(&self, name: &str) -> Result<(), ProbeError> {
        let (hang, explode) = {
            let state = self.state.lock().unwrap();
            if let Some(message) = state.start_failures.get(name) {
                return Err(ProbeError::failed(format!("start {}", name), message.clone()));
            }
            (state.hang_start.contains(name), state.panic_start.contains(name))
        };
        // Lock released first so the fake stays usable afterwards
        if explode {
            panic!("start {} exploded", name);
        }
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = self.state.lock().unwrap();
        state.started.push(name.to_string());
        if state.processes.get(name).is_some_and(|p| p.running) {
            return Ok(());
        }
        state.processes.insert(
            name.to_string(),
            ProcessInspection::running(Utc::now(), HealthState::Starting),
        );
        state.logs.remove(name);
        if let Some(gb) = state.memory.get(name) {
            self.meter.adjust(*gb);
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ProbeError> {
        let gate = self.state.lock().unwrap().stop_gates.get(name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.stop_failures.get(name) {
            return Err(ProbeError::failed(format!("stop {}", name), message.clone()));
        }
        state.stopped.push(name.to_string());

        let was_running = state.processes.get(name).is_some_and(|p| p.running);
        if state.processes.contains_key(name) {
            state
                .processes
                .insert(name.to_string(), ProcessInspection::exited(0));
        }
        if was_running && !state.leak_on_stop.contains(name) {
            if let Some(gb) = state.memory.get(name) {
                self.meter.adjust(-gb);
            }
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ProcessInspection, ProbeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .processes
            .get(name)
            .cloned()
            .unwrap_or_else(ProcessInspection::absent))
    }

    async fn logs(&self, name: &str, _tail_lines: usize) -> Result<String, ProbeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// [`ArtifactStore`] with a fixed set of complete artifacts
#[derive(Debug, Clone, Default)]
pub struct FakeArtifacts {
    complete: HashSet<String>,
    everything: bool,
}

impl FakeArtifacts {
    pub fn all_complete() -> Self {
        Self {
            complete: HashSet::new(),
            everything: true,
        }
    }

    pub fn with_complete(keys: &[&str]) -> Self {
        Self {
            complete: keys.iter().map(|k| k.to_string()).collect(),
            everything: false,
        }
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn is_complete(&self, artifact_key: &str) -> bool {
        self.everything || self.complete.contains(artifact_key)
    }

    async fn approx_size(&self, artifact_key: &str) -> Option<String> {
        self.is_complete(artifact_key)
            .await
            .then(|| "1.0 GB".to_string())
    }
}
