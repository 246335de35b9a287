//! vram-switcher - admission and switching of LLM backends on one shared GPU
//!
//! Several model backends (one process each) share a GPU that cannot hold all
//! of them at once. This library decides which backends must be stopped so a
//! requested model fits, performs the switch one operation at a time and
//! reports an honest lifecycle state for every model.
//!
//! - [`classifier`]: turns process inspection and log tails into a
//!   [`LifecycleState`]
//! - [`admission`]: computes the minimal largest-first eviction plan
//! - [`coordinator`]: the single-flight [`Scheduler`] that executes switches
//! - [`startup`]: picks and loads a default model at boot
//! - [`control`]: a thin HTTP surface over the scheduler

use axum::Router;
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::info;

pub mod admission;
pub mod classifier;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod errors;
pub mod probe;
pub mod process;
pub mod registry;
pub mod startup;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use classifier::{Classifier, Diagnosis, LifecycleState};
pub use config::Config;
pub use control::control_router;
pub use coordinator::{
    ControlAction, ControlOutcome, ModelStatus, Scheduler, StatusSnapshot, SwitchPhase,
    SwitchResult, SwitchStatus, Timings,
};
pub use errors::SchedulerError;
pub use registry::{ModelRegistry, ModelSpec};

use probe::{DockerController, HfCacheStore, NvidiaSmiMeter};

/// Build a [`Scheduler`] backed by docker, nvidia-smi and the local
/// Hugging Face cache.
pub fn build_scheduler(config: &Config) -> anyhow::Result<Scheduler> {
    let registry = config.registry()?;
    info!("Building scheduler with {} models", registry.len());

    let controller = DockerController::from_registry(config.docker_command.clone(), &registry);
    let meter = NvidiaSmiMeter::new(config.nvidia_smi_command.clone(), config.gpu_index);
    let artifacts = HfCacheStore::new(config.artifact_root.clone());

    Ok(Scheduler::builder()
        .registry(registry)
        .controller(Arc::new(controller))
        .meter(Arc::new(meter))
        .artifacts(Arc::new(artifacts))
        .classifier(config.scheduler.classifier())
        .timings(config.scheduler.timings())
        .build())
}

/// Builds a router for the metrics endpoint.
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix must live for the whole program; the exporter registers it
/// globally, so call this once per process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
