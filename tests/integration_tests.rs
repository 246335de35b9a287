use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use vram_switcher::probe::{HealthState, ProcessInspection};
use vram_switcher::test_utils::{FakeArtifacts, FakeController, FakeMeter, spec};
use vram_switcher::{
    Diagnosis, LifecycleState, ModelRegistry, Scheduler, SchedulerError, SwitchPhase, SwitchStatus,
    Timings, control_router, startup,
};

fn registry() -> ModelRegistry {
    ModelRegistry::new(vec![
        spec("model-a", 81.0),
        spec("model-b", 43.0),
        spec("model-c", 10.0),
        spec("model-huge", 120.0),
    ])
    .unwrap()
}

fn scheduler(controller: &FakeController, meter: &FakeMeter) -> Scheduler {
    Scheduler::builder()
        .registry(registry())
        .controller(Arc::new(controller.clone()))
        .meter(Arc::new(meter.clone()))
        .artifacts(Arc::new(FakeArtifacts::all_complete()))
        .timings(Timings {
            poll_interval: Duration::from_millis(5),
            release_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
            log_tail_lines: 100,
        })
        .build()
}

async fn wait_for_eviction(scheduler: &Scheduler) {
    let mut phases = scheduler.subscribe_phase();
    tokio::time::timeout(
        Duration::from_secs(5),
        phases.wait_for(|phase| matches!(phase, SwitchPhase::Evicting { .. })),
    )
    .await
    .expect("switch never reached eviction")
    .expect("phase channel closed");
}

#[tokio::test]
async fn test_largest_model_evicted_to_admit_target() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.run_healthy("model-a", 81.0);
    controller.run_healthy("model-c", 10.0);
    controller.reserve("model-b", 43.0);
    let scheduler = scheduler(&controller, &meter);

    let result = scheduler.switch_to("model-b").await.unwrap();

    assert_eq!(result.status, SwitchStatus::Success);
    assert_eq!(result.unloaded_models, vec!["model-a"]);
    assert_eq!(result.freed_gb, 81.0);
    assert_eq!(result.required_gb, 43.0);
    assert_eq!(result.available_before_gb, 5.0);
    assert!(result.available_after_gb >= 43.0);
    assert_eq!(result.estimated_load_time_seconds, 120);
    assert!(controller.is_running("model-c"));
    assert!(controller.is_running("model-b"));
    assert!(!controller.is_running("model-a"));
    assert_eq!(meter.used(), 53.0);

    let status = scheduler.status_snapshot().await;
    assert_eq!(status.models["model-a"].state, LifecycleState::Stopped);
    assert_eq!(status.models["model-b"].state, LifecycleState::Starting);
    assert_eq!(status.models["model-c"].state, LifecycleState::Running);
}

#[tokio::test]
async fn test_model_larger_than_gpu_touches_nothing() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    let scheduler = scheduler(&controller, &meter);

    let result = scheduler.switch_to("model-huge").await.unwrap();

    assert_eq!(result.status, SwitchStatus::InsufficientMemory);
    assert!(result.unloaded_models.is_empty());
    assert_eq!(result.required_gb, 120.0);
    assert_eq!(result.available_before_gb, 96.0);
    assert!(result.message.is_some());
    assert!(controller.started().is_empty());
    assert!(controller.stopped().is_empty());
}

#[tokio::test]
async fn test_concurrent_switch_is_rejected_without_eviction() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.run_healthy("model-a", 81.0);
    let gate = controller.gate_stop("model-a");
    let scheduler = scheduler(&controller, &meter);

    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.switch_to("model-b").await }
    });
    wait_for_eviction(&scheduler).await;

    assert_eq!(
        scheduler.switch_to("model-c").await,
        Err(SchedulerError::ResourceBusy)
    );
    assert_eq!(
        scheduler.stop("model-a").await,
        Err(SchedulerError::ResourceBusy)
    );
    // Status reads never wait on the in-flight switch
    let status = tokio::time::timeout(Duration::from_secs(1), scheduler.status_snapshot())
        .await
        .unwrap();
    assert!(status.switching.is_active());

    gate.notify_one();
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.status, SwitchStatus::Success);
    assert_eq!(controller.stopped(), vec!["model-a"]);
    assert_eq!(controller.started(), vec!["model-b"]);
}

#[tokio::test]
async fn test_switch_completes_after_caller_goes_away() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.run_healthy("model-a", 81.0);
    let gate = controller.gate_stop("model-a");
    let scheduler = scheduler(&controller, &meter);

    let caller = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.switch_to("model-b").await }
    });
    wait_for_eviction(&scheduler).await;
    caller.abort();

    let mut phases = scheduler.subscribe_phase();
    gate.notify_one();
    tokio::time::timeout(
        Duration::from_secs(5),
        phases.wait_for(|phase| matches!(phase, SwitchPhase::Completed { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(controller.started(), vec!["model-b"]);
    assert!(!controller.is_running("model-a"));
}

#[tokio::test]
async fn test_oom_crash_is_insufficient_resources_until_restarted() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.crash(
        "model-b",
        137,
        "INFO loading weights\ntorch.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB",
    );
    let scheduler = scheduler(&controller, &meter);

    let status = scheduler.status_snapshot().await;
    let model = &status.models["model-b"];
    assert_eq!(model.state, LifecycleState::InsufficientResources);
    assert_eq!(model.diagnosis, Some(Diagnosis::OutOfMemory));

    // Revived behind our back: still reported as the earlier failure
    controller.set_inspection(
        "model-b",
        ProcessInspection::running(
            chrono::Utc::now() - chrono::TimeDelta::minutes(5),
            HealthState::Healthy,
        ),
    );
    let status = scheduler.status_snapshot().await;
    assert_eq!(
        status.models["model-b"].state,
        LifecycleState::InsufficientResources
    );

    // An explicit start clears it once the backend is healthy
    controller.set_inspection("model-b", ProcessInspection::exited(0));
    scheduler.start("model-b").await.unwrap();
    controller.set_inspection(
        "model-b",
        ProcessInspection::running(
            chrono::Utc::now() - chrono::TimeDelta::minutes(2),
            HealthState::Healthy,
        ),
    );
    let status = scheduler.status_snapshot().await;
    assert_eq!(status.models["model-b"].state, LifecycleState::Running);
}

#[tokio::test]
async fn test_startup_policy_delegates_to_switch() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.run_healthy("model-c", 10.0);
    controller.reserve("model-a", 81.0);
    let scheduler = Scheduler::builder()
        .registry(registry())
        .controller(Arc::new(controller.clone()))
        .meter(Arc::new(meter.clone()))
        .artifacts(Arc::new(FakeArtifacts::with_complete(&[
            "org/model-a",
            "org/model-c",
        ])))
        .build();

    let outcome = startup::auto_start(&scheduler).await;

    let startup::StartupOutcome::Switched(result) = outcome else {
        panic!("expected auto-start to switch, got {:?}", outcome);
    };
    assert_eq!(result.target, "model-a");
    // 81GB fits next to model-c on a 96GB card
    assert!(result.unloaded_models.is_empty());
    assert!(controller.is_running("model-c"));
}

#[tokio::test]
async fn test_control_api_switch_round() {
    let meter = FakeMeter::new(96.0);
    let controller = FakeController::new(&meter);
    controller.run_healthy("model-a", 81.0);
    let server = TestServer::new(control_router(scheduler(&controller, &meter))).unwrap();

    let response = server
        .post("/v1/models/switch")
        .add_query_param("target_model", "MODEL-B")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["unloaded_models"][0], "model-a");
    assert_eq!(body["freed_gb"], 81.0);

    let response = server
        .post("/v1/models/switch")
        .add_query_param("target_model", "model-huge")
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let response = server.post("/v1/models/nope/restart").await;
    response.assert_status_not_found();

    let response = server.get("/v1/models/status").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["models"]["model-a"]["state"], "stopped");
    assert_eq!(body["models"]["model-b"]["required_memory_gb"], 43.0);
    assert_eq!(body["switching"]["phase"], "failed");
}
