//! Integration tests for liveness probing and resource sampling.

use std::sync::Arc;
use std::time::Duration;

use usm::{FailureCause, RefreshOutcome, ServiceStatus, Termination, UsmError};
use usm_test_utils::{config_with, fake_manager, template, wait_for_status};

#[tokio::test]
async fn refresh_updates_metrics() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    controller.handler("web-1").unwrap().set_sample(12.5, 256);

    let outcome = manager.refresh("web-1").await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Sampled(_)));

    let instance = manager.get("web-1").unwrap();
    assert_eq!(instance.cpu_percent, 12.5);
    assert_eq!(instance.memory_mb, 256);
}

#[tokio::test]
async fn refresh_skips_idle_instances() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    manager.stop("web-1").await.unwrap();

    let outcome = manager.refresh("web-1").await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Skipped {
            status: ServiceStatus::Stopped
        }
    );
    assert!(matches!(
        manager.refresh("nope").await,
        Err(UsmError::NotFound(_))
    ));
    assert_eq!(controller.total_spawns(), 1);
}

#[tokio::test]
async fn unexpected_exit_moves_to_error() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    controller.handler("web-1").unwrap().exit(Some(3));

    let outcome = manager.refresh("web-1").await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Exited { code: Some(3) });

    let instance = manager.get("web-1").unwrap();
    assert_eq!(instance.status, ServiceStatus::Error);
    assert!(!instance.has_process);
    assert_eq!(instance.last_error, Some(FailureCause::UnexpectedExit(Some(3))));
    assert_eq!(manager.metrics().unexpected_exits_total, 1);

    // Exited instances free their port.
    let next = manager.start("web-2").await.unwrap();
    assert_eq!(next.port, 8080);
}

#[tokio::test]
async fn exit_while_sampling_is_reported_as_exit() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    let handler = controller.handler("web-1").unwrap();
    handler.exit_on_sample(Some(1));

    let outcome = manager.refresh("web-1").await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Exited { code: Some(1) });

    let instance = manager.get("web-1").unwrap();
    assert_eq!(instance.status, ServiceStatus::Error);
    assert_eq!(instance.last_error, Some(FailureCause::UnexpectedExit(Some(1))));
    assert!(handler.terminations().is_empty());

    let metrics = manager.metrics();
    assert_eq!(metrics.unexpected_exits_total, 1);
    assert_eq!(metrics.probe_failures_total, 0);
}

#[tokio::test]
async fn probe_failure_moves_to_unknown_keeping_metrics() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    let handler = controller.handler("web-1").unwrap();
    handler.set_sample(40.0, 512);
    manager.refresh("web-1").await.unwrap();

    handler.fail_probes();
    let err = manager.refresh("web-1").await.unwrap_err();
    assert!(matches!(err, UsmError::Probe(_)));

    let instance = manager.get("web-1").unwrap();
    assert_eq!(instance.status, ServiceStatus::Unknown);
    assert!(!instance.has_process);
    assert_eq!(instance.cpu_percent, 40.0);
    assert_eq!(instance.memory_mb, 512);
    assert!(matches!(instance.last_error, Some(FailureCause::Probe(_))));

    // The unreachable process was killed on release.
    assert_eq!(handler.terminations(), vec![Termination::Forced]);
    assert_eq!(manager.metrics().probe_failures_total, 1);

    // Unknown can be restarted.
    let restarted = manager.start("web-1").await.unwrap();
    assert_eq!(restarted.status, ServiceStatus::Running);
}

#[tokio::test]
async fn refresh_all_isolates_one_failure() {
    let (manager, controller) = fake_manager(config_with(vec![template("svc", 7000)]));
    let ids: Vec<String> = (1..=4).map(|i| format!("svc-{}", i)).collect();
    for (i, id) in ids.iter().enumerate() {
        manager.start(id).await.unwrap();
        controller.handler(id).unwrap().set_sample(i as f64, 100 + i as u64);
    }
    controller.handler("svc-2").unwrap().fail_probes();

    let report = manager.refresh_all().await;
    assert_eq!(report.sampled.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "svc-2");
    assert!(!report.is_clean());

    for (i, id) in ids.iter().enumerate() {
        let instance = manager.get(id).unwrap();
        if id == "svc-2" {
            assert_eq!(instance.status, ServiceStatus::Unknown);
        } else {
            assert_eq!(instance.status, ServiceStatus::Running);
            assert_eq!(instance.memory_mb, 100 + i as u64);
        }
    }
}

#[tokio::test]
async fn refresh_racing_a_stop_is_discarded() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    let manager = Arc::new(manager);
    manager.start("web-1").await.unwrap();
    let handler = controller.handler("web-1").unwrap();
    let gate = handler.gate_terminate();

    let stopping = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.stop("web-1").await })
    };
    gate.wait_entered(1).await;

    // The probe sees an exited process, but the stop owns the instance now.
    handler.exit(Some(0));
    let outcome = manager.refresh("web-1").await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Skipped {
            status: ServiceStatus::Stopping
        }
    );

    gate.open();
    let stopped = stopping.await.unwrap().unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);
    assert!(stopped.last_error.is_none());
}

#[tokio::test]
async fn periodic_sampler_detects_exit() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    assert!(manager.start_sampler());
    assert!(!manager.start_sampler());

    controller.handler("web-1").unwrap().exit(Some(1));
    wait_for_status(&manager, "web-1", ServiceStatus::Error).await;

    manager.stop_sampler();
    assert!(manager.start_sampler());
    manager.shutdown().await;
}

#[tokio::test]
async fn periodic_sampler_updates_metrics() {
    let (manager, controller) = fake_manager(config_with(vec![template("web", 8080)]));
    manager.start("web-1").await.unwrap();
    controller.handler("web-1").unwrap().set_sample(5.0, 64);
    manager.start_sampler();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.get("web-1").unwrap().memory_mb != 64 {
        assert!(tokio::time::Instant::now() < deadline, "sampler never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.shutdown().await;
}
