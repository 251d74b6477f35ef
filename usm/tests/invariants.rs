//! Property tests: random command sequences never break the handle/status
//! invariant or double-book a port.

use std::collections::HashSet;

use proptest::prelude::*;
use usm::{ServiceManager, ServiceStatus, UsmError};
use usm_shared::errors::SpawnError;
use usm_test_utils::{FakeController, config_with, fake_manager, template};

const IDS: [&str; 3] = ["web-1", "web-2", "db-1"];

#[derive(Debug, Clone)]
enum Command {
    Start(usize),
    Stop(usize),
    Restart(usize),
    Refresh(usize),
    FailNextSpawn(usize),
    Crash(usize),
    BreakProbe(usize),
    Deregister(usize),
}

fn command() -> impl Strategy<Value = Command> {
    let id = 0..IDS.len();
    prop_oneof![
        4 => id.clone().prop_map(Command::Start),
        3 => id.clone().prop_map(Command::Stop),
        2 => id.clone().prop_map(Command::Restart),
        2 => id.clone().prop_map(Command::Refresh),
        1 => id.clone().prop_map(Command::FailNextSpawn),
        1 => id.clone().prop_map(Command::Crash),
        1 => id.clone().prop_map(Command::BreakProbe),
        1 => id.prop_map(Command::Deregister),
    ]
}

fn check_invariants(manager: &ServiceManager) {
    let mut ports = HashSet::new();
    for instance in manager.list() {
        assert_eq!(
            instance.has_process,
            instance.status.holds_process(),
            "{} in {} has_process={}",
            instance.instance_id,
            instance.status,
            instance.has_process
        );
        assert_eq!(instance.pid.is_some(), instance.status == ServiceStatus::Running);
        if instance.status.holds_process() {
            assert!(
                ports.insert(instance.port),
                "port {} held twice",
                instance.port
            );
        }
        // Commands run to completion one at a time here.
        assert!(!instance.status.is_transient());
    }
}

async fn apply(manager: &ServiceManager, controller: &FakeController, command: &Command) {
    match *command {
        Command::Start(i) => {
            let before = manager.get(IDS[i]).ok();
            let result = manager.start(IDS[i]).await;
            if before.as_ref().map(|b| b.status) == Some(ServiceStatus::Running) {
                assert!(matches!(result, Err(UsmError::AlreadyRunning(_))));
                assert_eq!(manager.get(IDS[i]).unwrap().status, ServiceStatus::Running);
            }
        }
        Command::Stop(i) => {
            let before = manager.get(IDS[i]).ok().map(|b| b.status);
            let result = manager.stop(IDS[i]).await;
            match before {
                None => assert!(matches!(result, Err(UsmError::NotFound(_)))),
                Some(ServiceStatus::Stopped) => {
                    assert!(matches!(result, Err(UsmError::NotRunning(_))));
                    assert_eq!(manager.get(IDS[i]).unwrap().status, ServiceStatus::Stopped);
                }
                Some(_) => {
                    assert_eq!(result.unwrap().status, ServiceStatus::Stopped);
                }
            }
        }
        Command::Restart(i) => {
            let before = manager.get(IDS[i]).ok();
            let result = manager.restart(IDS[i]).await;
            if let (Some(before), Ok(after)) = (before, result) {
                assert_eq!(after.status, ServiceStatus::Running);
                assert_eq!(after.port, before.port);
            }
        }
        Command::Refresh(i) => {
            let _ = manager.refresh(IDS[i]).await;
        }
        Command::FailNextSpawn(i) => {
            controller.fail_next_spawn(IDS[i], SpawnError::Io("scripted".into()));
        }
        Command::Crash(i) => {
            if let Some(handler) = controller.handler(IDS[i]) {
                handler.exit(Some(1));
            }
        }
        Command::BreakProbe(i) => {
            if let Some(handler) = controller.handler(IDS[i]) {
                handler.fail_probes();
            }
        }
        Command::Deregister(i) => {
            let before = manager.get(IDS[i]).ok().map(|b| b.status);
            let result = manager.deregister(IDS[i]);
            match before {
                Some(status) if status.is_idle() => assert!(result.is_ok()),
                _ => assert!(result.is_err()),
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_commands_preserve_invariants(commands in prop::collection::vec(command(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (manager, controller) =
                fake_manager(config_with(vec![template("web", 8080), template("db", 5432)]));
            for command in &commands {
                apply(&manager, &controller, command).await;
                check_invariants(&manager);
            }
            manager.shutdown().await;
            for instance in manager.list() {
                assert!(!instance.has_process);
            }
        });
    }
}
