use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::Instant;

use super::*;
use crate::config::RuntimeSettings;
use crate::test_utils::{FakeLiveness, FakeProcessHost};

struct Fixture {
    _dir: TempDir,
    settings: RuntimeSettings,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("flink-minicluster.jar");
    std::fs::write(&artifact, b"jar").unwrap();
    let config_dir = dir.path().join("conf");
    std::fs::create_dir(&config_dir).unwrap();

    Fixture {
        settings: RuntimeSettings {
            artifact,
            config_dir,
            ..Default::default()
        },
        _dir: dir,
    }
}

fn supervisor(
    settings: RuntimeSettings,
    host: &FakeProcessHost,
    liveness: FakeLiveness,
) -> RuntimeSupervisor {
    RuntimeSupervisor::builder(settings)
        .process_host(Arc::new(host.clone()))
        .liveness_check(Arc::new(liveness))
        .java_executable(PathBuf::from("/usr/bin/java"))
        .build()
}

async fn wait_for_state(supervisor: &RuntimeSupervisor, state: RuntimeState) {
    let mut rx = supervisor.state_watch();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_then_stop_leaves_no_process() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(2));

    let info = sup.start().await.unwrap();
    assert_eq!(sup.status(), RuntimeState::Running);
    assert_eq!(info.process_id, Some(1000));
    assert_eq!(info.gateway_url, "http://localhost:8083");
    assert_eq!(host.live_count(), 1);

    sup.stop().await.unwrap();
    assert_eq!(sup.status(), RuntimeState::Stopped);
    assert_eq!(host.live_count(), 0);
    assert!(sup.info().is_none());
    assert_eq!(
        host.last().unwrap().signals(),
        vec![TerminationSignal::Graceful]
    );
}

#[tokio::test(start_paused = true)]
async fn test_launch_spec_passed_to_host() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings.clone(), &host, FakeLiveness::ready_after(0));

    sup.start().await.unwrap();
    let launches = host.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].program, PathBuf::from("/usr/bin/java"));
    assert!(launches[0].args.contains(&"--gateway-port".to_string()));
    assert_eq!(
        launches[0].env.get("FLINK_CONF_DIR"),
        Some(&fx.settings.config_dir.display().to_string())
    );
    sup.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_never_ready_probe_times_out_and_kills() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::never());

    let started = Instant::now();
    let err = sup.start().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RuntimeError::StartupTimeout { .. }), "{err}");
    assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(31), "{elapsed:?}");
    assert_eq!(sup.status(), RuntimeState::Errored);
    assert_eq!(host.live_count(), 0);
    assert!(
        host.last()
            .unwrap()
            .signals()
            .contains(&TerminationSignal::Forceful)
    );
}

#[tokio::test(start_paused = true)]
async fn test_crash_is_broadcast_once_with_exit_code() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));

    let crashes = Arc::new(Mutex::new(Vec::new()));
    let seen = crashes.clone();
    let _handler = sup.on_crash(move |code| seen.lock().unwrap().push(code));

    sup.start().await.unwrap();
    let process = host.last().unwrap();
    process.exit(ExitOutcome::from_code(137));
    // A second report of the same exit must not produce another crash.
    process.exit(ExitOutcome::from_code(1));

    wait_for_state(&sup, RuntimeState::Errored).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(*crashes.lock().unwrap(), vec![Some(137)]);
    assert!(sup.info().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_requested_stop_is_not_a_crash() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));
    let mut events = sup.subscribe();

    sup.start().await.unwrap();
    sup.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            RuntimeEvent::Crashed { .. } => panic!("stop reported as crash"),
            RuntimeEvent::StateChanged { to, .. } => transitions.push(to),
        }
    }
    assert_eq!(
        transitions,
        vec![
            RuntimeState::Starting,
            RuntimeState::Running,
            RuntimeState::Stopping,
            RuntimeState::Stopped
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_artifact_fails_fast() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let settings = RuntimeSettings {
        artifact: fx.settings.artifact.with_file_name("missing.jar"),
        ..fx.settings.clone()
    };
    let sup = supervisor(settings, &host, FakeLiveness::ready_after(0));

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Configuration { .. }));
    assert!(err.to_string().contains("missing.jar"));
    assert_eq!(sup.status(), RuntimeState::Errored);
    assert!(host.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_is_errored() {
    let fx = fixture();
    let host = FakeProcessHost::new().failing_spawn();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Spawn(_)));
    assert_eq!(sup.status(), RuntimeState::Errored);
}

#[tokio::test(start_paused = true)]
async fn test_stop_escalates_after_grace_period() {
    let fx = fixture();
    let host = FakeProcessHost::new().ignoring_graceful();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));
    sup.start().await.unwrap();

    let started = Instant::now();
    sup.stop().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(sup.status(), RuntimeState::Stopped);
    assert_eq!(
        host.last().unwrap().signals(),
        vec![TerminationSignal::Graceful, TerminationSignal::Forceful]
    );
    assert_eq!(host.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unkillable_process_reports_kill_failure() {
    let fx = fixture();
    let host = FakeProcessHost::new().unkillable();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));
    sup.start().await.unwrap();

    let err = sup.stop().await.unwrap_err();
    assert!(matches!(err, RuntimeError::KillFailed));
    assert_eq!(sup.status(), RuntimeState::Stopping);
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_kill_failure_retries_kill() {
    let fx = fixture();
    let host = FakeProcessHost::new().unkillable();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));
    sup.start().await.unwrap();
    assert!(matches!(
        sup.stop().await.unwrap_err(),
        RuntimeError::KillFailed
    ));

    let retried = tokio::time::timeout(Duration::from_secs(60), sup.stop())
        .await
        .unwrap();
    assert!(matches!(retried, Err(RuntimeError::KillFailed)));
    assert_eq!(
        host.last().unwrap().signals(),
        vec![
            TerminationSignal::Graceful,
            TerminationSignal::Forceful,
            TerminationSignal::Forceful
        ]
    );
    assert_eq!(sup.status(), RuntimeState::Stopping);

    host.last().unwrap().exit(ExitOutcome::from_signal(9));
    wait_for_state(&sup, RuntimeState::Stopped).await;
    sup.stop().await.unwrap();

    let info = sup.start().await.unwrap();
    assert_eq!(info.process_id, Some(1001));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_waits_for_first() {
    let fx = fixture();
    let host = FakeProcessHost::new().ignoring_graceful();
    let sup = Arc::new(supervisor(fx.settings, &host, FakeLiveness::ready_after(0)));
    sup.start().await.unwrap();

    let first = sup.clone();
    let first = tokio::spawn(async move { first.stop().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sup.status(), RuntimeState::Stopping);

    sup.stop().await.unwrap();
    first.await.unwrap().unwrap();
    assert_eq!(sup.status(), RuntimeState::Stopped);
    assert_eq!(
        host.last().unwrap().signals(),
        vec![TerminationSignal::Graceful, TerminationSignal::Forceful]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exit_during_startup_reports_code() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::never());

    let killer = host.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(process) = killer.last() {
                process.exit(ExitOutcome::from_code(1));
                break;
            }
        }
    });

    let started = Instant::now();
    let err = sup.start().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        RuntimeError::ExitedDuringStartup {
            outcome,
            recent_output,
        } => {
            assert_eq!(outcome, ExitOutcome::from_code(1));
            assert!(recent_output.contains("Starting MiniCluster"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sup.status(), RuntimeState::Errored);
}

#[tokio::test(start_paused = true)]
async fn test_start_rejected_while_running() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));
    sup.start().await.unwrap();

    let err = sup.start().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::AlreadyActive {
            state: RuntimeState::Running
        }
    ));
    assert_eq!(host.launches().len(), 1);
    sup.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_aborts_it() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = Arc::new(supervisor(fx.settings, &host, FakeLiveness::never()));

    let starter = sup.clone();
    let start = tokio::spawn(async move { starter.start().await });
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sup.status(), RuntimeState::Starting);

    sup.stop().await.unwrap();
    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, RuntimeError::StartAborted));
    assert_eq!(sup.status(), RuntimeState::Errored);
    assert_eq!(host.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_crash() {
    let fx = fixture();
    let host = FakeProcessHost::new();
    let sup = supervisor(fx.settings, &host, FakeLiveness::ready_after(0));

    sup.start().await.unwrap();
    host.last().unwrap().exit(ExitOutcome::from_code(2));
    wait_for_state(&sup, RuntimeState::Errored).await;

    let info = sup.start().await.unwrap();
    assert_eq!(info.process_id, Some(1001));
    assert_eq!(sup.status(), RuntimeState::Running);
    sup.stop().await.unwrap();
}
