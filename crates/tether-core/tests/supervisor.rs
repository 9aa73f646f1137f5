#![cfg(unix)]

use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::Path, time::Duration};

use tether_core::{
    config::BackendCommand, ProcessSupervisor, StopOutcome, SupervisorError, SupervisorState,
};

fn sh(dir: &Path, script: &str) -> BackendCommand {
    BackendCommand::new(
        "/bin/sh",
        dir.join("settings.json"),
        dir.join("backend.log"),
    )
    .args(["-c", script, "backend"])
    .stop_timeout(Duration::from_secs(5))
    .poll_interval(None)
    .forward_output(false)
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn missing_executable_is_launch_error_and_stays_idle() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(BackendCommand::new(
        dir.path().join("bin/backend"),
        dir.path().join("settings.json"),
        dir.path().join("backend.log"),
    ));

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch { .. }));
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn stop_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exec sleep 30"));

    let handle = supervisor.start().await.unwrap();
    assert!(handle.pid.is_some());
    assert_eq!(supervisor.state(), SupervisorState::Running { pid: handle.pid });

    let first = supervisor.stop().await.unwrap();
    assert!(matches!(first, StopOutcome::Exited { .. }));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn restart_after_stop_yields_new_handle() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exec sleep 30"));

    let first = supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
    let second = supervisor.start().await.unwrap();

    assert_ne!(first.generation, second.generation);
    assert!(second.pid.is_some());
    assert!(supervisor.state().is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exec sleep 30"));

    let handle = supervisor.start().await.unwrap();
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning { pid } if pid == handle.pid));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn child_ignoring_sigterm_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let command = sh(dir.path(), "trap '' TERM; exec sleep 30")
        .stop_timeout(Duration::from_millis(300));
    let supervisor = ProcessSupervisor::new(command);

    supervisor.start().await.unwrap();
    // let the shell install its trap before we signal it
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = supervisor.stop().await.unwrap();
    assert!(matches!(outcome, StopOutcome::Killed { .. }));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn watch_task_reports_unexpected_exit() {
    let dir = tempfile::tempdir().unwrap();
    let command = sh(dir.path(), "exit 3").poll_interval(Some(Duration::from_millis(20)));
    let supervisor = ProcessSupervisor::new(command);
    let mut states = supervisor.subscribe();

    supervisor.start().await.unwrap();
    let crashed = tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| matches!(state, SupervisorState::Crashed { .. })),
    )
    .await
    .expect("crash was not detected")
    .map(|state| *state)
    .unwrap();
    assert_eq!(crashed, SupervisorState::Crashed { code: Some(3) });

    assert_eq!(supervisor.stop().await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn refresh_detects_exit_without_watch_task() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exit 0"));

    supervisor.start().await.unwrap();
    let mut state = supervisor.state();
    for _ in 0..100 {
        state = supervisor.refresh().await;
        if !state.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, SupervisorState::Crashed { code: Some(0) });

    // a crashed backend may be started again
    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn backend_receives_settings_and_log_paths() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("argv.txt");
    let mut command = sh(
        dir.path(),
        r#"printf '%s\n%s\n' "$1" "$2" > "$ARGV_OUT"; exec sleep 30"#,
    );
    command
        .env
        .insert("ARGV_OUT".into(), out.display().to_string());
    let supervisor = ProcessSupervisor::new(command);

    supervisor.start().await.unwrap();
    let written = eventually(|| {
        std::fs::read_to_string(&out).is_ok_and(|text| text.lines().count() == 2)
    })
    .await;
    assert!(written);
    supervisor.stop().await.unwrap();

    let argv = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<_> = argv.lines().collect();
    assert_eq!(
        lines,
        vec![
            dir.path().join("settings.json").display().to_string(),
            dir.path().join("backend.log").display().to_string(),
        ]
    );
}

#[tokio::test]
async fn forwarded_output_does_not_block_backend() {
    let dir = tempfile::tempdir().unwrap();
    let script = "i=0; while [ $i -lt 2000 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done";
    let command = sh(dir.path(), script).forward_output(true);
    let supervisor = ProcessSupervisor::new(command);

    supervisor.start().await.unwrap();
    let mut state = supervisor.state();
    for _ in 0..200 {
        state = supervisor.refresh().await;
        if !state.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(state, SupervisorState::Crashed { code: Some(0) });
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the pid exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn concurrent_start_and_stop_never_leak_a_backend() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exec sleep 30"));

    for _ in 0..8 {
        let (started, stopped) = tokio::join!(supervisor.start(), supervisor.stop());
        let handle = started.unwrap();
        let pid = handle.pid.unwrap();
        let stopped = stopped.unwrap();

        let state = supervisor.state();
        let follow_up = supervisor.stop().await.unwrap();
        match state {
            SupervisorState::Running { pid: running } => {
                assert_eq!(running, Some(pid));
                assert_eq!(stopped, StopOutcome::NotRunning);
                assert!(matches!(follow_up, StopOutcome::Exited { .. }));
            }
            SupervisorState::Stopped => {
                assert!(matches!(stopped, StopOutcome::Exited { .. }));
                assert_eq!(follow_up, StopOutcome::NotRunning);
            }
            other => panic!("unexpected state after start/stop race: {other:?}"),
        }
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!process_exists(pid), "backend {pid} left running");
    }
}

#[tokio::test]
async fn non_utf8_paths_reach_backend_unchanged() {
    let base = tempfile::tempdir().unwrap();
    let settings_dir = base.path().join(OsStr::from_bytes(b"set\xfftings"));
    std::fs::create_dir(&settings_dir).unwrap();
    let settings_path = settings_dir.join("settings.json");
    std::fs::write(&settings_path, "{}").unwrap();
    let out = base.path().join("seen.txt");

    let mut command = BackendCommand::new(
        "/bin/sh",
        &settings_path,
        settings_dir.join("backend.log"),
    )
    .args([
        "-c",
        r#"if [ -e "$1" ]; then echo exists; else echo missing; fi > "$SEEN_OUT"; exec sleep 30"#,
        "backend",
    ])
    .poll_interval(None)
    .forward_output(false);
    command
        .env
        .insert("SEEN_OUT".into(), out.display().to_string());
    let supervisor = ProcessSupervisor::new(command);

    supervisor.start().await.unwrap();
    let written = eventually(|| {
        std::fs::read_to_string(&out).is_ok_and(|text| text.ends_with('\n'))
    })
    .await;
    supervisor.stop().await.unwrap();

    assert!(written);
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "exists");
}

#[tokio::test]
async fn stop_after_unobserved_exit_reports_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(sh(dir.path(), "exit 4"));

    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        supervisor.stop().await.unwrap(),
        StopOutcome::Exited { code: Some(4) }
    );
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}
