//! Lifecycle of the single backend process: spawn, crash watch, bounded stop.

use std::{
    io,
    process::{ExitStatus, Stdio},
    sync::{Arc, Weak},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{watch, Mutex},
    time::{timeout, MissedTickBehavior},
};

use crate::{config::BackendCommand, error::SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running { pid: Option<u32> },
    Stopping,
    Stopped,
    /// The backend exited without being asked to.
    Crashed { code: Option<i32> },
}

impl SupervisorState {
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorState::Running { .. })
    }
}

/// How a call to [`ProcessSupervisor::stop`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Exited { code: Option<i32> },
    /// Graceful termination timed out and the process was killed.
    Killed { code: Option<i32> },
}

/// Identifies one spawned backend; every successful start yields a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendHandle {
    pub pid: Option<u32>,
    pub generation: u64,
}

struct Tracked {
    child: Child,
    handle: BackendHandle,
}

#[derive(Default)]
struct Inner {
    tracked: Option<Tracked>,
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<SupervisorState>,
}

/// Owns exactly one backend child process.
///
/// `start`, `stop` and the crash watch task all serialize on one async mutex,
/// so the child handle is never leaked or terminated twice. State changes are
/// published on a watch channel and can be observed without taking the lock.
pub struct ProcessSupervisor {
    command: BackendCommand,
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(command: BackendCommand) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            command,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                state,
            }),
        }
    }

    /// Last published state.
    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    /// Polls the child right away instead of waiting for the watch task.
    pub async fn refresh(&self) -> SupervisorState {
        let mut inner = self.shared.inner.lock().await;
        self.shared.reap(&mut inner);
        self.state()
    }

    pub async fn start(&self) -> Result<BackendHandle, SupervisorError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.reap(&mut inner);
        if let Some(tracked) = &inner.tracked {
            return Err(SupervisorError::AlreadyRunning {
                pid: tracked.handle.pid,
            });
        }

        let previous = self.state();
        self.shared.publish(SupervisorState::Starting);

        let output = || {
            if self.command.forward_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.argv())
            .envs(&self.command.env)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::error!(
                    program = %self.command.program.display(),
                    error = %source,
                    "failed to launch backend"
                );
                self.shared.publish(previous);
                return Err(SupervisorError::Launch {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };

        inner.generation += 1;
        let handle = BackendHandle {
            pid: child.id(),
            generation: inner.generation,
        };
        if self.command.forward_output {
            forward_output(&mut child, handle.pid);
        }
        inner.tracked = Some(Tracked { child, handle });
        self.shared
            .publish(SupervisorState::Running { pid: handle.pid });
        tracing::info!(
            program = %self.command.program.display(),
            pid = ?handle.pid,
            generation = handle.generation,
            settings = %self.command.settings_path.display(),
            log = %self.command.log_path.display(),
            "backend started"
        );

        if let Some(interval) = self.command.poll_interval {
            tokio::spawn(watch_backend(
                Arc::downgrade(&self.shared),
                handle.generation,
                interval,
            ));
        }
        Ok(handle)
    }

    /// Terminates the backend and waits for it to exit. A no-op when nothing is running.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let mut inner = self.shared.inner.lock().await;
        let Some(mut tracked) = inner.tracked.take() else {
            if matches!(self.state(), SupervisorState::Crashed { .. }) {
                self.shared.publish(SupervisorState::Stopped);
            }
            return Ok(StopOutcome::NotRunning);
        };

        self.shared.publish(SupervisorState::Stopping);
        let result = terminate(&mut tracked, self.command.stop_timeout).await;
        self.shared.publish(SupervisorState::Stopped);

        match &result {
            Ok(outcome) => tracing::info!(
                pid = ?tracked.handle.pid,
                outcome = ?outcome,
                "backend stopped"
            ),
            Err(err) => tracing::error!(
                pid = ?tracked.handle.pid,
                error = %err,
                "backend stop failed; handle released"
            ),
        }
        result
    }
}

impl Shared {
    fn publish(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    /// Clears the handle if the child has already exited on its own.
    fn reap(&self, inner: &mut Inner) -> Option<ExitStatus> {
        let tracked = inner.tracked.as_mut()?;
        match tracked.child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(
                    pid = ?tracked.handle.pid,
                    generation = tracked.handle.generation,
                    status = %status,
                    "backend exited unexpectedly"
                );
                inner.tracked = None;
                self.publish(SupervisorState::Crashed {
                    code: status.code(),
                });
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    pid = ?tracked.handle.pid,
                    error = %err,
                    "failed to poll backend status"
                );
                None
            }
        }
    }
}

async fn watch_backend(shared: Weak<Shared>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().await;
        let current = inner
            .tracked
            .as_ref()
            .is_some_and(|tracked| tracked.handle.generation == generation);
        if !current || shared.reap(&mut inner).is_some() {
            tracing::trace!(generation, "backend watch finished");
            return;
        }
    }
}

async fn terminate(tracked: &mut Tracked, grace: Duration) -> Result<StopOutcome, SupervisorError> {
    match tracked.child.try_wait() {
        Ok(Some(status)) => {
            return Ok(StopOutcome::Exited {
                code: status.code(),
            })
        }
        Ok(None) => {}
        Err(err) => tracing::warn!(
            pid = ?tracked.handle.pid,
            error = %err,
            "failed to poll backend status"
        ),
    }

    if let Err(err) = request_shutdown(&mut tracked.child) {
        tracing::warn!(
            pid = ?tracked.handle.pid,
            error = %err,
            "failed to signal backend"
        );
    }

    match timeout(grace, tracked.child.wait()).await {
        Ok(Ok(status)) => Ok(StopOutcome::Exited {
            code: status.code(),
        }),
        Ok(Err(err)) => Err(SupervisorError::Wait(err)),
        Err(_) => {
            let overrun = SupervisorError::TerminationTimeout {
                pid: tracked.handle.pid,
                grace,
            };
            tracing::warn!(error = %overrun, "killing backend");
            tracked.child.kill().await.map_err(SupervisorError::Wait)?;
            let status = tracked.child.wait().await.map_err(SupervisorError::Wait)?;
            Ok(StopOutcome::Killed {
                code: status.code(),
            })
        }
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain syscall on a pid we still own; the child has not been reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Re-emits backend stdout/stderr lines under the `backend` log target.
fn forward_output(child: &mut Child, pid: Option<u32>) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "backend", pid = ?pid, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "backend", pid = ?pid, "{line}");
            }
        });
    }
}
