use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::shell::error::ShellError;
use crate::shell::logstore::LogStore;
use crate::shell::pump;
use crate::shell::shell_event;

/// Fixed settle window for `start`: early failures (bad directory, command
/// not found through the shell) surface in the synchronous response.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);
const SETTLE_POLL: Duration = Duration::from_millis(50);
/// Bounded wait for a signalled child to exit before escalating.
pub const KILL_WAIT: Duration = Duration::from_secs(5);
/// How long termination paths wait for the pump to flush trailing output.
const PUMP_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM; escalates to SIGKILL when the grace window expires.
    GracefulTerminate,
    /// SIGKILL.
    ForceKill,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::GracefulTerminate => "SIGTERM",
            SignalKind::ForceKill => "SIGKILL",
        }
    }

    pub fn parse(s: &str) -> Option<SignalKind> {
        match s.trim() {
            "SIGTERM" => Some(SignalKind::GracefulTerminate),
            "SIGKILL" => Some(SignalKind::ForceKill),
            _ => None,
        }
    }

    fn signal(&self) -> Signal {
        match self {
            SignalKind::GracefulTerminate => Signal::SIGTERM,
            SignalKind::ForceKill => Signal::SIGKILL,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exited,
    Killed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Exited => "exited",
            RunState::Killed => "killed",
        }
    }
}

/// One invocation of a command. Created by `start`, mutated only under the
/// slot lock, never mutated again once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub command: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Normal exits report the code; signal deaths use `-(signal number)`.
    pub exit_code: Option<i32>,
    pub kill_type: Option<SignalKind>,
    pub log_file: PathBuf,
    pub state: RunState,
}

#[derive(Debug, Clone)]
enum WaitOutcome {
    Exited { code: i32, at: DateTime<Utc> },
    Failed { error: String },
}

/// The single "current child" position plus the handles needed to interact
/// with it. Guarded by one exclusive mutex; mutating operations hold it for
/// their whole duration, so concurrent handlers queue.
#[derive(Default)]
struct Slot {
    epoch: u64,
    run: Option<ChildRun>,
    exit_rx: Option<watch::Receiver<Option<WaitOutcome>>>,
    pump: Option<JoinHandle<()>>,
    waiter: Option<JoinHandle<()>>,
    wait_error: Option<String>,
}

pub struct Supervisor {
    store: Arc<LogStore>,
    slot: Arc<Mutex<Slot>>,
    settle_delay: Duration,
}

impl Supervisor {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self {
            store,
            slot: Arc::new(Mutex::new(Slot::default())),
            settle_delay: SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_settle_delay(store: Arc<LogStore>, settle_delay: Duration) -> Self {
        Self {
            store,
            slot: Arc::new(Mutex::new(Slot::default())),
            settle_delay,
        }
    }

    /// Spawn `command` through the shell as a new process-group leader, then
    /// settle briefly so early failures are visible to the caller.
    pub async fn start(&self, command: &str) -> Result<ChildRun, ShellError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ShellError::BadRequest("command cannot be empty".into()));
        }
        let mut slot = self.slot.lock().await;
        observe_exit(&mut slot);
        if slot
            .run
            .as_ref()
            .is_some_and(|r| r.state == RunState::Running)
        {
            return Err(ShellError::Conflict("process already running".into()));
        }
        self.start_locked(&mut slot, command).await
    }

    async fn start_locked(&self, slot: &mut Slot, command: &str) -> Result<ChildRun, ShellError> {
        let created_at = Utc::now();
        let log_file = self.store.create(created_at)?;
        let appender = self.store.appender(&log_file).await?;

        // One pipe, two write ends: the child's stdout and stderr interleave
        // into a single stream for the pump.
        let (pipe_r, pipe_w) = nix::unistd::pipe()
            .map_err(|e| ShellError::Internal(anyhow::anyhow!("create pipe: {e}")))?;
        let pipe_w2 = pipe_w
            .try_clone()
            .map_err(|e| ShellError::Internal(anyhow::anyhow!("dup pipe: {e}")))?;

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(pipe_w))
            .stderr(Stdio::from(pipe_w2));
        {
            use std::os::unix::process::CommandExt;
            // Group leader, so signals reach the shell and all descendants.
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .map_err(|e| ShellError::Internal(anyhow::anyhow!("failed to start process: {e}")))?;
        // Close the parent's copies of the write ends or the pump never EOFs.
        drop(cmd);

        let pid = child.id();
        let pump_task = tokio::spawn(pump::run(pipe_r, appender));

        slot.epoch = slot.epoch.wrapping_add(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter = tokio::spawn(wait_for_exit(
            Arc::clone(&self.slot),
            child,
            exit_tx,
            slot.epoch,
        ));

        slot.run = Some(ChildRun {
            command: command.to_string(),
            pid,
            created_at,
            stopped_at: None,
            exit_code: None,
            kill_type: None,
            log_file,
            state: RunState::Running,
        });
        slot.exit_rx = Some(exit_rx);
        slot.pump = Some(pump_task);
        slot.waiter = Some(waiter);
        slot.wait_error = None;
        shell_event("supervisor", format!("started pid={pid} command={command:?}"));

        // Settle: sample for early termination, return once terminal or the
        // window ends.
        let deadline = tokio::time::Instant::now() + self.settle_delay;
        loop {
            observe_exit(slot);
            if slot
                .run
                .as_ref()
                .is_some_and(|r| r.state != RunState::Running)
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        Ok(slot.run.clone().expect("slot.run was just set"))
    }

    /// Read-only snapshot with a non-blocking reap check.
    pub async fn status(&self) -> Result<ChildRun, ShellError> {
        let mut slot = self.slot.lock().await;
        if slot.run.is_none() {
            return Err(ShellError::NotFound("no process started".into()));
        }
        observe_exit(&mut slot);
        if let Some(error) = slot.wait_error.clone() {
            return Err(ShellError::Internal(anyhow::anyhow!(error)));
        }
        Ok(slot.run.clone().expect("slot.run checked above"))
    }

    /// Log path of the current run, for the read side.
    pub async fn current_log_file(&self) -> Result<PathBuf, ShellError> {
        let slot = self.slot.lock().await;
        slot.run
            .as_ref()
            .map(|r| r.log_file.clone())
            .ok_or_else(|| ShellError::NotFound("no process started".into()))
    }

    pub async fn kill(&self, kind: SignalKind) -> Result<ChildRun, ShellError> {
        let mut slot = self.slot.lock().await;
        if slot.run.is_none() {
            return Err(ShellError::NotFound("no process to kill".into()));
        }
        observe_exit(&mut slot);
        if slot
            .run
            .as_ref()
            .is_some_and(|r| r.state != RunState::Running)
        {
            return Err(ShellError::BadRequest("process already exited".into()));
        }

        self.terminate_locked(&mut slot, kind, KILL_WAIT).await?;
        if let Some(run) = slot.run.as_mut() {
            run.state = RunState::Killed;
            run.kill_type = Some(kind);
        }
        self.drain_pump_locked(&mut slot).await;
        Ok(slot.run.clone().expect("slot.run checked above"))
    }

    /// Stop the current child (gracefully, within `timeout`) and start a new
    /// run of the remembered command. Atomic: the lock is held throughout, so
    /// no observer ever sees the old run once this returns.
    pub async fn restart(&self, timeout: Duration) -> Result<ChildRun, ShellError> {
        let mut slot = self.slot.lock().await;
        let Some(command) = slot.run.as_ref().map(|r| r.command.clone()) else {
            return Err(ShellError::NotFound("no process to restart".into()));
        };
        observe_exit(&mut slot);
        if slot
            .run
            .as_ref()
            .is_some_and(|r| r.state == RunState::Running)
        {
            self.terminate_locked(&mut slot, SignalKind::GracefulTerminate, timeout)
                .await?;
            if let Some(run) = slot.run.as_mut() {
                run.state = RunState::Killed;
                run.kill_type = Some(SignalKind::GracefulTerminate);
            }
            self.drain_pump_locked(&mut slot).await;
        }
        self.start_locked(&mut slot, &command).await
    }

    /// Lifecycle glue: terminate a running child and drain the pump before
    /// the supervisor process itself exits.
    pub async fn shutdown(&self) {
        let waiter = {
            let mut slot = self.slot.lock().await;
            observe_exit(&mut slot);
            if slot
                .run
                .as_ref()
                .is_some_and(|r| r.state == RunState::Running)
            {
                shell_event("shutdown", "terminating child before exit");
                match self
                    .terminate_locked(&mut slot, SignalKind::GracefulTerminate, KILL_WAIT)
                    .await
                {
                    Ok(()) => {
                        if let Some(run) = slot.run.as_mut() {
                            run.state = RunState::Killed;
                            run.kill_type = Some(SignalKind::GracefulTerminate);
                        }
                    }
                    Err(e) => shell_event("shutdown", format!("terminate failed: {e}")),
                }
            }
            self.drain_pump_locked(&mut slot).await;
            slot.waiter.take()
        };
        // The waiter records the reap under the slot lock, so it can only
        // finish once the lock above is released.
        if let Some(waiter) = waiter {
            let _ = tokio::time::timeout(Duration::from_millis(100), waiter).await;
        }
    }

    /// Wait briefly for the pump to hit EOF and flush; used by termination
    /// paths and by `/start` before rendering a log tail.
    pub async fn drain_pump(&self) {
        let mut slot = self.slot.lock().await;
        self.drain_pump_locked(&mut slot).await;
    }

    /// Signal the child's process group, then wait for the waiter to observe
    /// the exit. A graceful request that outlives `grace` escalates to
    /// SIGKILL. A child that died between the reap check and the signal is
    /// not an error; the waiter's observation settles the outcome either way.
    async fn terminate_locked(
        &self,
        slot: &mut Slot,
        kind: SignalKind,
        grace: Duration,
    ) -> Result<(), ShellError> {
        let Some(run) = slot.run.as_ref() else {
            return Err(ShellError::NotFound("no process to kill".into()));
        };
        let pid = run.pid;
        let mut exit_rx = slot
            .exit_rx
            .clone()
            .ok_or_else(|| ShellError::Internal(anyhow::anyhow!("missing exit channel")))?;

        signal_group(pid, kind.signal())?;

        let outcome = match wait_for_outcome(&mut exit_rx, grace).await {
            Some(outcome) => outcome,
            None => {
                if kind == SignalKind::GracefulTerminate {
                    shell_event(
                        "supervisor",
                        format!("pid={pid} grace expired; escalating to SIGKILL"),
                    );
                    signal_group(pid, Signal::SIGKILL)?;
                }
                wait_for_outcome(&mut exit_rx, KILL_WAIT).await.ok_or_else(|| {
                    ShellError::Internal(anyhow::anyhow!("process {pid} did not exit after SIGKILL"))
                })?
            }
        };
        match outcome {
            WaitOutcome::Exited { code, at } => {
                if let Some(run) = slot.run.as_mut() {
                    if run.state == RunState::Running {
                        run.exit_code = Some(code);
                        run.stopped_at = Some(at);
                        run.state = RunState::Exited;
                    }
                }
                Ok(())
            }
            WaitOutcome::Failed { error } => Err(ShellError::Internal(anyhow::anyhow!(error))),
        }
    }

    async fn drain_pump_locked(&self, slot: &mut Slot) {
        if let Some(pump_task) = slot.pump.take() {
            if tokio::time::timeout(PUMP_DRAIN, pump_task).await.is_err() {
                shell_event("pump", "drain timed out; output pipe still open");
            }
        }
    }
}

fn signal_group(pid: u32, sig: Signal) -> Result<(), ShellError> {
    match kill(Pid::from_raw(-(pid as i32)), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ShellError::Internal(anyhow::anyhow!(
            "signal pgid -{pid}: {e}"
        ))),
    }
}

/// Non-blocking reap check: fold a published wait outcome into the run.
/// The waiter sets `exit_code` and `stopped_at` before the tag flips, and
/// everything happens under the slot lock, so observers always see a
/// consistent triple.
fn observe_exit(slot: &mut Slot) {
    let Some(rx) = slot.exit_rx.as_ref() else {
        return;
    };
    let outcome = (*rx.borrow()).clone();
    let Some(outcome) = outcome else {
        return;
    };
    match outcome {
        WaitOutcome::Exited { code, at } => {
            if let Some(run) = slot.run.as_mut() {
                if run.state == RunState::Running {
                    run.exit_code = Some(code);
                    run.stopped_at = Some(at);
                    run.state = RunState::Exited;
                }
            }
        }
        WaitOutcome::Failed { error } => {
            if slot.wait_error.is_none() {
                slot.wait_error = Some(error);
            }
        }
    }
}

/// Per-run waiter: performs the one blocking OS wait for this child, then
/// publishes the outcome (for the bounded waits in kill/restart) and records
/// it under the slot lock. Exactly one reap per PID.
async fn wait_for_exit(
    slot: Arc<Mutex<Slot>>,
    mut child: std::process::Child,
    exit_tx: watch::Sender<Option<WaitOutcome>>,
    epoch: u64,
) {
    let waited = tokio::task::spawn_blocking(move || child.wait()).await;
    let outcome = match waited {
        Ok(Ok(status)) => WaitOutcome::Exited {
            code: encode_exit_status(&status),
            at: Utc::now(),
        },
        Ok(Err(e)) => WaitOutcome::Failed {
            error: format!("wait for child failed: {e}"),
        },
        Err(e) => WaitOutcome::Failed {
            error: format!("waiter task failed: {e}"),
        },
    };
    if let WaitOutcome::Failed { error } = &outcome {
        shell_event("waiter", format!("outcome=error err={error}"));
    }
    // Publish first so kill/restart can observe without the slot lock (they
    // hold it), then record once the lock frees up.
    let _ = exit_tx.send(Some(outcome));
    let mut slot = slot.lock().await;
    if slot.epoch == epoch {
        observe_exit(&mut slot);
    }
}

async fn wait_for_outcome(
    rx: &mut watch::Receiver<Option<WaitOutcome>>,
    timeout: Duration,
) -> Option<WaitOutcome> {
    match tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await {
        Ok(Ok(value)) => (*value).clone(),
        Ok(Err(_)) => None, // waiter dropped without publishing
        Err(_) => None,     // timed out
    }
}

fn encode_exit_status(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(1),
    }
}
