//! Ephemeral executor: one `claude` subprocess per run.
//!
//! Also holds the subprocess plumbing shared with the persistent executor:
//! command construction, the stderr drain, exit-message formatting and the
//! graceful termination signal.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::args::{build_args, Invocation};
use crate::config::{AgentConfig, Overrides};
use crate::event::{decode_frame, Event};
use crate::prompter::{ExecutorOptions, Prompter};
use crate::state::{ResultDetail, SharedState, Status, StatusSnapshot};
use crate::stream::{publish, DoneSignal, EventStream, RunOutcome, QUEUE_CAPACITY};
use crate::submit::spawn_result_drain;
use crate::{Result, SupervisorError};

/// Stderr lines kept for the error message of a failed run.
const STDERR_TAIL_LINES: usize = 20;

/// How long the run task waits for stdout to close after the subprocess
/// exited. Grandchildren can hold the pipe open indefinitely.
pub(crate) const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Process ──────────────────────────────────────────────────────────────

/// Executor that spawns one subprocess per run, with the prompt as the last
/// positional argument.
///
/// At most one run is in flight; a second `run` fails with
/// [`SupervisorError::Busy`] instead of queueing.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

struct Inner {
    config: AgentConfig,
    shared: Arc<SharedState<Option<ActiveRun>>>,
    options: ExecutorOptions,
}

/// Control handles of the in-flight run. Lives under the executor lock.
struct ActiveRun {
    run_id: String,
    pid: Option<u32>,
    stop_requested: bool,
    done: DoneSignal,
    kill: CancellationToken,
    publish_cancel: CancellationToken,
}

impl Process {
    pub fn new(config: AgentConfig, options: ExecutorOptions) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(SharedState::new("ephemeral", Arc::clone(&options.metrics)));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                shared,
                options,
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Start a run and return its event stream.
    pub fn start_run(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream> {
        overrides.validate()?;
        let config = self.inner.config.merged(overrides);
        config.validate()?;
        let args = build_args(&config, Invocation::Ephemeral);

        let done = DoneSignal::new();
        let kill = CancellationToken::new();
        let publish_cancel = self.inner.options.shutdown.child_token();

        let shared = &self.inner.shared;
        let run_id = {
            let mut guard = shared.lock();
            if guard.run.status.is_active() {
                return Err(SupervisorError::Busy);
            }
            let run_id = guard.run.begin_run(true);
            shared.set_status(&mut guard.run, Status::Starting);
            guard.exec = Some(ActiveRun {
                run_id: run_id.clone(),
                pid: None,
                stop_requested: false,
                done: done.clone(),
                kill: kill.clone(),
                publish_cancel: publish_cancel.clone(),
            });
            run_id
        };

        let mut cmd = build_command(&config, &args);
        cmd.arg(prompt).stdin(Stdio::null());

        let (child, stdout, stderr) = match spawn_piped(&mut cmd, &config.binary) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to start agent process");
                let mut guard = shared.lock();
                shared.finish(&mut guard.run, Status::Error, Some(e.to_string()));
                guard.exec = None;
                drop(guard);
                done.notify();
                return Err(e);
            }
        };
        let pid = child.id();
        {
            let mut guard = shared.lock();
            if let Some(active) = guard.exec.as_mut() {
                active.pid = pid;
            }
            shared.set_status(&mut guard.run, Status::Busy);
        }
        info!(run_id = %run_id, pid, model = config.model.as_deref(), "agent run started");

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let outcome = RunOutcome::default();
        let stderr_task = drain_stderr(stderr, run_id.clone());

        tokio::spawn(run_to_exit(
            Arc::clone(&self.inner),
            RunTask {
                run_id: run_id.clone(),
                child,
                stdout,
                stderr_task,
                tx,
                outcome: outcome.clone(),
                done,
                kill,
                publish_cancel: publish_cancel.clone(),
            },
        ));

        Ok(EventStream::new(rx, run_id, outcome, publish_cancel))
    }

    /// Stop the in-flight run, if any.
    ///
    /// Sends SIGTERM, waits up to the grace period for the run to finish and
    /// kills the subprocess if it is still alive.
    pub async fn stop(&self) -> Result<()> {
        let (run_id, pid, done, kill, publish_cancel) = {
            let mut guard = self.inner.shared.lock();
            let Some(active) = guard.exec.as_mut() else {
                return Ok(());
            };
            active.stop_requested = true;
            (
                active.run_id.clone(),
                active.pid,
                active.done.clone(),
                active.kill.clone(),
                active.publish_cancel.clone(),
            )
        };

        publish_cancel.cancel();
        info!(run_id = %run_id, pid, "stopping agent run");
        terminate_or_kill(pid, &kill);

        let grace = self.inner.options.grace_period;
        if tokio::time::timeout(grace, done.wait()).await.is_err() {
            warn!(run_id = %run_id, pid, ?grace, "agent ignored SIGTERM; killing");
            kill.cancel();
            done.wait().await;
        }
        Ok(())
    }

    /// Completion marker of the current run; already fired when idle.
    pub fn wait_done(&self) -> DoneSignal {
        self.inner
            .shared
            .lock()
            .exec
            .as_ref()
            .map(|active| active.done.clone())
            .unwrap_or_else(DoneSignal::fired)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.shared.status()
    }

    pub fn result_detail(&self) -> ResultDetail {
        self.inner.shared.result_detail()
    }
}

#[async_trait]
impl Prompter for Process {
    async fn run_with_overrides(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream> {
        self.start_run(prompt, overrides)
    }

    async fn submit(&self, prompt: &str, overrides: &Overrides) -> Result<()> {
        let stream = self.start_run(prompt, overrides)?;
        spawn_result_drain(
            stream,
            Arc::clone(&self.inner.shared),
            self.inner.options.shutdown.child_token(),
        );
        Ok(())
    }

    fn status(&self) -> StatusSnapshot {
        Process::status(self)
    }

    async fn stop(&self) -> Result<()> {
        Process::stop(self).await
    }

    fn wait_done(&self) -> DoneSignal {
        Process::wait_done(self)
    }

    fn result_detail(&self) -> ResultDetail {
        Process::result_detail(self)
    }
}

// ─── Run task ─────────────────────────────────────────────────────────────

struct RunTask {
    run_id: String,
    child: Child,
    stdout: ChildStdout,
    stderr_task: JoinHandle<String>,
    tx: mpsc::Sender<Event>,
    outcome: RunOutcome,
    done: DoneSignal,
    kill: CancellationToken,
    publish_cancel: CancellationToken,
}

/// Own the child until it exits, then classify the run and release the
/// single-flight slot. The queue closes only after the outcome is set.
async fn run_to_exit(inner: Arc<Inner>, task: RunTask) {
    let RunTask {
        run_id,
        mut child,
        stdout,
        stderr_task,
        tx,
        outcome,
        done,
        kill,
        publish_cancel,
    } = task;

    let mut pump = tokio::spawn(pump_stdout(
        Arc::clone(&inner),
        stdout,
        tx.clone(),
        publish_cancel,
        run_id.clone(),
    ));

    let exit = wait_or_kill(&mut child, &kill, inner.shared.metrics.as_ref()).await;

    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut pump).await.is_err() {
        warn!(run_id = %run_id, "agent stdout still open after exit; abandoning reader");
        pump.abort();
    }
    let stderr_tail = collect_stderr(stderr_task).await;

    let status = {
        let shared = &inner.shared;
        let mut guard = shared.lock();
        let stop_requested = guard
            .exec
            .as_ref()
            .is_some_and(|active| active.run_id == run_id && active.stop_requested);
        let (status, error) = classify_exit(stop_requested, &exit, &stderr_tail);
        shared.finish(&mut guard.run, status, error);
        guard.exec = None;
        status
    };
    info!(run_id = %run_id, %status, "agent run finished");

    outcome.set(status);
    done.notify();
    drop(tx);
}

/// Decode stdout line by line, fold each event into the counters and
/// publish it. Once the consumer is gone, keep reading without publishing
/// so the subprocess never blocks on a full pipe.
async fn pump_stdout(
    inner: Arc<Inner>,
    stdout: ChildStdout,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    run_id: String,
) {
    let mut reader = BufReader::new(stdout);
    let mut frame = Vec::new();
    let mut publishing = true;
    loop {
        frame.clear();
        match reader.read_until(b'\n', &mut frame).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to read agent stdout");
                break;
            }
        }
        let event = match decode_frame(&frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "skipping agent output line");
                continue;
            }
        };

        {
            let mut guard = inner.shared.lock();
            guard.run.record_event(&event, inner.shared.metrics.as_ref());
        }

        if publishing && !publish(&tx, event, &cancel).await {
            debug!(run_id = %run_id, "event consumer gone; draining without publishing");
            publishing = false;
        }
    }
}

fn classify_exit(
    stop_requested: bool,
    exit: &std::io::Result<ExitStatus>,
    stderr_tail: &str,
) -> (Status, Option<String>) {
    if stop_requested {
        return (Status::Stopped, None);
    }
    match exit {
        Ok(status) if status.success() => (Status::Idle, None),
        Ok(status) => (Status::Error, Some(exit_message(*status, stderr_tail))),
        Err(e) => (Status::Error, Some(format!("failed to wait for agent process: {e}"))),
    }
}

// ─── Shared subprocess plumbing ───────────────────────────────────────────

/// Base command for `config`: launcher prefix, built flags, working
/// directory and environment. Stdout and stderr are piped; the caller
/// decides stdin and any trailing arguments.
///
/// `CLAUDECODE` is removed so a supervisor running inside an agent session
/// can still launch nested agents.
pub(crate) fn build_command(config: &AgentConfig, args: &[String]) -> Command {
    let mut cmd = Command::new(&config.binary);
    cmd.args(&config.binary_args).args(args);
    cmd.env_remove("CLAUDECODE");
    for (k, v) in &config.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn `cmd` and take its stdout and stderr handles.
pub(crate) fn spawn_piped(
    cmd: &mut Command,
    program: &str,
) -> Result<(Child, ChildStdout, ChildStderr)> {
    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: program.to_owned(),
        source,
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::Process("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SupervisorError::Process("stderr not captured".into()))?;
    Ok((child, stdout, stderr))
}

/// Log every stderr line and hand back the last few once the pipe closes.
pub(crate) fn drain_stderr(stderr: ChildStderr, label: String) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut reader = BufReader::new(stderr);
        let mut frame = Vec::new();
        while matches!(reader.read_until(b'\n', &mut frame).await, Ok(n) if n > 0) {
            let line = String::from_utf8_lossy(&frame).trim_end().to_owned();
            frame.clear();
            debug!(target: "agent_stderr", run = %label, "{line}");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

/// Stderr tail from [`drain_stderr`], or nothing if the pipe stays open.
pub(crate) async fn collect_stderr(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(tail)) => tail,
        _ => String::new(),
    }
}

/// Wait for `child` to exit, killing it once if `kill` fires first.
pub(crate) async fn wait_or_kill(
    child: &mut Child,
    kill: &CancellationToken,
    metrics: &dyn crate::metrics::Metrics,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        exit = child.wait() => exit,
        () = kill.cancelled() => {
            metrics.forced_kill();
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill failed; process already gone");
            }
            child.wait().await
        }
    }
}

/// Error text for a failed exit, with the captured stderr tail.
pub(crate) fn exit_message(status: ExitStatus, stderr: &str) -> String {
    let head = match status.code() {
        Some(code) => format!("agent process exited with code {code}"),
        None => "agent process terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        head
    } else {
        format!("{head}\nstderr: {stderr}")
    }
}

/// Ask `pid` to terminate. Without a pid, or when the signal cannot be
/// sent, fall back to the kill token.
pub(crate) fn terminate_or_kill(pid: Option<u32>, kill: &CancellationToken) {
    let Some(pid) = pid else {
        kill.cancel();
        return;
    };
    if let Err(e) = send_sigterm(pid) {
        warn!(pid, error = %e, "failed to send SIGTERM; killing");
        kill.cancel();
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

/// Config that runs `script` under `sh -c` in place of the real agent.
#[cfg(test)]
pub(crate) fn fake_agent(script: &str) -> AgentConfig {
    AgentConfig {
        binary: "sh".into(),
        binary_args: vec!["-c".into(), script.into(), "fake-agent".into()],
        ..AgentConfig::default()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
