//! Persistent (duplex) executor: one long-lived `claude` subprocess fed
//! stream-json user messages on stdin.
//!
//! Output is demultiplexed to the single active request; a `result` event
//! closes that request's queue and returns the executor to `idle`. A
//! watchdog restarts the subprocess after an unintended exit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::args::{build_args, Invocation};
use crate::config::{AgentConfig, Overrides};
use crate::event::{decode_frame, Event};
use crate::process::{
    build_command, collect_stderr, drain_stderr, exit_message, spawn_piped, terminate_or_kill,
    wait_or_kill, STDOUT_DRAIN_TIMEOUT,
};
use crate::prompter::{ExecutorOptions, Prompter};
use crate::state::{ResultDetail, SharedState, Status, StatusSnapshot};
use crate::stream::{publish, DoneSignal, EventStream, RunOutcome, QUEUE_CAPACITY};
use crate::submit::spawn_result_drain;
use crate::{Result, SupervisorError};

type Stdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

// ─── PersistentProcess ────────────────────────────────────────────────────

/// Executor that keeps one subprocess alive across many requests.
#[derive(Clone)]
pub struct PersistentProcess {
    inner: Arc<Inner>,
}

struct Inner {
    config: AgentConfig,
    shared: Arc<SharedState<Control>>,
    options: ExecutorOptions,
}

/// Subprocess and request bookkeeping, kept under the executor lock.
#[derive(Default)]
struct Control {
    generation: u64,
    live: Option<LiveProcess>,
    request: Option<ActiveRequest>,
    stop_requested: bool,
    watchdog: Option<CancellationToken>,
}

struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    stdin: Stdin,
    exited: DoneSignal,
    kill: CancellationToken,
}

struct ActiveRequest {
    run_id: String,
    tx: mpsc::Sender<Event>,
    publish_cancel: CancellationToken,
    outcome: RunOutcome,
    done: DoneSignal,
}

impl ActiveRequest {
    /// Record the outcome, wake waiters and close the queue, in that order.
    fn close(self, status: Status) {
        self.outcome.set(status);
        self.done.notify();
        drop(self.tx);
    }
}

impl PersistentProcess {
    pub fn new(config: AgentConfig, options: ExecutorOptions) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(SharedState::new("persistent", Arc::clone(&options.metrics)));
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

    /// Launch the subprocess. Fails with [`SupervisorError::AlreadyStarted`]
    /// while one is alive.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// `true` while a subprocess is alive.
    pub fn is_running(&self) -> bool {
        self.inner.shared.lock().exec.live.is_some()
    }

    /// Send `prompt` to the subprocess and return the response stream.
    ///
    /// Start-time overrides cannot be applied to a running subprocess; any
    /// that are set are logged and ignored.
    pub async fn start_run(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream> {
        overrides.validate()?;
        if !overrides.is_empty() {
            warn!(
                fields = ?overrides.set_fields(),
                "persistent agent cannot apply per-call overrides mid-session; ignoring them"
            );
        }
        let frame = user_message_line(prompt)?;

        if !self.is_running() {
            match self.inner.start() {
                Ok(()) | Err(SupervisorError::AlreadyStarted) => {}
                Err(e) => return Err(e),
            }
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let publish_cancel = self.inner.options.shutdown.child_token();
        let outcome = RunOutcome::default();
        let done = DoneSignal::new();

        let shared = &self.inner.shared;
        let (run_id, stdin) = {
            let mut guard = shared.lock();
            if guard.run.status.is_active() || guard.exec.request.is_some() {
                return Err(SupervisorError::Busy);
            }
            let Some(live) = guard.exec.live.as_ref() else {
                return Err(SupervisorError::NotRunning);
            };
            let stdin = Arc::clone(&live.stdin);
            let run_id = guard.run.begin_run(false);
            shared.set_status(&mut guard.run, Status::Busy);
            guard.exec.request = Some(ActiveRequest {
                run_id: run_id.clone(),
                tx,
                publish_cancel: publish_cancel.clone(),
                outcome: outcome.clone(),
                done,
            });
            (run_id, stdin)
        };

        if let Err(e) = write_frame(&stdin, frame.as_bytes()).await {
            warn!(run_id = %run_id, error = %e, "failed to write prompt to agent stdin");
            let request = {
                let mut guard = shared.lock();
                let ours = guard
                    .exec
                    .request
                    .as_ref()
                    .is_some_and(|r| r.run_id == run_id);
                if ours {
                    shared.finish(&mut guard.run, Status::Error, Some(e.to_string()));
                    guard.exec.request.take()
                } else {
                    None
                }
            };
            if let Some(request) = request {
                request.close(Status::Error);
            }
            return Err(e);
        }

        debug!(run_id = %run_id, "prompt sent to persistent agent");
        Ok(EventStream::new(rx, run_id, outcome, publish_cancel))
    }

    /// Shut the subprocess down for good: cancel the watchdog, close stdin,
    /// SIGTERM, then kill after the grace period.
    pub async fn stop(&self) -> Result<()> {
        let (live, request) = {
            let shared = &self.inner.shared;
            let mut guard = shared.lock();
            if let Some(watchdog) = guard.exec.watchdog.take() {
                watchdog.cancel();
            }
            let live = guard.exec.live.as_ref().map(|p| {
                (
                    p.pid,
                    Arc::clone(&p.stdin),
                    p.exited.clone(),
                    p.kill.clone(),
                )
            });
            if live.is_none() && guard.exec.request.is_none() {
                return Ok(());
            }
            guard.exec.stop_requested = true;
            let request = guard.exec.request.take();
            if request.is_some() {
                shared.finish(&mut guard.run, Status::Stopped, None);
            }
            (live, request)
        };

        if let Some(request) = request {
            request.publish_cancel.cancel();
            request.close(Status::Stopped);
        }

        let Some((pid, stdin, exited, kill)) = live else {
            return Ok(());
        };
        // A writer stuck on a full pipe holds the lock; SIGTERM covers that case.
        if let Ok(mut slot) = stdin.try_lock() {
            slot.take();
        }
        info!(pid, "stopping persistent agent");
        terminate_or_kill(pid, &kill);

        let grace = self.inner.options.grace_period;
        if tokio::time::timeout(grace, exited.wait()).await.is_err() {
            warn!(pid, ?grace, "persistent agent ignored SIGTERM; killing");
            kill.cancel();
            exited.wait().await;
        }
        Ok(())
    }

    /// Completion marker of the active request; already fired when idle.
    pub fn wait_done(&self) -> DoneSignal {
        self.inner
            .shared
            .lock()
            .exec
            .request
            .as_ref()
            .map(|r| r.done.clone())
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
impl Prompter for PersistentProcess {
    async fn run_with_overrides(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream> {
        self.start_run(prompt, overrides).await
    }

    async fn submit(&self, prompt: &str, overrides: &Overrides) -> Result<()> {
        let stream = self.start_run(prompt, overrides).await?;
        spawn_result_drain(
            stream,
            Arc::clone(&self.inner.shared),
            self.inner.options.shutdown.child_token(),
        );
        Ok(())
    }

    fn status(&self) -> StatusSnapshot {
        PersistentProcess::status(self)
    }

    async fn stop(&self) -> Result<()> {
        PersistentProcess::stop(self).await
    }

    fn wait_done(&self) -> DoneSignal {
        PersistentProcess::wait_done(self)
    }

    fn result_detail(&self) -> ResultDetail {
        PersistentProcess::result_detail(self)
    }
}

// ─── Subprocess lifecycle ─────────────────────────────────────────────────

impl Inner {
    fn start(self: &Arc<Self>) -> Result<()> {
        let shared = &self.shared;
        if shared.lock().exec.live.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let args = build_args(&self.config, Invocation::Duplex);
        let mut cmd = build_command(&self.config, &args);
        cmd.stdin(std::process::Stdio::piped());
        let spawned = spawn_piped(&mut cmd, &self.config.binary).and_then(|(mut child, out, err)| {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SupervisorError::Process("stdin not captured".into()))?;
            Ok((child, stdin, out, err))
        });
        let (child, stdin, stdout, stderr) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(error = %e, "failed to start persistent agent");
                let mut guard = shared.lock();
                shared.finish(&mut guard.run, Status::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let pid = child.id();
        let exited = DoneSignal::new();
        let kill = CancellationToken::new();
        let (generation, scope) = {
            let mut guard = shared.lock();
            if guard.exec.live.is_some() {
                // Lost a race with a concurrent start; `child` is killed on drop.
                return Err(SupervisorError::AlreadyStarted);
            }
            guard.exec.generation += 1;
            let generation = guard.exec.generation;
            guard.exec.live = Some(LiveProcess {
                generation,
                pid,
                stdin: Arc::new(tokio::sync::Mutex::new(Some(stdin))),
                exited: exited.clone(),
                kill: kill.clone(),
            });
            guard.exec.stop_requested = false;
            guard.run.reset_subprocess_cost();
            let scope = match &guard.exec.watchdog {
                Some(scope) if !scope.is_cancelled() => scope.clone(),
                _ => {
                    let scope = self.options.shutdown.child_token();
                    guard.exec.watchdog = Some(scope.clone());
                    scope
                }
            };
            guard.run.error = None;
            shared.set_status(&mut guard.run, Status::Idle);
            (generation, scope)
        };
        info!(pid, generation, "persistent agent started");

        let stderr_task = drain_stderr(stderr, format!("persistent-{generation}"));
        let reader = tokio::spawn(read_loop(Arc::clone(self), stdout, scope.clone()));
        tokio::spawn(supervise_exit(
            Arc::clone(self),
            Subprocess {
                generation,
                child,
                reader,
                stderr_task,
                exited: exited.clone(),
                kill,
            },
        ));
        tokio::spawn(watchdog(Arc::clone(self), exited, scope));
        Ok(())
    }

    /// Close the request `run_id` after its `result` event.
    fn complete_request(&self, run_id: &str) {
        let request = {
            let mut guard = self.shared.lock();
            let ours = guard
                .exec
                .request
                .as_ref()
                .is_some_and(|r| r.run_id == run_id);
            if !ours {
                return;
            }
            self.shared.finish(&mut guard.run, Status::Idle, None);
            guard.exec.request.take()
        };
        if let Some(request) = request {
            info!(run_id = %run_id, "persistent request completed");
            request.close(Status::Idle);
        }
    }
}

/// Decode stdout and route each event to the active request.
async fn read_loop(inner: Arc<Inner>, stdout: ChildStdout, scope: CancellationToken) {
    let mut reader = BufReader::new(stdout);
    let mut frame = Vec::new();
    loop {
        frame.clear();
        let read = tokio::select! {
            biased;
            () = scope.cancelled() => break,
            read = reader.read_until(b'\n', &mut frame) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read persistent agent stdout");
                break;
            }
        }
        let event = match decode_frame(&frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "skipping agent output line");
                continue;
            }
        };

        let route = {
            let mut guard = inner.shared.lock();
            guard.run.record_event(&event, inner.shared.metrics.as_ref());
            guard
                .exec
                .request
                .as_ref()
                .map(|r| (r.run_id.clone(), r.tx.clone(), r.publish_cancel.clone()))
        };
        let Some((run_id, tx, cancel)) = route else {
            debug!(kind = event.type_label(), "agent output with no active request");
            continue;
        };

        let is_result = event.is_result();
        if !publish(&tx, event, &cancel).await {
            debug!(run_id = %run_id, "event consumer gone; dropping event");
        }
        drop(tx);
        if is_result {
            inner.complete_request(&run_id);
        }
    }
}

struct Subprocess {
    generation: u64,
    child: Child,
    reader: JoinHandle<()>,
    stderr_task: JoinHandle<String>,
    exited: DoneSignal,
    kill: CancellationToken,
}

/// Wait for the subprocess to exit, then close any open request and record
/// why it went away.
async fn supervise_exit(inner: Arc<Inner>, process: Subprocess) {
    let Subprocess {
        generation,
        mut child,
        mut reader,
        stderr_task,
        exited,
        kill,
    } = process;

    let exit = wait_or_kill(&mut child, &kill, inner.shared.metrics.as_ref()).await;
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
        warn!(generation, "agent stdout still open after exit; abandoning reader");
        reader.abort();
    }
    let stderr_tail = collect_stderr(stderr_task).await;

    let (status, request) = {
        let shared = &inner.shared;
        let mut guard = shared.lock();
        if guard.exec.live.as_ref().map(|p| p.generation) != Some(generation) {
            drop(guard);
            exited.notify();
            return;
        }
        guard.exec.live = None;
        let request = guard.exec.request.take();
        let (status, error) = if guard.exec.stop_requested {
            (Status::Stopped, None)
        } else {
            let message = match &exit {
                Ok(status) => exit_message(*status, &stderr_tail),
                Err(e) => format!("failed to wait for agent process: {e}"),
            };
            (Status::Error, Some(message))
        };
        shared.finish(&mut guard.run, status, error);
        (status, request)
    };

    if status == Status::Stopped {
        info!(generation, "persistent agent stopped");
    } else {
        warn!(generation, "persistent agent exited unexpectedly");
    }
    if let Some(request) = request {
        request.close(status);
    }
    exited.notify();
}

/// Restart the subprocess after an unintended exit, once per exit.
async fn watchdog(inner: Arc<Inner>, exited: DoneSignal, scope: CancellationToken) {
    tokio::select! {
        () = scope.cancelled() => return,
        () = exited.wait() => {}
    }
    let stop_requested = inner.shared.lock().exec.stop_requested;
    if stop_requested || scope.is_cancelled() {
        return;
    }

    let backoff = inner.options.restart_backoff;
    info!(?backoff, "restarting persistent agent");
    tokio::select! {
        () = scope.cancelled() => return,
        () = tokio::time::sleep(backoff) => {}
    }

    let skip = {
        let guard = inner.shared.lock();
        guard.exec.live.is_some() || guard.exec.stop_requested
    };
    if skip {
        debug!("persistent agent already running or stopped; skipping restart");
        return;
    }

    // A failed start leaves status `error`; the next run retries the launch.
    match inner.start() {
        Ok(()) => {
            inner.shared.lock().run.restarts += 1;
            inner.shared.metrics.process_restart();
        }
        Err(SupervisorError::AlreadyStarted) => {
            debug!("persistent agent started concurrently; skipping restart");
        }
        Err(e) => error!(error = %e, "persistent agent restart failed"),
    }
}

// ─── Input framing ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct UserFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserMessage<'a>,
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// One newline-terminated stdin frame carrying `prompt`.
fn user_message_line(prompt: &str) -> Result<String> {
    let frame = UserFrame {
        kind: "user",
        message: UserMessage {
            role: "user",
            content: prompt,
        },
    };
    let mut line = serde_json::to_string(&frame)?;
    line.push('\n');
    Ok(line)
}

async fn write_frame(stdin: &Stdin, frame: &[u8]) -> Result<()> {
    let mut slot = stdin.lock().await;
    let pipe = slot.as_mut().ok_or(SupervisorError::NotRunning)?;
    pipe.write_all(frame).await?;
    pipe.flush().await?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::extract_text;
    use crate::metrics::testing::RecordingMetrics;
    use crate::process::fake_agent;
    use futures::StreamExt;
    use std::time::Duration;

    const ECHO_AGENT: &str = r#"while read -r line; do printf '%s\n' '{"type":"system","session_id":"p1"}' '{"type":"assistant","subtype":"text","text":"hi"}' '{"type":"result","result":"pong","total_cost_usd":0.01}'; done"#;

    fn persistent(script: &str, options: ExecutorOptions) -> PersistentProcess {
        PersistentProcess::new(fake_agent(script), options).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[test]
    fn user_frame_matches_wire_format() {
        assert_eq!(
            user_message_line("say \"hi\"").unwrap(),
            "{\"type\":\"user\",\"message\":{\"role\":\"user\",\"content\":\"say \\\"hi\\\"\"}}\n"
        );
    }

    #[tokio::test]
    async fn serves_many_requests_on_one_subprocess() {
        let p = persistent(ECHO_AGENT, ExecutorOptions::default());
        for _ in 0..3 {
            let events: Vec<_> = p
                .start_run("ping", &Overrides::default())
                .await
                .unwrap()
                .collect()
                .await;
            assert_eq!(events.len(), 3);
            assert_eq!(extract_text(&events), "pong");
            assert_eq!(p.status().status, Status::Idle);
        }
        let snap = p.status();
        assert_eq!(snap.session_id.as_deref(), Some("p1"));
        assert_eq!(snap.restarts, 0);
        assert_eq!(snap.mode, "persistent");
        assert!(p.is_running());
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stream_end_carries_idle_outcome() {
        let p = persistent(ECHO_AGENT, ExecutorOptions::default());
        let mut stream = p.start_run("ping", &Overrides::default()).await.unwrap();
        while stream.next_event().await.is_some() {}
        assert_eq!(stream.outcome(), Some(Status::Idle));
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn writes_framed_prompt() {
        let script = r#"while read -r line; do if [ "$line" = '{"type":"user","message":{"role":"user","content":"ping"}}' ]; then r=ok; else r=bad; fi; printf '{"type":"result","result":"%s"}\n' "$r"; done"#;
        let p = persistent(script, ExecutorOptions::default());
        let events: Vec<_> = p
            .start_run("ping", &Overrides::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(extract_text(&events), "ok");
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_request_while_active_is_busy() {
        let script = r#"while read -r line; do sleep 1; printf '{"type":"result","result":"late"}\n'; done"#;
        let p = persistent(script, ExecutorOptions::default());
        let _first = p.start_run("one", &Overrides::default()).await.unwrap();
        let err = p.start_run("two", &Overrides::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let p = persistent(ECHO_AGENT, ExecutorOptions::default());
        p.start().unwrap();
        assert!(matches!(p.start(), Err(SupervisorError::AlreadyStarted)));
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn overrides_are_ignored_not_rejected() {
        let p = persistent(ECHO_AGENT, ExecutorOptions::default());
        let overrides = Overrides {
            model: Some("opus".into()),
            max_turns: 3,
            ..Overrides::default()
        };
        let events: Vec<_> = p
            .start_run("ping", &overrides)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(extract_text(&events), "pong");
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_exit_restarts_exactly_once() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_restart_backoff(Duration::from_millis(50));
        let p = persistent("read -r line; echo crashed >&2; exit 1", options);

        let mut stream = p.start_run("ping", &Overrides::default()).await.unwrap();
        while stream.next_event().await.is_some() {}
        assert_eq!(stream.outcome(), Some(Status::Error));

        eventually(|| metrics.restarts() == 1 && p.is_running()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.restarts(), 1);
        let snap = p.status();
        assert_eq!(snap.restarts, 1);
        assert_eq!(snap.status, Status::Idle);

        p.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.restarts(), 1);
        assert_eq!(p.status().status, Status::Stopped);
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let script = r#"while read -r line; do printf '\377\376\n{"type":"result","result":"ok"}\n'; done"#;
        let metrics = Arc::new(RecordingMetrics::default());
        let p = persistent(script, ExecutorOptions::default().with_metrics(metrics.clone()));
        for _ in 0..2 {
            let mut stream = p.start_run("ping", &Overrides::default()).await.unwrap();
            let mut events = Vec::new();
            while let Some(event) = stream.next_event().await {
                events.push(event);
            }
            assert_eq!(stream.outcome(), Some(Status::Idle));
            assert_eq!(extract_text(&events), "ok");
        }
        assert!(p.is_running());
        assert_eq!(metrics.restarts(), 0);
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cost_deltas_restart_from_zero_after_restart() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_restart_backoff(Duration::from_millis(50));
        let script = r#"read -r line; printf '{"type":"result","result":"a","total_cost_usd":0.5}\n'; read -r line; exit 1"#;
        let p = persistent(script, options);

        let events: Vec<_> = p
            .start_run("one", &Overrides::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(extract_text(&events), "a");

        let mut crash = p.start_run("two", &Overrides::default()).await.unwrap();
        while crash.next_event().await.is_some() {}
        assert_eq!(crash.outcome(), Some(Status::Error));
        eventually(|| metrics.restarts() == 1 && p.is_running()).await;

        p.start_run("three", &Overrides::default())
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert!((metrics.cost() - 1.0).abs() < 1e-9, "cost {}", metrics.cost());
        assert!((p.status().cost_usd - 1.0).abs() < 1e-9);
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn auto_start_during_backoff_is_not_a_restart() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_restart_backoff(Duration::from_millis(500));
        let script = r#"while read -r line; do case "$line" in *crash*) exit 1;; esac; printf '{"type":"result","result":"ok"}\n'; done"#;
        let p = persistent(script, options);

        let mut crash = p.start_run("crash", &Overrides::default()).await.unwrap();
        while crash.next_event().await.is_some() {}
        assert_eq!(crash.outcome(), Some(Status::Error));

        let events: Vec<_> = p
            .start_run("ping", &Overrides::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(extract_text(&events), "ok");

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(metrics.restarts(), 0);
        assert_eq!(p.status().restarts, 0);
        assert!(p.is_running());
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_kills_agent_that_ignores_sigterm() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_grace_period(Duration::from_millis(200));
        let p = persistent("trap '' TERM; while :; do sleep 1; done", options);
        p.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        p.stop().await.unwrap();
        assert_eq!(metrics.forced_kills(), 1);
        assert!(!p.is_running());
        assert_eq!(p.status().status, Status::Stopped);
        assert_eq!(metrics.restarts(), 0);
    }

    #[tokio::test]
    async fn explicit_stop_never_restarts() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_restart_backoff(Duration::from_millis(50));
        let p = persistent(ECHO_AGENT, options);
        p.start_run("ping", &Overrides::default())
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;

        p.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.restarts(), 0);
        assert!(!p.is_running());
        assert_eq!(p.status().status, Status::Stopped);
    }

    #[tokio::test]
    async fn stop_closes_active_request() {
        let script = r#"while read -r line; do printf '{"type":"system","session_id":"p1"}\n'; done"#;
        let p = persistent(script, ExecutorOptions::default());
        let mut stream = p.start_run("ping", &Overrides::default()).await.unwrap();
        assert!(stream.next_event().await.is_some());

        p.stop().await.unwrap();
        while stream.next_event().await.is_some() {}
        assert_eq!(stream.outcome(), Some(Status::Stopped));
        assert!(p.wait_done().is_done());
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let p = persistent(ECHO_AGENT, ExecutorOptions::default());
        let before = p.status();
        p.stop().await.unwrap();
        assert_eq!(p.status(), before);
    }

    #[tokio::test]
    async fn missing_binary_fails_run_without_restart_loop() {
        let metrics = Arc::new(RecordingMetrics::default());
        let options = ExecutorOptions::default()
            .with_metrics(metrics.clone())
            .with_restart_backoff(Duration::from_millis(10));
        let cfg = AgentConfig {
            binary: "/nonexistent/claude-binary".into(),
            ..AgentConfig::default()
        };
        let p = PersistentProcess::new(cfg, options).unwrap();
        let err = p.start_run("ping", &Overrides::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(p.status().status, Status::Error);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.restarts(), 0);
    }
}
