//! The executor contract and its closed set of implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AgentConfig, Overrides};
use crate::event::{extract_text, Event};
use crate::metrics::{Metrics, NoopMetrics};
use crate::persistent::PersistentProcess;
use crate::process::Process;
use crate::state::{ResultDetail, Status, StatusSnapshot};
use crate::stream::{DoneSignal, EventStream};
use crate::{Result, SupervisorError};

/// Wait between SIGTERM and SIGKILL when stopping a subprocess.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Wait before the watchdog restarts a crashed persistent subprocess.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);

// ─── Options ──────────────────────────────────────────────────────────────

/// Collaborators and timings shared by both executors.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub metrics: Arc<dyn Metrics>,
    /// Supervisor scope. Background work that must outlive a request
    /// (submission drains, the watchdog, the persistent read loop) runs
    /// under child tokens of this one.
    pub shutdown: CancellationToken,
    pub grace_period: Duration,
    pub restart_backoff: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            metrics: Arc::new(NoopMetrics),
            shutdown: CancellationToken::new(),
            grace_period: STOP_GRACE_PERIOD,
            restart_backoff: RESTART_BACKOFF,
        }
    }
}

impl ExecutorOptions {
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_restart_backoff(mut self, restart_backoff: Duration) -> Self {
        self.restart_backoff = restart_backoff;
        self
    }
}

// ─── Prompter ─────────────────────────────────────────────────────────────

/// Collected output of a run driven to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub text: String,
    pub events: Vec<Event>,
}

/// What callers need from an executor, whichever strategy backs it.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Start a run with no overrides and stream its events.
    async fn run(&self, prompt: &str) -> Result<EventStream> {
        self.run_with_overrides(prompt, &Overrides::default()).await
    }

    async fn run_with_overrides(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream>;

    /// Run to completion and return the extracted text with every event.
    ///
    /// If `cancel` fires first the executor is stopped and
    /// [`SupervisorError::Cancelled`] is returned. A run that ends in
    /// `error` or `stopped` is reported as [`SupervisorError::Process`].
    async fn run_sync_with_overrides(
        &self,
        prompt: &str,
        overrides: &Overrides,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let mut stream = self.run_with_overrides(prompt, overrides).await?;
        let mut events = Vec::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(run_id = %stream.run_id(), "run cancelled by caller; stopping executor");
                    drop(stream);
                    self.stop().await?;
                    return Err(SupervisorError::Cancelled);
                }
                event = stream.next_event() => match event {
                    Some(event) => events.push(event),
                    None => break,
                },
            }
        }

        match stream.outcome() {
            Some(Status::Idle) | None => Ok(RunOutput {
                text: extract_text(&events),
                events,
            }),
            Some(Status::Stopped) => Err(SupervisorError::Process(
                "run was stopped before it completed".into(),
            )),
            Some(_) => Err(SupervisorError::Process(
                self.status()
                    .error
                    .unwrap_or_else(|| "run failed".to_string()),
            )),
        }
    }

    /// Start a run and collect its result in the background. The stored
    /// result is replaced only when the run completes successfully.
    async fn submit(&self, prompt: &str, overrides: &Overrides) -> Result<()>;

    /// Non-blocking snapshot of the executor state.
    fn status(&self) -> StatusSnapshot;

    /// Stop the current work. A no-op when nothing is running.
    async fn stop(&self) -> Result<()>;

    /// Completion marker of the current run.
    fn wait_done(&self) -> DoneSignal;

    /// Untruncated last result with its full event history.
    fn result_detail(&self) -> ResultDetail;

    /// The status snapshot as JSON bytes.
    fn status_as_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.status()).unwrap_or_default()
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────

/// Which executor strategy to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Ephemeral,
    Persistent,
}

/// The two executor strategies behind one [`Prompter`] surface, chosen once
/// at startup.
#[derive(Clone)]
pub enum Executor {
    Ephemeral(Process),
    Persistent(PersistentProcess),
}

impl Executor {
    pub fn new(mode: Mode, config: AgentConfig, options: ExecutorOptions) -> Result<Self> {
        Ok(match mode {
            Mode::Ephemeral => Executor::Ephemeral(Process::new(config, options)?),
            Mode::Persistent => Executor::Persistent(PersistentProcess::new(config, options)?),
        })
    }

    pub fn mode(&self) -> Mode {
        match self {
            Executor::Ephemeral(_) => Mode::Ephemeral,
            Executor::Persistent(_) => Mode::Persistent,
        }
    }

    fn as_prompter(&self) -> &dyn Prompter {
        match self {
            Executor::Ephemeral(p) => p,
            Executor::Persistent(p) => p,
        }
    }
}

#[async_trait]
impl Prompter for Executor {
    async fn run_with_overrides(&self, prompt: &str, overrides: &Overrides) -> Result<EventStream> {
        self.as_prompter().run_with_overrides(prompt, overrides).await
    }

    async fn submit(&self, prompt: &str, overrides: &Overrides) -> Result<()> {
        self.as_prompter().submit(prompt, overrides).await
    }

    fn status(&self) -> StatusSnapshot {
        self.as_prompter().status()
    }

    async fn stop(&self) -> Result<()> {
        self.as_prompter().stop().await
    }

    fn wait_done(&self) -> DoneSignal {
        self.as_prompter().wait_done()
    }

    fn result_detail(&self) -> ResultDetail {
        self.as_prompter().result_detail()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
