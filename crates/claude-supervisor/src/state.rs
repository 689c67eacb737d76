use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{truncate, Event, EventKind};
use crate::metrics::Metrics;

/// Max characters kept for `last_message` in status snapshots.
pub const MESSAGE_PREVIEW_CHARS: usize = 200;
/// Max characters kept for `result_preview` in status snapshots.
pub const RESULT_PREVIEW_CHARS: usize = 500;

// ─── Status ───────────────────────────────────────────────────────────────

/// Execution status of one executor.
///
/// `Completed` is `Idle` plus a stored result; both accept a new run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Starting,
    Busy,
    #[default]
    Idle,
    Completed,
    Stopped,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Busy => "busy",
            Status::Idle => "idle",
            Status::Completed => "completed",
            Status::Stopped => "stopped",
            Status::Error => "error",
        }
    }

    /// `true` while a run holds the single-flight slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Starting | Status::Busy)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Result snapshot and DTOs ─────────────────────────────────────────────

/// Plain-text answer and full event history of the last successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSnapshot {
    pub run_id: String,
    pub text: String,
    pub events: Vec<Event>,
    pub completed_at: DateTime<Utc>,
}

/// Lightweight, truncated view for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub mode: String,
    pub status: Status,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub message_count: u64,
    pub tool_calls: u64,
    pub last_message: Option<String>,
    pub last_tool: Option<String>,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub restarts: u32,
    pub result_preview: Option<String>,
}

/// Untruncated view of the stored result, for debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultDetail {
    pub status: Status,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub text: Option<String>,
    pub completed_at: Option<String>,
    pub events: Vec<serde_json::Value>,
}

// ─── RunState ─────────────────────────────────────────────────────────────

/// Everything an executor tracks about its runs. Only touched under
/// [`SharedState`]'s lock.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub status: Status,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub message_count: u64,
    pub tool_calls: u64,
    pub last_message: Option<String>,
    pub last_tool: Option<String>,
    pub cost_usd: f64,
    /// Last cumulative total reported by the current subprocess.
    pub subprocess_cost: f64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub result: Option<ResultSnapshot>,
}

impl RunState {
    /// Reset per-run counters and claim a fresh run id.
    pub fn begin_run(&mut self, reset_cost: bool) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.run_id = Some(run_id.clone());
        self.message_count = 0;
        self.tool_calls = 0;
        self.last_message = None;
        self.last_tool = None;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        if reset_cost {
            self.cost_usd = 0.0;
            self.subprocess_cost = 0.0;
        }
        run_id
    }

    /// A fresh subprocess reports its cumulative cost from zero again.
    pub fn reset_subprocess_cost(&mut self) {
        self.subprocess_cost = 0.0;
    }

    /// Fold one decoded event into the running counters.
    pub fn record_event(&mut self, event: &Event, metrics: &dyn Metrics) {
        self.message_count += 1;
        metrics.message(event.type_label());

        match &event.kind {
            EventKind::SessionStart { session_id } => {
                // Empty ids never reset a tracked session.
                if !session_id.is_empty() {
                    self.session_id = Some(session_id.clone());
                }
            }
            EventKind::AssistantText { text } => {
                self.last_message = Some(truncate(text, MESSAGE_PREVIEW_CHARS));
            }
            EventKind::AssistantToolUse { tool_name, .. } => {
                self.tool_calls += 1;
                self.last_tool = Some(tool_name.clone());
                metrics.tool_call(tool_name);
            }
            EventKind::Result(r) => {
                if !r.text.is_empty() {
                    self.last_message = Some(truncate(&r.text, MESSAGE_PREVIEW_CHARS));
                }
                if let Some(total) = r.total_cost_usd {
                    let delta = total - self.subprocess_cost;
                    self.subprocess_cost = total;
                    if delta > 0.0 {
                        self.cost_usd += delta;
                        metrics.add_cost(delta);
                    }
                } else if let Some(cost) = r.cost_usd.filter(|c| *c > 0.0) {
                    self.cost_usd += cost;
                    metrics.add_cost(cost);
                }
            }
        }
    }

    pub fn finish(&mut self, status: Status, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self, mode: &str) -> StatusSnapshot {
        StatusSnapshot {
            mode: mode.to_owned(),
            status: self.status,
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            message_count: self.message_count,
            tool_calls: self.tool_calls,
            last_message: self.last_message.clone(),
            last_tool: self.last_tool.clone(),
            cost_usd: self.cost_usd,
            error: self.error.clone(),
            started_at: self.started_at.map(|t| t.to_rfc3339()),
            finished_at: self.finished_at.map(|t| t.to_rfc3339()),
            restarts: self.restarts,
            result_preview: self
                .result
                .as_ref()
                .map(|r| truncate(&r.text, RESULT_PREVIEW_CHARS)),
        }
    }

    pub fn detail(&self) -> ResultDetail {
        let result = self.result.as_ref();
        ResultDetail {
            status: self.status,
            run_id: result.map(|r| r.run_id.clone()),
            session_id: self.session_id.clone(),
            cost_usd: self.cost_usd,
            error: self.error.clone(),
            text: result.map(|r| r.text.clone()),
            completed_at: result.map(|r| r.completed_at.to_rfc3339()),
            events: result
                .map(|r| r.events.iter().map(Event::raw_json).collect())
                .unwrap_or_default(),
        }
    }
}

// ─── SharedState ──────────────────────────────────────────────────────────

/// Contents of the executor lock: the common [`RunState`] plus whatever
/// process control data the executor keeps (`exec`).
#[derive(Debug, Default)]
pub(crate) struct Locked<X> {
    pub run: RunState,
    pub exec: X,
}

/// One lock per executor guarding [`Locked`], plus the metrics recorder.
///
/// Critical sections never await, so status queries never block on I/O.
pub(crate) struct SharedState<X> {
    mode: &'static str,
    state: Mutex<Locked<X>>,
    pub metrics: Arc<dyn Metrics>,
}

impl<X: Default> SharedState<X> {
    pub fn new(mode: &'static str, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            mode,
            state: Mutex::new(Locked::default()),
            metrics,
        }
    }
}

impl<X> SharedState<X> {
    pub fn mode(&self) -> &'static str {
        self.mode
    }

    /// Lock the state. A panic while holding the lock cannot leave
    /// `RunState` half-updated in a way that matters, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Locked<X>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the status and report it to the gauge.
    pub fn set_status(&self, run: &mut RunState, status: Status) {
        run.status = status;
        self.metrics.status(self.mode, status);
    }

    /// Record the end of a run (or of a subprocess) and report the status.
    pub fn finish(&self, run: &mut RunState, status: Status, error: Option<String>) {
        run.finish(status, error);
        self.metrics.status(self.mode, status);
        if let Some(started) = run.started_at {
            let elapsed = Utc::now() - started;
            self.metrics
                .run_duration(elapsed.num_milliseconds() as f64 / 1000.0);
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lock().run.snapshot(self.mode)
    }

    pub fn result_detail(&self) -> ResultDetail {
        self.lock().run.detail()
    }

    /// Store a finished run's result. Marks the executor `Completed` when
    /// that run is still the latest one and nothing else has started.
    pub fn store_result(&self, run_id: &str, text: String, events: Vec<Event>) {
        let mut guard = self.lock();
        guard.run.result = Some(ResultSnapshot {
            run_id: run_id.to_owned(),
            text,
            events,
            completed_at: Utc::now(),
        });
        if guard.run.status == Status::Idle && guard.run.run_id.as_deref() == Some(run_id) {
            self.set_status(&mut guard.run, Status::Completed);
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
