//! Metrics recorder collaborator.
//!
//! Executors report through this trait and own no metrics state themselves.
//! Every method defaults to a no-op so recorders only implement what they
//! export.

use crate::state::Status;

pub trait Metrics: Send + Sync {
    /// One decoded stdout event, labelled by wire `type`.
    fn message(&self, _kind: &str) {}

    fn tool_call(&self, _tool_name: &str) {}

    /// Positive cost delta in USD.
    fn add_cost(&self, _usd: f64) {}

    fn process_restart(&self) {}

    /// Current status gauge for the executor labelled `mode`.
    fn status(&self, _mode: &str, _status: Status) {}

    /// Wall-clock duration of a finished run.
    fn run_duration(&self, _seconds: f64) {}

    /// A subprocess ignored graceful termination and was killed.
    fn forced_kill(&self) {}
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
