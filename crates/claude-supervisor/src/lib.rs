//! `claude-supervisor`: run the `claude` CLI as a supervised subprocess.
//!
//! The crate drives `claude --print --output-format stream-json`, decodes its
//! line-delimited JSON output into typed events and exposes the result through
//! one executor contract with two strategies.
//!
//! # Architecture
//!
//! ```text
//! AgentConfig + Overrides
//!     │
//!     ▼
//! build_args()        ← pure flag builder (ephemeral or duplex framing)
//!     │
//!     ▼
//! Executor            ← Ephemeral(Process)           one subprocess per run
//!     │                  Persistent(PersistentProcess) one subprocess, many runs,
//!     │                                                watchdog restarts
//!     ▼
//! decode_line()       ← stdout JSONL → Event; bad lines are logged and skipped
//!     │
//!     ▼
//! EventStream         ← futures::Stream over a bounded, cancellation-aware queue
//!     │
//!     ▼
//! submit()            ← background drain that stores the last ResultSnapshot
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use claude_supervisor::{AgentConfig, Executor, ExecutorOptions, Mode, Prompter};
//! use futures::StreamExt;
//!
//! let executor = Executor::new(Mode::Ephemeral, AgentConfig::default(), ExecutorOptions::default())?;
//! let mut stream = executor.run("Write a hello-world Rust function.").await?;
//! while let Some(event) = stream.next().await {
//!     println!("{}", event.raw);
//! }
//! println!("{:?}", executor.status());
//! ```

pub mod args;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod persistent;
pub mod process;
pub mod prompter;
pub mod state;
pub mod stream;

pub(crate) mod submit;

pub use args::{build_args, Invocation};
pub use config::{AgentConfig, AgentDefinition, Effort, McpServerConfig, Overrides, PermissionMode};
pub use error::{CodecError, ConfigError, SupervisorError};
pub use event::{decode_frame, decode_line, extract_text, truncate, Event, EventKind, ResultEvent};
pub use metrics::{Metrics, NoopMetrics};
pub use persistent::PersistentProcess;
pub use process::Process;
pub use prompter::{
    Executor, ExecutorOptions, Mode, Prompter, RunOutput, RESTART_BACKOFF, STOP_GRACE_PERIOD,
};
pub use state::{ResultDetail, ResultSnapshot, Status, StatusSnapshot};
pub use stream::{DoneSignal, EventStream, RunOutcome};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SupervisorError>;
