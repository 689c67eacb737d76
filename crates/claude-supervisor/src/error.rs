use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent is busy: a run is already in flight")]
    Busy,

    #[error("persistent agent process already started")]
    AlreadyStarted,

    #[error("agent process is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Rejected before any subprocess is spawned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid permission mode '{0}'")]
    InvalidPermissionMode(String),

    #[error("invalid effort level '{0}': expected low, medium, high or max")]
    InvalidEffort(String),

    #[error("max_turns must not be negative (got {0})")]
    NegativeMaxTurns(i64),

    #[error("max_budget_usd must be a non-negative number (got {0})")]
    InvalidBudget(f64),

    #[error("agent binary must not be empty")]
    EmptyBinary,
}

/// One stdout line that could not be decoded. Recoverable: callers log and
/// keep reading.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type '{kind}'")]
    UnknownType { kind: String },

    #[error("Failed to parse stream-json line: {source}\n  line: {line}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stream-json line is not valid UTF-8: {line}")]
    NotUtf8 { line: String },
}
