use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::Result;

// ─── AgentConfig ──────────────────────────────────────────────────────────

/// Immutable per-executor configuration for the `claude` binary.
///
/// Built once at executor construction. Per-call changes go through
/// [`Overrides`] and [`AgentConfig::merged`], which never mutate the base.
///
/// Zero values mean "unset": `max_turns == 0` and `max_budget_usd == 0.0`
/// leave the CLI defaults in place.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to launch (default: `"claude"`)
    pub binary: String,
    /// Arguments placed before the generated flags, e.g. when the agent is
    /// launched through a wrapper such as `npx`
    pub binary_args: Vec<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    /// Replaces the default system prompt
    pub system_prompt: Option<String>,
    /// Appended to the default system prompt
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: i64,
    pub max_budget_usd: f64,
    pub effort: Option<Effort>,
    pub permission_mode: PermissionMode,
    /// Session ID for a specific conversation (ephemeral mode only)
    pub session_id: Option<String>,
    /// Session ID to resume (ephemeral mode only)
    pub resume: Option<String>,
    /// Continue the most recent conversation (ephemeral mode only)
    pub continue_conversation: bool,
    /// Fork instead of reusing the resumed session (ephemeral mode only)
    pub fork_session: bool,
    /// Let the CLI write its session transcript to disk
    pub persist_sessions: bool,
    /// Named agent to run as the main thread
    pub agent: Option<String>,
    /// Subagent definitions, passed as `--agents '<json>'`
    pub agents: BTreeMap<String, AgentDefinition>,
    pub settings: Option<PathBuf>,
    pub plugin_dirs: Vec<PathBuf>,
    /// MCP config files passed through as `--mcp-config <path>`
    pub mcp_config: Vec<PathBuf>,
    /// Inline stdio MCP servers, serialised into one `--mcp-config` JSON blob
    pub mcp_servers: Vec<McpServerConfig>,
    /// Server names found in `mcp_config` files by [`AgentConfig::discover_mcp_servers`]
    #[serde(skip)]
    pub discovered_mcp_servers: Vec<String>,
    pub add_dirs: Vec<PathBuf>,
    /// Working directory for the subprocess (default: current dir)
    pub cwd: Option<PathBuf>,
    /// Additional environment variables for the subprocess
    pub env: BTreeMap<String, String>,
    pub include_partial_messages: bool,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            binary_args: Vec::new(),
            model: None,
            fallback_model: None,
            system_prompt: None,
            append_system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: 0,
            max_budget_usd: 0.0,
            effort: None,
            permission_mode: PermissionMode::BypassPermissions,
            session_id: None,
            resume: None,
            continue_conversation: false,
            fork_session: false,
            persist_sessions: false,
            agent: None,
            agents: BTreeMap::new(),
            settings: None,
            plugin_dirs: Vec::new(),
            mcp_config: Vec::new(),
            mcp_servers: Vec::new(),
            discovered_mcp_servers: Vec::new(),
            add_dirs: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            include_partial_messages: false,
            debug: false,
        }
    }
}

impl AgentConfig {
    /// Load a YAML config file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values the CLI would reject or misinterpret.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.binary.trim().is_empty() {
            return Err(ConfigError::EmptyBinary);
        }
        validate_limits(self.max_turns, self.max_budget_usd)
    }

    /// Return a copy with every non-zero field of `overrides` applied.
    pub fn merged(&self, overrides: &Overrides) -> AgentConfig {
        let mut cfg = self.clone();
        if let Some(v) = non_empty(&overrides.model) {
            cfg.model = Some(v);
        }
        if let Some(v) = non_empty(&overrides.system_prompt) {
            cfg.system_prompt = Some(v);
        }
        if let Some(v) = non_empty(&overrides.append_system_prompt) {
            cfg.append_system_prompt = Some(v);
        }
        if let Some(mode) = overrides.permission_mode {
            cfg.permission_mode = mode;
        }
        if !overrides.allowed_tools.is_empty() {
            cfg.allowed_tools = overrides.allowed_tools.clone();
        }
        if !overrides.disallowed_tools.is_empty() {
            cfg.disallowed_tools = overrides.disallowed_tools.clone();
        }
        if overrides.max_turns != 0 {
            cfg.max_turns = overrides.max_turns;
        }
        if overrides.max_budget_usd != 0.0 {
            cfg.max_budget_usd = overrides.max_budget_usd;
        }
        if let Some(effort) = overrides.effort {
            cfg.effort = Some(effort);
        }
        if let Some(v) = non_empty(&overrides.session_id) {
            cfg.session_id = Some(v);
        }
        if let Some(v) = non_empty(&overrides.resume) {
            cfg.resume = Some(v);
        }
        if overrides.continue_conversation {
            cfg.continue_conversation = true;
        }
        if overrides.fork_session {
            cfg.fork_session = true;
        }
        if let Some(v) = non_empty(&overrides.agent) {
            cfg.agent = Some(v);
        }
        cfg
    }

    /// Read every `mcp_config` file and remember the server names it
    /// declares, so the builder can pre-approve their tools.
    pub fn discover_mcp_servers(&mut self) -> Result<()> {
        for path in &self.mcp_config {
            let raw = std::fs::read_to_string(path)?;
            let doc: serde_json::Value = serde_json::from_str(&raw)?;
            let Some(servers) = doc.get("mcpServers").and_then(|v| v.as_object()) else {
                tracing::debug!(path = %path.display(), "mcp config declares no servers");
                continue;
            };
            for name in servers.keys() {
                if !self.discovered_mcp_servers.contains(name) {
                    self.discovered_mcp_servers.push(name.clone());
                }
            }
        }
        Ok(())
    }

    /// Inline and discovered MCP server names, deduplicated, in declaration order.
    pub fn companion_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let inline = self.mcp_servers.iter().map(|s| &s.name);
        for name in inline.chain(self.discovered_mcp_servers.iter()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned)
}

fn validate_limits(max_turns: i64, max_budget_usd: f64) -> std::result::Result<(), ConfigError> {
    if max_turns < 0 {
        return Err(ConfigError::NegativeMaxTurns(max_turns));
    }
    if !max_budget_usd.is_finite() || max_budget_usd < 0.0 {
        return Err(ConfigError::InvalidBudget(max_budget_usd));
    }
    Ok(())
}

// ─── Overrides ────────────────────────────────────────────────────────────

/// Per-call overrides. Zero-valued fields mean "no override".
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Overrides {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: i64,
    pub max_budget_usd: f64,
    pub effort: Option<Effort>,
    pub session_id: Option<String>,
    pub resume: Option<String>,
    pub continue_conversation: bool,
    pub fork_session: bool,
    pub agent: Option<String>,
}

impl Overrides {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_limits(self.max_turns, self.max_budget_usd)
    }

    /// Names of the fields that carry a non-zero value.
    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        let mut mark = |on: bool, name: &'static str| {
            if on {
                set.push(name);
            }
        };
        mark(non_empty(&self.model).is_some(), "model");
        mark(non_empty(&self.system_prompt).is_some(), "system_prompt");
        mark(
            non_empty(&self.append_system_prompt).is_some(),
            "append_system_prompt",
        );
        mark(self.permission_mode.is_some(), "permission_mode");
        mark(!self.allowed_tools.is_empty(), "allowed_tools");
        mark(!self.disallowed_tools.is_empty(), "disallowed_tools");
        mark(self.max_turns != 0, "max_turns");
        mark(self.max_budget_usd != 0.0, "max_budget_usd");
        mark(self.effort.is_some(), "effort");
        mark(non_empty(&self.session_id).is_some(), "session_id");
        mark(non_empty(&self.resume).is_some(), "resume");
        mark(self.continue_conversation, "continue_conversation");
        mark(self.fork_session, "fork_session");
        mark(non_empty(&self.agent).is_some(), "agent");
        set
    }

    pub fn is_empty(&self) -> bool {
        self.set_fields().is_empty()
    }
}

// ─── Enumerations ─────────────────────────────────────────────────────────

/// Effort level for Claude reasoning depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Effort {
    Low,
    Medium,
    High,
    Max,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
            Effort::Max => "max",
        }
    }
}

impl FromStr for Effort {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Effort::Low),
            "medium" => Ok(Effort::Medium),
            "high" => Ok(Effort::High),
            "max" => Ok(Effort::Max),
            other => Err(ConfigError::InvalidEffort(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Effort {
    type Error = ConfigError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission mode: controls how tool executions are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", try_from = "String")]
pub enum PermissionMode {
    /// Standard: prompts for dangerous operations
    #[default]
    Default,
    /// Auto-accept file edit operations
    AcceptEdits,
    /// Bypass all permission checks
    BypassPermissions,
    /// Planning mode: no actual tool execution
    Plan,
    /// Don't prompt; deny if not pre-approved
    DontAsk,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
            PermissionMode::DontAsk => "dontAsk",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            "dontAsk" => Ok(PermissionMode::DontAsk),
            other => Err(ConfigError::InvalidPermissionMode(other.to_owned())),
        }
    }
}

impl TryFrom<String> for PermissionMode {
    type Error = ConfigError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Agent and MCP definitions ────────────────────────────────────────────

/// One subagent entry of the `--agents` JSON map.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// MCP server configuration for stdio transport (the most common case).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpServerConfig {
    /// Logical name for this server (used in tool names as `mcp__<name>__<tool>`)
    pub name: String,
    /// Executable to spawn
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_bypasses_permissions_without_persistence() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.binary, "claude");
        assert_eq!(cfg.permission_mode, PermissionMode::BypassPermissions);
        assert!(!cfg.persist_sessions);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_limits() {
        let cfg = AgentConfig {
            max_turns: -1,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::NegativeMaxTurns(-1)));

        let cfg = AgentConfig {
            max_budget_usd: -0.5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBudget(_))));

        let cfg = AgentConfig {
            max_budget_usd: f64::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_binary() {
        let cfg = AgentConfig {
            binary: "  ".into(),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyBinary));
    }

    #[test]
    fn permission_mode_parses_cli_spellings() {
        assert_eq!(
            "bypassPermissions".parse::<PermissionMode>().unwrap(),
            PermissionMode::BypassPermissions
        );
        assert_eq!(
            "dontAsk".parse::<PermissionMode>().unwrap(),
            PermissionMode::DontAsk
        );
        let err = "yolo".parse::<PermissionMode>().unwrap_err();
        assert_eq!(err, ConfigError::InvalidPermissionMode("yolo".into()));
    }

    #[test]
    fn effort_parse_rejects_unknown_level() {
        assert_eq!("high".parse::<Effort>().unwrap(), Effort::High);
        assert!(matches!(
            "extreme".parse::<Effort>(),
            Err(ConfigError::InvalidEffort(_))
        ));
    }

    #[test]
    fn merged_applies_only_non_zero_fields() {
        let base = AgentConfig {
            model: Some("claude-sonnet-4-6".into()),
            max_turns: 5,
            allowed_tools: vec!["Read".into()],
            ..Default::default()
        };
        let overrides = Overrides {
            model: Some(String::new()),
            max_turns: 9,
            effort: Some(Effort::Low),
            ..Default::default()
        };

        let merged = base.merged(&overrides);
        assert_eq!(merged.model.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(merged.max_turns, 9);
        assert_eq!(merged.effort, Some(Effort::Low));
        assert_eq!(merged.allowed_tools, vec!["Read".to_string()]);

        // Base is untouched
        assert_eq!(base.max_turns, 5);
        assert_eq!(base.effort, None);
    }

    #[test]
    fn set_fields_lists_non_zero_overrides() {
        let overrides = Overrides {
            model: Some("opus".into()),
            permission_mode: Some(PermissionMode::Plan),
            max_budget_usd: 1.5,
            resume: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            overrides.set_fields(),
            vec!["model", "permission_mode", "max_budget_usd"]
        );
        assert!(Overrides::default().is_empty());
    }

    #[test]
    fn overrides_validate_rejects_negative_budget() {
        let overrides = Overrides {
            max_budget_usd: -2.0,
            ..Default::default()
        };
        assert!(overrides.validate().is_err());
    }

    #[test]
    fn from_yaml_file_fills_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "model: claude-opus-4-1\npermission_mode: acceptEdits\nmax_turns: 12").unwrap();

        let cfg = AgentConfig::from_yaml_file(f.path()).unwrap();
        assert_eq!(cfg.model.as_deref(), Some("claude-opus-4-1"));
        assert_eq!(cfg.permission_mode, PermissionMode::AcceptEdits);
        assert_eq!(cfg.max_turns, 12);
        assert_eq!(cfg.binary, "claude");
    }

    #[test]
    fn from_yaml_file_rejects_negative_turns() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "max_turns: -3").unwrap();
        assert!(AgentConfig::from_yaml_file(f.path()).is_err());
    }

    #[test]
    fn from_yaml_file_rejects_unknown_enum_spelling() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "permission_mode: yolo").unwrap();
        let err = AgentConfig::from_yaml_file(f.path()).unwrap_err();
        assert!(err.to_string().contains("invalid permission mode 'yolo'"), "{err}");

        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "effort: extreme").unwrap();
        assert!(AgentConfig::from_yaml_file(f.path()).is_err());
    }

    #[test]
    fn discover_mcp_servers_reads_server_names() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"mcpServers":{{"github":{{"command":"gh-mcp"}},"sdlc":{{"command":"sdlc"}}}}}}"#
        )
        .unwrap();

        let mut cfg = AgentConfig {
            mcp_config: vec![f.path().to_path_buf()],
            mcp_servers: vec![McpServerConfig {
                name: "sdlc".into(),
                command: "sdlc".into(),
                args: vec!["mcp".into()],
                env: BTreeMap::new(),
            }],
            ..Default::default()
        };
        cfg.discover_mcp_servers().unwrap();

        assert_eq!(cfg.discovered_mcp_servers, vec!["github", "sdlc"]);
        assert_eq!(cfg.companion_servers(), vec!["sdlc", "github"]);
    }
}
