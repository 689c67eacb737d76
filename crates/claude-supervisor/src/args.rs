//! Argument builder: turns an [`AgentConfig`] into the `claude` flag list.
//!
//! Pure: identical inputs always produce identical output. Nothing here
//! touches the filesystem or the environment.

use crate::config::{AgentConfig, McpServerConfig, PermissionMode};

/// How the subprocess will be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// One subprocess per prompt; the prompt is appended as the last argument.
    Ephemeral,
    /// One long-lived subprocess fed stream-json user messages on stdin.
    Duplex,
}

/// Build the flag list for `cfg`. The prompt is not included.
pub fn build_args(cfg: &AgentConfig, invocation: Invocation) -> Vec<String> {
    let mut args: Vec<String> = vec!["--print".into()];

    if invocation == Invocation::Duplex {
        push(&mut args, "--input-format", "stream-json");
    }
    push(&mut args, "--output-format", "stream-json");
    args.push("--verbose".into());

    if let Some(model) = &cfg.model {
        push(&mut args, "--model", model);
    }
    if let Some(fallback) = &cfg.fallback_model {
        push(&mut args, "--fallback-model", fallback);
    }
    if let Some(sp) = &cfg.system_prompt {
        push(&mut args, "--system-prompt", sp);
    }
    if let Some(append) = &cfg.append_system_prompt {
        push(&mut args, "--append-system-prompt", append);
    }

    if cfg.permission_mode != PermissionMode::Default {
        push(&mut args, "--permission-mode", cfg.permission_mode.as_str());
    }
    if cfg.permission_mode == PermissionMode::BypassPermissions {
        args.push("--dangerously-skip-permissions".into());
    }

    let allowed = allowed_tools(cfg);
    if !allowed.is_empty() {
        push(&mut args, "--allowedTools", &allowed.join(","));
    }
    if !cfg.disallowed_tools.is_empty() {
        push(&mut args, "--disallowedTools", &cfg.disallowed_tools.join(","));
    }

    if cfg.max_turns > 0 {
        push(&mut args, "--max-turns", &cfg.max_turns.to_string());
    }
    if cfg.max_budget_usd > 0.0 {
        push(
            &mut args,
            "--max-budget-usd",
            &format!("{:.2}", cfg.max_budget_usd),
        );
    }
    if let Some(effort) = cfg.effort {
        push(&mut args, "--effort", effort.as_str());
    }

    // A duplex subprocess serves many requests under one session, so
    // per-subprocess session selection never applies there.
    if invocation == Invocation::Ephemeral {
        if let Some(sid) = &cfg.session_id {
            push(&mut args, "--session-id", sid);
        }
        if let Some(resume) = &cfg.resume {
            push(&mut args, "--resume", resume);
        }
        if cfg.continue_conversation {
            args.push("--continue".into());
        }
        if cfg.fork_session {
            args.push("--fork-session".into());
        }
    }

    if !cfg.persist_sessions {
        args.push("--no-session-persistence".into());
    }

    if let Some(agent) = &cfg.agent {
        push(&mut args, "--agent", agent);
    }
    if !cfg.agents.is_empty() {
        if let Ok(json) = serde_json::to_string(&cfg.agents) {
            push(&mut args, "--agents", &json);
        }
    }

    if let Some(settings) = &cfg.settings {
        push(&mut args, "--settings", &settings.to_string_lossy());
    }
    for dir in &cfg.plugin_dirs {
        push(&mut args, "--plugin-dir", &dir.to_string_lossy());
    }
    for path in &cfg.mcp_config {
        push(&mut args, "--mcp-config", &path.to_string_lossy());
    }
    if !cfg.mcp_servers.is_empty() {
        push(&mut args, "--mcp-config", &build_mcp_config_json(&cfg.mcp_servers));
    }
    for dir in &cfg.add_dirs {
        push(&mut args, "--add-dir", &dir.to_string_lossy());
    }

    if cfg.include_partial_messages {
        args.push("--include-partial-messages".into());
    }
    if cfg.debug {
        args.push("--debug".into());
    }

    args
}

fn push(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_owned());
    args.push(value.to_owned());
}

/// Configured allow-list plus an `mcp__<name>__*` pattern for every companion
/// MCP server, so the agent never blocks its own declared integrations.
fn allowed_tools(cfg: &AgentConfig) -> Vec<String> {
    let mut tools = cfg.allowed_tools.clone();
    for name in cfg.companion_servers() {
        let pattern = format!("mcp__{name}__*");
        if !tools.contains(&pattern) {
            tools.push(pattern);
        }
    }
    tools
}

/// Serialise `McpServerConfig` entries into the JSON string expected by
/// `claude --mcp-config '...'`.
///
/// Format: `{"mcpServers":{"<name>":{"type":"stdio","command":"...","args":[...],"env":{...}}}}`
fn build_mcp_config_json(servers: &[McpServerConfig]) -> String {
    let mut mcp_servers = serde_json::Map::new();

    for srv in servers {
        let mut cfg = serde_json::Map::new();
        cfg.insert("type".into(), "stdio".into());
        cfg.insert("command".into(), srv.command.clone().into());
        if !srv.args.is_empty() {
            cfg.insert("args".into(), srv.args.clone().into());
        }
        if !srv.env.is_empty() {
            let env: serde_json::Map<String, serde_json::Value> = srv
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().into()))
                .collect();
            cfg.insert("env".into(), env.into());
        }
        mcp_servers.insert(srv.name.clone(), cfg.into());
    }

    serde_json::json!({ "mcpServers": mcp_servers }).to_string()
}

// ─── Tests ────────────────────────────────────────────────────────────────
