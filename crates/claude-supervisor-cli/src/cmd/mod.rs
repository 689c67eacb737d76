pub mod args;
pub mod chat;
pub mod run;

use std::path::Path;

use anyhow::Context;
use claude_supervisor::AgentConfig;
use tokio_util::sync::CancellationToken;

/// Load the configuration file, or the defaults when none was given, and
/// pick up server names from any referenced MCP config files.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config
        .discover_mcp_servers()
        .context("failed to read MCP config")?;
    Ok(config)
}

/// Replace a bare binary name with its absolute path so a missing agent is
/// reported before anything is spawned.
pub fn resolve_binary(config: &mut AgentConfig) -> anyhow::Result<()> {
    let resolved = which::which(&config.binary)
        .with_context(|| format!("agent binary '{}' not found on PATH", config.binary))?;
    config.binary = resolved.to_string_lossy().into_owned();
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
pub fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; stopping agent");
            trigger.cancel();
        }
    });
    token
}
