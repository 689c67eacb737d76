use std::path::Path;

use anyhow::Context;
use claude_supervisor::{Executor, ExecutorOptions, Mode, Overrides, Prompter, StatusSnapshot};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{ctrl_c_token, load_config, resolve_binary};
use crate::output::print_json;

/// `--json` output of `run`.
#[derive(Serialize)]
struct RunReport {
    text: String,
    status: StatusSnapshot,
    events: Vec<serde_json::Value>,
}

pub fn overrides(
    model: Option<String>,
    max_turns: Option<i64>,
    max_budget_usd: Option<f64>,
) -> Overrides {
    Overrides {
        model,
        max_turns: max_turns.unwrap_or(0),
        max_budget_usd: max_budget_usd.unwrap_or(0.0),
        ..Overrides::default()
    }
}

pub fn run(
    config_path: Option<&Path>,
    persistent: bool,
    prompt: &str,
    overrides: &Overrides,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    resolve_binary(&mut config)?;
    let mode = if persistent {
        Mode::Persistent
    } else {
        Mode::Ephemeral
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        let options = ExecutorOptions::default().with_shutdown(shutdown.clone());
        let executor = Executor::new(mode, config, options)?;

        let cancel = ctrl_c_token();
        let result = executor
            .run_sync_with_overrides(prompt, overrides, &cancel)
            .await;
        let status = executor.status();
        executor.stop().await?;
        shutdown.cancel();

        let output = result.context("agent run failed")?;
        if json {
            print_json(&RunReport {
                text: output.text,
                status,
                events: output.events.iter().map(|e| e.raw_json()).collect(),
            })?;
        } else {
            println!("{}", output.text);
        }
        Ok::<(), anyhow::Error>(())
    })
}
