use std::path::Path;

use anyhow::Context;
use claude_supervisor::{Executor, ExecutorOptions, Mode, Overrides, Prompter, SupervisorError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::{ctrl_c_token, load_config, resolve_binary};

/// Feed stdin to one persistent subprocess, a prompt per line, printing each
/// answer as it completes.
pub fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    resolve_binary(&mut config)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        let options = ExecutorOptions::default().with_shutdown(shutdown.clone());
        let executor = Executor::new(Mode::Persistent, config, options)?;
        let cancel = ctrl_c_token();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let result: anyhow::Result<()> = loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                line = lines.next_line() => match line.context("failed to read stdin") {
                    Ok(line) => line,
                    Err(e) => break Err(e),
                },
            };
            let Some(line) = line else {
                break Ok(());
            };
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }

            match executor
                .run_sync_with_overrides(prompt, &Overrides::default(), &cancel)
                .await
            {
                Ok(output) => println!("{}", output.text),
                Err(SupervisorError::Cancelled) => break Ok(()),
                Err(e) => break Err(anyhow::Error::new(e).context("agent request failed")),
            }
        };

        executor.stop().await?;
        shutdown.cancel();
        result
    })
}
