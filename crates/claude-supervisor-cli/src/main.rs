mod cmd;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "claude-supervisor",
    about = "Run the Claude CLI as a supervised stream-json subprocess",
    version,
    propagate_version = true
)]
struct Cli {
    /// YAML agent configuration (default: built-in defaults)
    #[arg(long, global = true, env = "CLAUDE_SUPERVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Keep one long-lived subprocess instead of one per prompt
    #[arg(long, global = true)]
    persistent: bool,

    /// Log lifecycle events at INFO
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the argument list the agent would be launched with
    Args {
        /// Build duplex (persistent) arguments
        #[arg(long)]
        duplex: bool,
    },

    /// Run one prompt to completion and print the answer
    Run {
        prompt: String,

        /// Print a JSON report instead of the plain answer
        #[arg(long, short = 'j')]
        json: bool,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        max_turns: Option<i64>,

        #[arg(long)]
        max_budget_usd: Option<f64>,
    },

    /// Answer one prompt per stdin line on a persistent subprocess
    Chat,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Args { duplex } => cmd::args::run(config_path, duplex || cli.persistent),
        Commands::Run {
            prompt,
            json,
            model,
            max_turns,
            max_budget_usd,
        } => {
            let overrides = cmd::run::overrides(model, max_turns, max_budget_usd);
            cmd::run::run(config_path, cli.persistent, &prompt, &overrides, json)
        }
        Commands::Chat => cmd::chat::run(config_path),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
