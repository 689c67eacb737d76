use std::path::Path;

use claude_supervisor::{build_args, Invocation};

use super::load_config;

pub fn run(config_path: Option<&Path>, duplex: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let invocation = if duplex {
        Invocation::Duplex
    } else {
        Invocation::Ephemeral
    };
    for arg in build_args(&config, invocation) {
        println!("{arg}");
    }
    Ok(())
}
