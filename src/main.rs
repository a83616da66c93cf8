mod cli;
mod config;
mod daemon;
mod defaults;
mod output;
mod overlay;
mod paths;
mod policy;
mod profile;
mod scheduler;
mod yaml;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};

fn main() {
    if let Err(err) = run() {
        if output::is_json_mode() {
            let _ = output::print_json(&serde_json::json!({
                "ok": false,
                "error": format!("{err:#}")
            }));
        } else {
            eprintln!("Error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    output::set_json_mode(cli.json);
    paths::set_home_override(cli.home);
    output::init_logging();

    match cli.command {
        Commands::Config { command } => config::run(command)?,
        Commands::Profile { command } => profile::run(command)?,
        Commands::Daemon(args) => daemon::run(args)?,
    }

    Ok(())
}
