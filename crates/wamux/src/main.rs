// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wamux - a multi-tenant chat session orchestrator.
//!
//! This is the binary entry point.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod loopback;
mod serve;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wamux_config::{ConfigError, WamuxConfig};

/// Wamux - a multi-tenant chat session orchestrator.
#[derive(Parser, Debug)]
#[command(name = "wamux", version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of the standard search path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator against the loopback client.
    Serve {
        /// Tenants to create (or restore) at startup.
        #[arg(long = "tenant")]
        tenants: Vec<String>,

        /// Seconds to let queues drain on shutdown.
        #[arg(long, default_value_t = 10)]
        drain_secs: u64,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Validate the configuration and exit.
    Validate,
}

fn load(path: Option<&PathBuf>) -> Result<WamuxConfig, Vec<ConfigError>> {
    match path {
        Some(path) => wamux_config::load_and_validate_path(path),
        None => wamux_config::load_and_validate(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(errors) => {
            wamux_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Serve { tenants, drain_secs }) => {
            if let Err(err) = serve::run_serve(config, tenants, drain_secs).await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => match toml::to_string_pretty(&config) {
                Ok(rendered) => print!("{rendered}"),
                Err(err) => {
                    eprintln!("error: failed to render config: {err}");
                    std::process::exit(1);
                }
            },
            ConfigAction::Validate => {
                println!(
                    "wamux: config OK (capacity={}, queues={})",
                    config.pool.capacity,
                    config.queues.len()
                );
            }
        },
        None => {
            println!("wamux: use --help for available commands");
        }
    }
}
