// Copyright 2026 Unlist Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use unlist_runtime::cli;

#[derive(Parser)]
#[command(
    name = "unlist",
    about = "Unlist — automated data-broker scan and opt-out engine",
    version,
    after_help = "Run 'unlist <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the background scheduler
    Start {
        /// Directory of broker definition files (defaults to ~/.unlist/brokers)
        #[arg(long)]
        brokers_dir: Option<String>,
        /// Vault database path (defaults to ~/.unlist/vault.db)
        #[arg(long)]
        db: Option<String>,
    },
    /// Stop the background scheduler
    Stop,
    /// Run every scan immediately, regardless of schedule
    Scan {
        /// Directory of broker definition files (defaults to ~/.unlist/brokers)
        #[arg(long)]
        brokers_dir: Option<String>,
        /// Vault database path (defaults to ~/.unlist/vault.db)
        #[arg(long)]
        db: Option<String>,
    },
    /// Show vault progress counts
    Status {
        /// Vault database path (defaults to ~/.unlist/vault.db)
        #[arg(long)]
        db: Option<String>,
    },
    /// List the brokers recorded in the vault
    Brokers {
        /// Vault database path (defaults to ~/.unlist/vault.db)
        #[arg(long)]
        db: Option<String>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("UNLIST_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("UNLIST_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("UNLIST_VERBOSE", "1");
    }

    let result = match cli.command {
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
        Some(Commands::Start { brokers_dir, db }) => {
            cli::start::run(brokers_dir.as_deref(), db.as_deref()).await
        }
        Some(Commands::Stop) => cli::stop::run().await,
        Some(Commands::Scan { brokers_dir, db }) => {
            cli::scan_cmd::run(brokers_dir.as_deref(), db.as_deref()).await
        }
        Some(Commands::Status { db }) => cli::status::run(db.as_deref()).await,
        Some(Commands::Brokers { db }) => cli::brokers_cmd::run(db.as_deref()).await,
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "unlist", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if !cli::output::is_quiet() && !cli::output::is_json() {
            eprintln!("  Error: {e:#}");
        }
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        }
        std::process::exit(1);
    }

    result
}
