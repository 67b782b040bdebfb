use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shepherd::config::{CliOverrides, Config};

mod cmd;

#[derive(Parser)]
#[command(name = "shepherd")]
#[command(
    version,
    about = "Walk a change through planning, implementation, refactoring and PR splitting"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve generated plans without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo_dir: Option<PathBuf>,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a workflow and run it
    Start {
        /// Workflow name (letters, digits, '-' or '_')
        name: String,
        /// What the change should accomplish
        description: String,
        /// feature or fix
        #[arg(long = "type", default_value = "feature")]
        workflow_type: String,
        /// Override the configured fix-attempt ceiling
        #[arg(long)]
        max_fix_attempts: Option<u32>,
    },
    /// Continue a failed or interrupted workflow
    Resume {
        name: String,
        #[arg(long)]
        max_fix_attempts: Option<u32>,
    },
    /// Show one workflow in detail
    Status { name: String },
    /// List all workflows
    List,
    /// Delete a workflow and its worktree
    Delete {
        name: String,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Delete every completed workflow
    Clean,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default shepherd.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_dir = match cli.repo_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let max_fix_attempts = match &cli.command {
        Commands::Start {
            max_fix_attempts, ..
        }
        | Commands::Resume {
            max_fix_attempts, ..
        } => *max_fix_attempts,
        _ => None,
    };
    let config = Config::load(
        &repo_dir,
        CliOverrides {
            verbose: cli.verbose,
            yes: cli.yes,
            base_dir: None,
            max_fix_attempts,
        },
    )?;

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config, command.clone());
    }

    config.ensure_directories()?;
    let _log_guard = shepherd::logging::init(config.verbose, cli.log_json, &config.log_dir)?;

    match &cli.command {
        Commands::Start {
            name,
            description,
            workflow_type,
            ..
        } => cmd::cmd_start(&config, name, description, workflow_type).await?,
        Commands::Resume { name, .. } => cmd::cmd_resume(&config, name).await?,
        Commands::Status { name } => cmd::cmd_status(&config, name)?,
        Commands::List => cmd::cmd_list(&config)?,
        Commands::Delete { name, force } => cmd::cmd_delete(&config, name, *force).await?,
        Commands::Clean => cmd::cmd_clean(&config).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
