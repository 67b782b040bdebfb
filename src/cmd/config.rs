//! Configuration view and validation commands: `shepherd config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use shepherd::config::Config;
use shepherd::shepherd_config::ShepherdToml;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shepherd Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No shepherd.toml found at {}", config_path.display());
                println!("Using defaults. Run 'shepherd config init' to create one.");
            }
            println!();

            // Effective values, including environment and CLI overrides.
            print!("{}", config.toml().to_toml()?);
            println!();
            println!("Resolved paths:");
            println!("  repository = {}", config.repo_dir.display());
            println!("  workflows  = {}", config.base_dir.display());
            println!("  worktrees  = {}", config.worktree_dir.display());
            println!("  logs       = {}", config.log_dir.display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No shepherd.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("shepherd.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.shepherd_dir).with_context(|| {
                format!("Failed to create {}", config.shepherd_dir.display())
            })?;
            ShepherdToml::default().save(&config_path)?;

            println!("Created shepherd.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] main_branch, base_dir, worktree_dir");
            println!("  - [agent] command and per-phase timeouts");
            println!("  - [ci] polling cadence and the e2e job pattern");
            println!("  - [limits] and [pr_split] thresholds");
            println!();
        }
    }

    Ok(())
}
