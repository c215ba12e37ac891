//! Configuration view and validation commands: `quill config`.

use anyhow::Result;
use console::style;
use quill::config::{CONFIG_FILE_NAME, QuillConfig};
use std::path::PathBuf;

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let (config, source) = load_config(cli)?;

            println!();
            match &source {
                Some(path) => println!("Config file: {}", path.display()),
                None => {
                    println!("No quill.toml found. Using defaults.");
                    println!("Run 'quill config init' to create one.");
                }
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let (config, source) = load_config(cli)?;

            println!();
            if source.is_none() {
                println!("No quill.toml found. Checking defaults.");
            }

            let errors = config.validate();
            let warnings = config.warnings();
            for warning in &warnings {
                println!("  {} {}", style("warning:").yellow().bold(), warning);
            }
            for error in &errors {
                println!("  {} {}", style("error:").red().bold(), error);
            }
            println!();

            if !errors.is_empty() {
                anyhow::bail!("Configuration has {} error(s)", errors.len());
            }
            println!("Configuration is valid.");
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

            if path.exists() && !force {
                println!("{} already exists.", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            QuillConfig::default().save(&path)?;

            println!("Created {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [run] target_words, chapters, call_timeout_secs");
            println!("  - [context] window, summary_chars, digest_chars");
            println!("  - [quality] thresholds, max_retries, on_exhaustion");
            println!("  - [stages.<name>] max_tokens, temperature");
            println!("  - [backend] base_url, model, api_key_env");
            println!();
        }
    }

    Ok(())
}
