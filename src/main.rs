use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "quill")]
#[command(version, about = "Long-form narrative generator")]
pub struct Cli {
    /// Show stage-level logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to quill.toml. Defaults to ./quill.toml, then the user config directory.
    #[arg(long, global = true, env = "QUILL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit stderr logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a story from a premise
    Run(RunArgs),
    /// View, create or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show the live or most recent run in an output directory
    Status {
        /// Output directory of the run (defaults to [output] dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Debug, Default)]
pub struct RunArgs {
    /// Story premise
    #[arg(short, long, conflicts_with = "premise_file")]
    pub premise: Option<String>,

    /// Read the premise from a file
    #[arg(long)]
    pub premise_file: Option<PathBuf>,

    /// Use the built-in synthetic backend instead of a real model
    #[arg(long)]
    pub dry_run: bool,

    /// Word target for the whole story
    #[arg(long)]
    pub target_words: Option<u64>,

    /// Minimum chapter count
    #[arg(long)]
    pub min_chapters: Option<u32>,

    /// Maximum chapter count
    #[arg(long)]
    pub max_chapters: Option<u32>,

    /// Number of recent chapter summaries kept verbatim
    #[arg(long)]
    pub window: Option<usize>,

    /// Rewrites allowed per chapter after a failed review
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// What to do when retries run out: degrade, abort
    #[arg(long)]
    pub on_exhaustion: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Directory for the manuscript and run records
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default quill.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = cmd::init_tracing(&cli)?;

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
        Commands::Status { output } => cmd::cmd_status(&cli, output.as_deref())?,
    }

    Ok(())
}
