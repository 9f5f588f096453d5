use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{QmsError, Result};

/// Electronic document management system lifecycle core.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "qmsctl")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "qms-config.toml")]
    pub config_path: PathBuf,

    /// Database URL override
    #[arg(short, long)]
    pub database_url: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database file and apply schema, then exit.
    InitDb,

    /// Write a commented sample configuration file to stdout and exit.
    GenerateConfig,

    /// Walk the full audit hash chain and report on its integrity.
    VerifyAudit,

    /// Run the scheduler beat loop until interrupted.
    Run,

    /// Run a single named scheduled task once and exit.
    RunTask {
        /// Task name, e.g. "process-effective-dates" (see `Task::name`).
        name: String,
    },
}

impl Cli {
    /// Validate CLI arguments before any I/O is attempted.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.command, Command::GenerateConfig | Command::InitDb)
            && !self.config_path.exists()
        {
            return Err(QmsError::Config {
                message: format!("configuration file not found: {}", self.config_path.display()),
            });
        }
        Ok(())
    }
}
