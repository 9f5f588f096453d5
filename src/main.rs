use std::sync::Arc;

use clap::Parser;
use uuid::Uuid;

use qms_core::cli::{Cli, Command};
use qms_core::config::Config;
use qms_core::database::Database;
use qms_core::filestore::LocalFileStore;
use qms_core::logging::init_tracing;
use qms_core::notification::LoggingNotificationDispatcher;
use qms_core::scheduler::{Scheduler, Task};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    if matches!(cli.command, Command::GenerateConfig) {
        println!("{}", Config::generate_sample());
        return Ok(());
    }

    let mut config = if cli.config_path.exists() {
        Config::load(&cli.config_path)?
    } else {
        Config::default()
    };
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _guard = init_tracing(&config.logging)?;
    tracing::info!(
        version = qms_core::APPLICATION_VERSION,
        organization = %config.application.organization_name,
        "starting qmsctl"
    );

    let db = Database::new(&config.database)?;

    match cli.command {
        Command::InitDb => {
            tracing::info!(url = %config.database.url, "database initialized");
        }
        Command::GenerateConfig => unreachable!(),
        Command::VerifyAudit => {
            let audit = qms_core::audit::AuditLog::new(&db);
            let report = audit.verify_chain()?;
            println!(
                "entries={} verified={} first_divergence={:?}",
                report.total_entries, report.integrity_verified, report.first_divergence_sequence
            );
            if !report.integrity_verified {
                println!("details: {}", report.details);
                std::process::exit(1);
            }
        }
        Command::Run => {
            let store = LocalFileStore::new(config.application.data_directory.clone());
            let scheduler = Scheduler::new(
                &db,
                config.scheduler.clone(),
                &store,
                Arc::new(LoggingNotificationDispatcher),
                system_actor_id(),
            );
            scheduler.run().await?;
        }
        Command::RunTask { name } => {
            let task = Task::from_name(&name).ok_or_else(|| {
                anyhow::anyhow!("unknown task: {name}")
            })?;
            let store = LocalFileStore::new(config.application.data_directory.clone());
            let scheduler = Scheduler::new(
                &db,
                config.scheduler.clone(),
                &store,
                Arc::new(LoggingNotificationDispatcher),
                system_actor_id(),
            );
            scheduler.run_task(task);
        }
    }

    Ok(())
}

/// Deterministic actor id the scheduler attributes system-initiated audit
/// entries to. Fixed rather than random so audit queries can filter on it.
fn system_actor_id() -> Uuid {
    Uuid::nil()
}
