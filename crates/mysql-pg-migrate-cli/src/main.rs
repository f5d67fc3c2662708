//! mysql-pg-migrate CLI - resumable MySQL to PostgreSQL migration.

use clap::{Parser, Subcommand};
use mysql_pg_migrate::drivers::{build_pool, MysqlReader};
use mysql_pg_migrate::error::{EXIT_CANCELLED, EXIT_TRANSFER_ERROR};
use mysql_pg_migrate::{
    dry_run, health_check, status, Config, MigrateError, MigrationContext, MigrationResult,
    SourceReader, Stores,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-pg-migrate")]
#[command(about = "Resumable MySQL to PostgreSQL migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep migration state in this file instead of the target database
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration, discarding recorded progress
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Resume a previously interrupted migration
    Resume {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Resume even if the configuration changed since the last run
        #[arg(long)]
        force: bool,
    },

    /// Show the migration plan and DDL without writing to the target
    DryRun,

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,

    /// Show recorded progress per table
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let workers = match &cli.command {
        Commands::Run { workers } | Commands::Resume { workers, .. } => *workers,
        _ => None,
    };
    if let Some(workers) = workers {
        config.migration.workers = Some(workers);
        config.validate()?;
    }
    let config = config.with_auto_tuning();

    match cli.command {
        Commands::Run { .. } => {
            let cancel = setup_signal_handler();
            let context = MigrationContext::connect(config, cli.state_file.as_deref(), true)
                .await?
                .with_cancel(cancel);
            let result = context.run().await;
            context.close().await;
            report_result(&result?, cli.output_json)
        }

        Commands::Resume { force, .. } => {
            if let Some(path) = &cli.state_file {
                if !path.exists() {
                    return Err(MigrateError::Config(format!(
                        "State file not found: {:?}",
                        path
                    )));
                }
            }
            let cancel = setup_signal_handler();
            let context = MigrationContext::connect(config, cli.state_file.as_deref(), false)
                .await?
                .with_cancel(cancel);
            info!("Resuming from recorded state");
            let result = context.resume(force).await;
            context.close().await;
            report_result(&result?, cli.output_json)
        }

        Commands::DryRun => {
            let source = MysqlReader::new(&config.source, 2).await?;
            let report = dry_run(&config, &source).await;
            source.close().await;
            let report = report?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.summary());
                for table in &report.tables {
                    println!("\n-- {}", table.table);
                    for sql in table.ddl.iter().chain(&table.deferred) {
                        println!("{};", sql);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => {
            let context = MigrationContext::connect(config, None, false).await?;
            let report = context.validate().await;
            context.close().await;
            let report = report?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Row count validation:");
                print!("{}", report.summary());
            }
            if report.all_match() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_TRANSFER_ERROR))
            }
        }

        Commands::HealthCheck => {
            let result = health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for (label, endpoint) in [("Source", &result.source), ("Target", &result.target)] {
                    println!(
                        "  {} ({} {}): {} ({}ms)",
                        label,
                        endpoint.db_type,
                        endpoint.endpoint,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::connection(
                    "health check",
                    "one or more endpoints are unreachable",
                ));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let stores = match &cli.state_file {
                Some(path) => {
                    if !path.exists() {
                        return Err(MigrateError::Config(format!(
                            "State file not found: {:?}",
                            path
                        )));
                    }
                    Stores::file(path, &config.plan_hash(), false)?
                }
                None => Stores::postgres(
                    build_pool(&config.target, 2)?,
                    &config.migration.state_schema,
                )?,
            };
            let report = status(stores).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.summary());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_result(result: &MigrationResult, output_json: bool) -> Result<ExitCode, MigrateError> {
    if output_json {
        println!("{}", result.to_json()?);
    } else {
        println!();
        print!("{}", result.summary());
        let failed = result.failed_tables();
        if !failed.is_empty() {
            println!("  Failed tables: {}", failed.join(", "));
        }
    }

    Ok(match result.status.as_str() {
        "completed" => ExitCode::SUCCESS,
        "cancelled" => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::from(EXIT_TRANSFER_ERROR),
    })
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries results; logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing in-flight chunks...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Cannot install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Finishing in-flight chunks...");
                token.cancel();
            }
            Err(e) => warn!("Cannot install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
