// ABOUTME: CLI entry point for mongo-pg-sync
// ABOUTME: Parses commands and routes to migrate or validate

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mongo_pg_sync::sync::{MigrationRunner, RunOptions};
use mongo_pg_sync::{config, mongo, postgres, report};

#[derive(Parser)]
#[command(name = "mongo-pg-sync")]
#[command(about = "Incremental MongoDB-to-PostgreSQL migration", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an incremental migration across the configured entities
    Migrate {
        /// MongoDB connection string, database name included (falls back to MONGO_URL)
        #[arg(long, env = "MONGO_URL")]
        source: String,
        /// PostgreSQL connection string (falls back to POSTGRES_URL)
        #[arg(long, env = "POSTGRES_URL")]
        target: String,
        /// Path to the entity registry TOML
        #[arg(long, default_value = "entities.toml")]
        config: PathBuf,
        /// Documents fetched per page
        #[arg(long, default_value_t = mongo::DEFAULT_PAGE_SIZE)]
        batch_size: u64,
        /// SmartDiff fallback threshold (fraction of persisted set)
        #[arg(long, default_value_t = 0.3)]
        diff_threshold: f64,
        /// Widen every entity's window back to this date or timestamp
        #[arg(long)]
        since: Option<String>,
        /// Migrate only these entities (comma-separated)
        #[arg(long, value_delimiter = ',')]
        entities: Option<Vec<String>>,
    },
    /// Check the entity registry, and connectivity when URLs are given
    Validate {
        /// Path to the entity registry TOML
        #[arg(long, default_value = "entities.toml")]
        config: PathBuf,
        /// MongoDB connection string to probe (falls back to MONGO_URL)
        #[arg(long, env = "MONGO_URL")]
        source: Option<String>,
        /// PostgreSQL connection string to probe (falls back to POSTGRES_URL)
        #[arg(long, env = "POSTGRES_URL")]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log when set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Migrate {
            source,
            target,
            config: config_path,
            batch_size,
            diff_threshold,
            since,
            entities,
        } => {
            let registry = config::load_registry(&config_path)?;

            let override_boundary = since
                .as_deref()
                .map(config::parse_boundary)
                .transpose()
                .context("Invalid --since value")?;

            let options = RunOptions {
                batch_size,
                diff_threshold,
                override_boundary,
                entities,
            };
            let runner = MigrationRunner::new(registry, options)?;

            tracing::info!("Connecting to source {}", postgres::sanitize_url(&source));
            let db = mongo::connect(&source).await?;
            tracing::info!("Connecting to target {}", postgres::sanitize_url(&target));
            let mut client = postgres::connect_with_retry(&target).await?;

            let summary = runner.run(&db, &mut client).await?;
            report::print_summary(&summary);

            if !summary.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Validate {
            config: config_path,
            source,
            target,
        } => {
            let registry = config::load_registry(&config_path)?;
            println!("Registry OK: {} entities", registry.len());
            for schema in &registry {
                println!(
                    "  {} -> {} ({:?}, order {})",
                    schema.entity, schema.table, schema.strategy, schema.order
                );
            }

            if let Some(url) = source {
                let db = mongo::connect(&url).await?;
                db.run_command(bson::doc! { "ping": 1 })
                    .await
                    .context("MongoDB ping failed")?;
                println!("Source OK: {}", postgres::sanitize_url(&url));
            }
            if let Some(url) = target {
                let client = postgres::connect_with_retry(&url).await?;
                client
                    .simple_query("SELECT 1")
                    .await
                    .context("PostgreSQL probe failed")?;
                println!("Target OK: {}", postgres::sanitize_url(&url));
            }
        }
    }

    Ok(())
}
