//! Database migration CLI.
//!
//! Runs the bundled sqlx migrations against the workflow database and,
//! when configured, the job queue database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use server_core::Config;

#[derive(Parser)]
#[command(name = "migrate_cli", about = "Run database migrations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations.
    Run {
        /// Override DATABASE_URL from the environment.
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { database_url } => {
            let config = Config::from_env().ok();
            let url = database_url
                .or_else(|| config.as_ref().map(|c| c.database_url.clone()))
                .context("no database url: pass --database-url or set DATABASE_URL")?;

            migrate(&url).await?;

            // The queue may live in a separate database; migrate it too.
            if let Some(queue_url) = config.and_then(|c| c.job_queue_url) {
                if queue_url != url {
                    migrate(&queue_url).await?;
                }
            }
        }
    }

    Ok(())
}

async fn migrate(url: &str) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(url)
        .await
        .context("failed to connect for migrations")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    info!("migrations applied");
    Ok(())
}
