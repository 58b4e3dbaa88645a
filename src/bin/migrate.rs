use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_postgres::NoTls;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "task-market-migrate", about = "Apply pending SQL migrations")]
struct Cli {
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "migrations")]
    migrations_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .or_else(|| env::var("DATABASE_URL").ok())
        .or_else(|| env::var("DB_URL").ok())
        .context("DATABASE_URL or DB_URL must be set")?;

    let (mut client, connection) = tokio_postgres::connect(&database_url, NoTls)
        .await
        .context("connect to postgres")?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(%error, "migration connection error");
        }
    });

    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations ( \
                 filename TEXT PRIMARY KEY, \
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now() \
             )",
        )
        .await
        .context("create schema_migrations table")?;

    let mut entries: Vec<PathBuf> = fs::read_dir(&cli.migrations_dir)
        .with_context(|| format!("read migrations dir {:?}", cli.migrations_dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("sql"))
        .collect();
    entries.sort();

    for path in entries {
        let filename = path
            .file_name()
            .and_then(|f| f.to_str())
            .context("invalid migration filename")?
            .to_string();

        let already_applied = client
            .query_opt(
                "SELECT 1 FROM schema_migrations WHERE filename = $1",
                &[&filename],
            )
            .await
            .context("check schema_migrations")?
            .is_some();
        if already_applied {
            tracing::info!(filename, "skipping already-applied migration");
            continue;
        }

        let sql = fs::read_to_string(&path).with_context(|| format!("read {path:?}"))?;
        let tx = client.transaction().await.context("begin migration transaction")?;
        tx.batch_execute(&sql)
            .await
            .with_context(|| format!("apply {filename}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (filename) VALUES ($1)",
            &[&filename],
        )
        .await
        .context("record migration")?;
        tx.commit().await.context("commit migration")?;
        tracing::info!(filename, "applied migration");
    }

    Ok(())
}
