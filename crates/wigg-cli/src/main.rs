use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wigg_adapters::RedditDumpSource;
use wigg_sync::SeedConfig;

#[derive(Debug, Parser)]
#[command(name = "wigg-cli")]
#[command(about = "Seed hook moments into a discovered table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract moments from a submission dump and upsert them.
    Seed {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        moment_table: Option<String>,
        /// Skip submissions created before this date (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the discovered schema mapping as JSON.
    Discover {
        #[arg(long)]
        moment_table: Option<String>,
    },
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is neither YYYY-MM-DD nor RFC 3339"))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(midnight) => Ok(midnight.and_utc()),
        None => bail!("'{raw}' has no midnight"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = SeedConfig::from_env()?;

    match cli.command {
        Commands::Seed {
            input,
            moment_table,
            since,
            dry_run,
        } => {
            if let Some(table) = moment_table {
                config.moment_table = table;
            }
            config.dry_run |= dry_run;
            info!(input = %input.display(), table = %config.moment_table, dry_run = config.dry_run, "starting seed run");

            let source = RedditDumpSource::new(input).with_since(since);
            let summary = wigg_sync::run_seed_once(&config, Box::new(source)).await?;
            println!(
                "seed complete: run_id={} batches={} candidates={} inserted={} updated={} dry_run={}",
                summary.run_id,
                summary.processed_batches,
                summary.candidates,
                summary.inserted,
                summary.updated,
                summary.dry_run
            );
        }
        Commands::Discover { moment_table } => {
            if let Some(table) = moment_table {
                config.moment_table = table;
            }
            let mapping = wigg_sync::discover_from_config(&config).await?;
            println!("{}", serde_json::to_string_pretty(&mapping)?);
        }
    }

    Ok(())
}
