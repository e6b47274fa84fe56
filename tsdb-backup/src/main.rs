//! tsdb-backup - Main entry point
//!
//! Backs up and restores InfluxDB 2.x metadata and shard data.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tsdb_backup::api::HttpClient;
use tsdb_backup::config::Config;
use tsdb_backup::executor::{BackupExecutor, BackupParams, RestoreExecutor, RestoreParams};
use tsdb_backup::manifest::FileCompression;
use tsdb_backup::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Server URL (overrides config and INFLUX_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// API token (overrides config and INFLUX_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up metadata and shard data into a directory
    Backup {
        /// Directory to write the backup into
        path: PathBuf,

        #[command(flatten)]
        filters: Filters,

        /// Compression of the written files (none, gzip)
        #[arg(long)]
        compression: Option<FileCompression>,
    },
    /// Restore from the backups found in a directory
    Restore {
        /// Directory containing one or more backups
        path: PathBuf,

        /// Replace all server data with the backup
        #[arg(long)]
        full: bool,

        #[command(flatten)]
        filters: Filters,

        /// Name of the org to restore into
        #[arg(long = "new-org")]
        new_org: Option<String>,

        /// Name of the bucket to restore into
        #[arg(long = "new-bucket")]
        new_bucket: Option<String>,
    },
}

#[derive(Args, Debug)]
struct Filters {
    /// Only include buckets of the org with this ID
    #[arg(long)]
    org_id: Option<String>,

    /// Only include buckets of the org with this name
    #[arg(long)]
    org: Option<String>,

    /// Only include the bucket with this ID
    #[arg(long)]
    bucket_id: Option<String>,

    /// Only include the bucket with this name
    #[arg(long)]
    bucket: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.url = host;
    }
    if let Some(token) = cli.token {
        config.server.token = token;
    }

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("tsdb-backup v{} talking to {}", env!("CARGO_PKG_VERSION"), config.server.url);

    let token = Some(config.server.token.clone()).filter(|t| !t.is_empty());
    let client = HttpClient::new(&config.server.url, token, Some(config.timeout()))?;

    match cli.command {
        Command::Backup {
            path,
            filters,
            compression,
        } => {
            let params = BackupParams {
                path,
                org_id: filters.org_id.unwrap_or_default(),
                org: filters.org.unwrap_or_default(),
                bucket_id: filters.bucket_id.unwrap_or_default(),
                bucket: filters.bucket.unwrap_or_default(),
                compression: compression.unwrap_or(config.backup.compression),
            };
            let result = BackupExecutor::new(&client).execute(&params).await?;
            tracing::info!(
                "Wrote {} ({} buckets, {})",
                result.manifest_path.display(),
                result.manifest.buckets.len(),
                result.stats.summary()
            );
        }
        Command::Restore {
            path,
            full,
            filters,
            new_org,
            new_bucket,
        } => {
            let params = RestoreParams {
                path,
                full,
                org_id: filters.org_id.unwrap_or_default(),
                org: filters.org.unwrap_or_default(),
                bucket_id: filters.bucket_id.unwrap_or_default(),
                bucket: filters.bucket.unwrap_or_default(),
                new_org_name: new_org.unwrap_or_default(),
                new_bucket_name: new_bucket.unwrap_or_default(),
            };
            let result = RestoreExecutor::new(&client).execute(&params).await?;
            tracing::info!(
                "Restored {} buckets ({})",
                result.buckets_restored,
                result.stats.summary()
            );
        }
    }

    Ok(())
}
