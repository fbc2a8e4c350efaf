//! chunkup CLI
//!
//! Multipart upload of local files into a directory-backed object store

use anyhow::{bail, Context};
use chunkup_rs::{
    part_count, plan_parts, FileSource, LocalStore, MultipartUploadCoordinator, UploadConfig,
    UploadRequest, DEFAULT_MAX_PART_COUNT,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chunkup")]
#[command(about = "Concurrent multipart uploads with rollback on failure")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file into a local object store directory
    Upload {
        /// File to upload
        file: PathBuf,

        /// Root directory of the object store
        #[arg(short = 'r', long)]
        root: PathBuf,

        /// Destination bucket
        #[arg(short = 'b', long)]
        bucket: String,

        /// Destination key [default: file name]
        #[arg(short = 'k', long)]
        key: Option<String>,

        /// TOML config file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Part size in bytes (overrides config)
        #[arg(long)]
        part_size: Option<u64>,

        /// Parts uploaded concurrently (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Retries per part for transient failures (overrides config)
        #[arg(long)]
        retries: Option<u32>,

        /// Abort the upload after this many seconds (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Smallest non-final part the store accepts
        #[arg(long, default_value_t = chunkup_rs::DEFAULT_MIN_PART_SIZE)]
        min_part_size: u64,
    },

    /// Print the part plan for a payload size as JSON
    Plan {
        /// Payload size in bytes
        #[arg(short = 's', long)]
        size: u64,

        /// Part size in bytes
        #[arg(long, default_value_t = chunkup_rs::config::DEFAULT_PART_SIZE)]
        part_size: u64,
    },
}

/// Load the config file, then apply command-line overrides
fn load_config(
    path: Option<&PathBuf>,
    part_size: Option<u64>,
    concurrency: Option<usize>,
    retries: Option<u32>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<UploadConfig> {
    let mut config = match path {
        Some(path) => UploadConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => UploadConfig::default(),
    };

    if let Some(part_size) = part_size {
        config.part_size = part_size;
    }
    if let Some(concurrency) = concurrency {
        config.max_concurrency = concurrency;
    }
    if let Some(retries) = retries {
        config.max_part_retries = retries;
    }
    if timeout_secs.is_some() {
        config.upload_timeout_secs = timeout_secs;
    }

    validator::Validate::validate(&config).context("Invalid upload settings")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Upload {
            file,
            root,
            bucket,
            key,
            config,
            part_size,
            concurrency,
            retries,
            timeout_secs,
            min_part_size,
        } => {
            let config = load_config(config.as_ref(), part_size, concurrency, retries, timeout_secs)?;
            info!(
                "Upload settings: part_size={}, concurrency={}, retries={}, timeout={:?}",
                config.part_size,
                config.max_concurrency,
                config.max_part_retries,
                config.upload_timeout()
            );

            let key = match key {
                Some(key) => key,
                None => match file.file_name().and_then(|name| name.to_str()) {
                    Some(name) => name.to_string(),
                    None => bail!("Cannot derive a key from {:?}, pass --key", file),
                },
            };

            let source = FileSource::open(&file)
                .await
                .with_context(|| format!("Failed to open {:?}", file))?;
            info!("Uploading {:?} ({} bytes) to {}/{}", file, source.len(), bucket, key);

            let store = Arc::new(LocalStore::new(root).with_min_part_size(min_part_size));
            let coordinator = MultipartUploadCoordinator::new(store.clone(), config);
            let request = UploadRequest::new(bucket.clone(), key.clone(), source.len());

            let summary = coordinator
                .upload_with_cancel(request, Arc::new(source), async {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => info!("Received Ctrl+C, rolling back..."),
                        // No signal handling available: never cancel
                        Err(_) => std::future::pending::<()>().await,
                    }
                })
                .await?;

            info!(
                "Stored {:?}: {} bytes, {} part(s), {} retries in {:.2?}",
                store.object_path(&bucket, &key),
                summary.bytes,
                summary.parts,
                summary.retries,
                summary.elapsed
            );
        }
        Command::Plan { size, part_size } => {
            if size == 0 || part_size == 0 {
                bail!("--size and --part-size must be greater than 0");
            }
            let count = part_count(size, part_size);
            if count > u64::from(DEFAULT_MAX_PART_COUNT) {
                bail!(
                    "{} bytes in parts of {} bytes needs {} parts, the limit is {}",
                    size,
                    part_size,
                    count,
                    DEFAULT_MAX_PART_COUNT
                );
            }
            let parts = plan_parts(size, part_size)
                .context("Part numbers do not fit in 32 bits")?;
            println!("{}", serde_json::to_string_pretty(&parts)?);
        }
    }

    Ok(())
}
