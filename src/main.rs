//! Resumable Uploadr - tus 1.0 upload server and uploader
//!
//! `serve` runs the upload server; `upload` sends a local file to one.

use anyhow::Context;
use clap::{Parser, Subcommand};
use resumable_uploadr::client::{FileUrlStorage, TusClient, UploadOptions};
use resumable_uploadr::session::Metadata;
use resumable_uploadr::{config::Config, server::Server};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Resumable Uploadr - resumable file uploads over tus 1.0
#[derive(Parser, Debug)]
#[command(name = "resumable-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Upload a file, resuming an earlier attempt if one is recorded
    Upload {
        /// File to upload
        file: PathBuf,

        /// Upload collection URL
        #[arg(short, long, default_value = "http://localhost:8080/files")]
        endpoint: String,

        /// Metadata as key=value, repeatable
        #[arg(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,

        /// Bearer token sent with every request
        #[arg(long, env = "UPLOADR_TOKEN")]
        token: Option<String>,

        /// Chunk size in bytes
        #[arg(long, default_value_t = resumable_uploadr::client::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// File where upload URLs are remembered for resuming
        #[arg(long, default_value = ".resumable-uploads.json")]
        state: PathBuf,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    match args.command {
        Command::Serve { config } => serve(config).await,
        Command::Upload {
            file,
            endpoint,
            meta,
            token,
            chunk_size,
            state,
        } => {
            let mut options = UploadOptions::new(endpoint);
            options.chunk_size = chunk_size.max(1);
            options.metadata = meta
                .iter()
                .try_fold(Metadata::new(), |m, (k, v)| m.with(k, v.as_bytes()))?;

            let mut client = TusClient::new()?;
            if let Some(token) = token {
                client = client.with_bearer_token(&token)?;
            }

            let storage = FileUrlStorage::new(state);
            let outcome = client
                .upload(&file, &options, &storage, |sent, total| {
                    info!(sent, total, "Upload progress");
                })
                .await
                .with_context(|| format!("uploading {}", file.display()))?;

            println!("{}", outcome.url);
            Ok(())
        }
    }
}

async fn serve(path: PathBuf) -> anyhow::Result<()> {
    info!("Starting Resumable Uploadr v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&path)?;
    info!("Loaded configuration from {:?}", path);

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
