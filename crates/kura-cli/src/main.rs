//! kura-upload: encrypt and upload local media into a collection.
//!
//! Set KURA_API_URL and KURA_AUTH_TOKEN (a `.env` file is read too). The collection key is
//! the base64 encoded 32-byte symmetric key of the destination collection.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kura_api_client::ApiClient;
use kura_cli::{build_assets, collect_files, format_summary, init_tracing};
use kura_core::models::{Collection, CollectionId};
use kura_core::{SymmetricKey, UploaderConfig};
use kura_processing::MediaThumbnailGenerator;
use kura_storage::HttpTransport;
use kura_uploader::{
    BatchSummary, JsonFileIndex, LocalFileIndex, MemoryFileIndex, ThreadCryptoWorkerFactory,
    TracingObserver, UploadManager, UploadServices,
};

#[derive(Parser)]
#[command(name = "kura-upload", about = "Encrypt and upload media to a kura collection")]
struct Cli {
    /// Destination collection id
    #[arg(long)]
    collection_id: CollectionId,
    /// Destination collection key, base64
    #[arg(long)]
    collection_key: String,
    /// Destination collection name
    #[arg(long, default_value = "Uploads")]
    collection_name: String,
    /// Concurrent upload workers (overrides KURA_MAX_CONCURRENT_UPLOADS)
    #[arg(long)]
    workers: Option<usize>,
    /// Extra passes over failed files
    #[arg(long, default_value = "0")]
    retry_rounds: u32,
    /// Known-files index location (overrides KURA_INDEX_PATH)
    #[arg(long)]
    index: Option<PathBuf>,
    /// Skip pulling the collection's remote files before uploading
    #[arg(long)]
    no_sync: bool,
    /// Files or directories to upload
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

async fn run(cli: Cli) -> anyhow::Result<BatchSummary> {
    let mut config = UploaderConfig::from_env().context("Invalid uploader configuration")?;
    if let Some(workers) = cli.workers {
        config.max_concurrent_uploads = workers;
    }
    if let Some(index) = cli.index {
        config.index_path = Some(index);
    }
    config.validate()?;

    let collection = Collection {
        id: cli.collection_id,
        key: SymmetricKey::from_base64(&cli.collection_key)
            .context("--collection-key is not a valid base64 key")?,
        name: cli.collection_name,
    };

    let index: Arc<dyn LocalFileIndex> = match &config.index_path {
        Some(path) => Arc::new(JsonFileIndex::new(path)),
        None => Arc::new(MemoryFileIndex::new()),
    };
    let services = UploadServices {
        api: Arc::new(ApiClient::from_config(&config)?),
        transport: Arc::new(HttpTransport::from_config(&config)?),
        thumbnailer: Arc::new(MediaThumbnailGenerator::new(
            config.thumbnail.clone(),
            config.ffmpeg_path.clone(),
        )),
        crypto: Arc::new(ThreadCryptoWorkerFactory),
        index,
        observer: Arc::new(TracingObserver),
    };
    let manager = UploadManager::new(config, services).await?;

    if !cli.no_sync {
        manager.sync_collection(&collection).await?;
    }

    let files = collect_files(&cli.paths)?;
    tracing::info!(files = files.len(), collection_id = collection.id, "Queueing files");
    let assets = build_assets(files, collection.id);

    let mut summary = manager
        .queue_files_for_upload(assets, vec![collection])
        .await?;

    for round in 1..=cli.retry_rounds {
        if summary.unfinished() == 0 {
            break;
        }
        tracing::info!(round, unfinished = summary.unfinished(), "Retrying failed files");
        let retried = manager.retry_failed_files().await?;
        merge_retry(&mut summary, retried);
    }

    Ok(summary)
}

/// Replace earlier results with the outcome of a retry pass
fn merge_retry(summary: &mut BatchSummary, retried: BatchSummary) {
    for result in retried.results {
        summary.results.retain(|r| r.local_id != result.local_id);
        summary.not_started.retain(|id| *id != result.local_id);
        summary.results.push(result);
    }
    summary.not_started.retain(|id| !retried.not_started.contains(id));
    summary.not_started.extend(retried.not_started);
    summary.results.sort_by_key(|r| r.local_id);
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(summary) => {
            print!("{}", format_summary(&summary));
            if summary.unfinished() > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Upload aborted");
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
