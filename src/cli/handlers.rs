use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;

use super::errors::{CliError, CliResult};
use super::{Args, Command};
use crate::config::Config;
use crate::embeddings::OpenAiEmbedder;
use crate::service::DocumentService;
use crate::storage::{BackendLocal, StorageManager};
use crate::store::Database;

/// Open the stores under the configured data directory and wire the service.
pub fn open_service(config: &Config, vault: Option<PathBuf>) -> Result<DocumentService> {
    let storage: Arc<dyn StorageManager> = Arc::new(
        BackendLocal::new(config.base_path())
            .with_context(|| format!("failed to open data directory {}", config.base_path()))?,
    );
    let db = Database::open(
        storage,
        &config.index_name,
        config.dimensions,
        config.max_elements,
    )?;

    let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding, config.dimensions)?);

    let vault = match vault {
        Some(vault) => vault,
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    Ok(DocumentService::new(db, embedder, vault, config)?)
}

pub async fn run(args: Args, config: Config) -> Result<()> {
    let service = open_service(&config, args.vault)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        Command::MarkdownDocs {} => Ok(()),
        Command::Index { paths } => handle_index(&service, paths).await,
        Command::Related {
            document,
            heading,
            marker,
            top_k,
        } => handle_related(&service, &document, &heading, marker.as_deref(), top_k).await,
        Command::Remove { path } => {
            if !service.is_indexed(&path).await {
                println!("{path} is not indexed");
                return Ok(());
            }
            let removed = service.remove_document(&path).await?;
            println!("{} blocks removed", removed.len());
            Ok(())
        }
        Command::Rename { from, to } => {
            if service.rename_document(&from, &to).await? {
                println!("{from} -> {to}");
            } else {
                println!("{from} is not indexed");
            }
            Ok(())
        }
        Command::Status {} => {
            println!("{}", serde_json::to_string_pretty(&service.status().await)?);
            Ok(())
        }
        Command::Files {} => handle_files(&service).await,
        Command::Compact {} => {
            let reclaimed = service.compact().await?;
            println!("{reclaimed} slots reclaimed");
            Ok(())
        }
        Command::Reset { yes } => {
            match confirm_reset(yes) {
                Ok(()) => {}
                Err(CliError::UserCancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            service.reset().await?;
            println!("index reset");
            Ok(())
        }
    }
}

async fn handle_index(service: &DocumentService, paths: Vec<String>) -> Result<()> {
    let paths = if paths.is_empty() {
        service.scan_vault()
    } else {
        paths
    };

    if paths.is_empty() {
        println!("no markdown documents found");
        return Ok(());
    }

    let progress = ProgressBar::new(paths.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents {msg}",
        )?
        .progress_chars("#>-"),
    );

    let report = service.index_vault(&paths, &progress).await?;
    progress.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_related(
    service: &DocumentService,
    document: &str,
    heading: &str,
    marker: Option<&str>,
    top_k: Option<usize>,
) -> Result<()> {
    validate_related(document, heading, top_k)?;

    let Some(results) = service
        .search_latest(document, heading, marker, top_k)
        .await
    else {
        return Ok(());
    };
    let results = results?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

async fn handle_files(service: &DocumentService) -> Result<()> {
    let mut files = BTreeMap::new();
    for path in service.indexed_files().await {
        let blocks = service.file_block_ids(&path).await.len();
        files.insert(path, blocks);
    }
    println!("{}", serde_json::to_string_pretty(&files)?);
    Ok(())
}

fn validate_related(document: &str, heading: &str, top_k: Option<usize>) -> CliResult<()> {
    if document.trim().is_empty() {
        return Err(CliError::invalid_input("document name cannot be empty"));
    }
    if heading.trim().is_empty() {
        return Err(CliError::invalid_input("heading cannot be empty"));
    }
    if top_k == Some(0) {
        return Err(CliError::invalid_input("top-k must be greater than 0"));
    }
    Ok(())
}

fn confirm_reset(yes: bool) -> CliResult<()> {
    if yes {
        return Ok(());
    }

    match inquire::prompt_confirmation("This deletes every indexed block. Are you sure?") {
        InquireResult::Ok(true) => Ok(()),
        InquireResult::Ok(false) => Err(CliError::UserCancelled),
        InquireResult::Err(err) => Err(err.into()),
    }
}
