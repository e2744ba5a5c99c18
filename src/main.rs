mod cli;

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::Parser;
use dedupstore::{BlockPacker, BlockStore, Chunk, StoreConfig, Version, open_backend};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, Get, Pack, Put};

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    match (&cli.config, &cli.disk) {
        (Some(path), _) => {
            StoreConfig::load(path).with_context(|| format!("failed to load config {path}"))
        }
        (None, Some(dir)) => Ok(StoreConfig::disk("local", dir.clone())),
        (None, None) => bail!("either --config or --disk is required"),
    }
}

async fn put(store: &dyn BlockStore, cmd: Put) -> anyhow::Result<()> {
    let data = tokio::fs::read(&cmd.file)
        .await
        .with_context(|| format!("failed to read {}", cmd.file))?;
    let version = cmd.block_version.map_or(Version::FINAL, Version::new);
    let size = data.len();
    store
        .write_block(&cmd.block_id, Bytes::from(data), version)
        .await?;
    info!(block_id = %cmd.block_id, %version, size, "block written");
    println!("{}", store.location(&cmd.block_id));
    Ok(())
}

async fn get(store: &dyn BlockStore, cmd: Get) -> anyhow::Result<()> {
    let data = store
        .read_block(&cmd.from, &cmd.block_id, cmd.offset, cmd.length)
        .await?;
    match cmd.output {
        Some(path) => tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("failed to write {path}"))?,
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

async fn pack(store: Arc<dyn BlockStore>, cmd: Pack) -> anyhow::Result<()> {
    if cmd.chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }

    let mut packer = BlockPacker::new(store, cmd.max_block_size);
    if let Some(location) = cmd.location {
        packer = packer.with_location(location);
    }

    let mut seen = HashSet::new();
    for file in &cmd.files {
        let data = Bytes::from(
            tokio::fs::read(file)
                .await
                .with_context(|| format!("failed to read {file}"))?,
        );

        let progress = ProgressBar::new(data.len() as u64).with_message(file.to_string());
        progress.set_style(
            ProgressStyle::with_template("{msg} {wide_bar} {binary_bytes}/{binary_total_bytes}")
                .context("invalid progress template")?,
        );

        let mut duplicates = 0usize;
        for start in (0..data.len()).step_by(cmd.chunk_size) {
            let end = (start + cmd.chunk_size).min(data.len());
            progress.inc((end - start) as u64);
            let Some(mut chunk) = Chunk::new(data.slice(start..end)) else {
                continue;
            };
            if !seen.insert(chunk.hash) {
                duplicates += 1;
                continue;
            }
            packer.push(&mut chunk).await?;
        }
        progress.finish_and_clear();
        debug!(%file, duplicates, "packed file");
    }

    let blocks = packer.finish().await?;
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}

async fn run(store: Arc<dyn BlockStore>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put(cmd) => put(store.as_ref(), cmd).await,
        Command::Get(cmd) => get(store.as_ref(), cmd).await,
        Command::Rm { block_id } => {
            store.delete_block(&block_id).await?;
            Ok(())
        }
        Command::Exists { block_id } => {
            println!("{}", store.block_exists(&block_id).await?);
            Ok(())
        }
        Command::Ls => {
            for block_id in store.list_blocks().await? {
                println!("{block_id}");
            }
            Ok(())
        }
        Command::Check => {
            store.verify_access().await?;
            println!("ok: {} storage {:?}", store.store_type(), store.id());
            Ok(())
        }
        Command::Pack(cmd) => pack(store, cmd).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = open_backend(&config)
        .await
        .context("failed to open block storage")?;

    let result = run(store.clone(), cli.command).await;

    // let fire-and-forget uploads land before exiting
    store.flush().await?;
    store.shutdown().await;
    result
}
