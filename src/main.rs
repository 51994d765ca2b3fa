//! voxpack - command-line entry point.
//!
//! Verifies archives, prints their manifests, and packages an on-disk
//! chunked store into an archive.

use anyhow::Context;
use clap::Parser;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxpack::{
    archive::read_archive_manifest,
    config::{Cli, Command},
    import_archive,
    io::create_store,
    pack_store,
    utils::format_bytes,
    ImportOptions, ImportProgress, Store, StreamingArchiveWriter,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Verify { archive } => run_verify(&archive).await,
        Command::Manifest { archive } => run_manifest(&archive).await,
        Command::Pack {
            store,
            archive,
            root_prefix,
        } => run_pack(&store, &archive, &root_prefix).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose { "voxpack=debug" } else { "voxpack=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_verify(archive: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(archive)
        .await
        .with_context(|| format!("failed to read {}", archive.display()))?;
    info!("Verifying {} ({})", archive.display(), format_bytes(bytes.len() as u64));

    let options = ImportOptions::new().with_progress(Arc::new(|event: &ImportProgress| match event {
        ImportProgress::Milestone(milestone) => debug!(?milestone, "import milestone"),
        ImportProgress::Volumes { decoded, total } => debug!(decoded, total, "volumes verified"),
        ImportProgress::Bytes { .. } => {}
    }));
    let dataset = import_archive(bytes, &options)
        .await
        .with_context(|| format!("{} failed verification", archive.display()))?;

    let manifest = dataset.manifest();
    println!("format:        {}", manifest.format);
    println!("generated at:  {}", manifest.generated_at);
    println!("movie mode:    {}", manifest.dataset.movie_mode.as_str());
    println!("volumes:       {}", manifest.dataset.total_volume_count);
    for layer in &dataset.layers {
        let layer_manifest = &layer.manifest;
        println!(
            "  {} [{}] {} x{} {} timepoints, {} levels{}",
            layer_manifest.key,
            layer_manifest.channel_id,
            layer_manifest.dims(),
            layer_manifest.channels,
            layer.volumes.len(),
            layer_manifest.zarr.scales.len(),
            if layer_manifest.is_segmentation { ", segmentation" } else { "" }
        );
    }
    for track_set in &dataset.track_sets {
        println!("  tracks {} ({} rows)", track_set.id, track_set.rows.len());
    }
    println!("all digests verified");
    Ok(())
}

async fn run_manifest(archive: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(archive)
        .await
        .with_context(|| format!("failed to read {}", archive.display()))?;
    let manifest = read_archive_manifest(&bytes)?;
    let json = manifest.to_json_pretty()?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&json)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

async fn run_pack(store_url: &str, archive: &Path, root_prefix: &str) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::from(create_store(store_url)?);
    info!(
        "Packing {} store {} (root '{}') into {}",
        store.backend().as_str(),
        store_url,
        root_prefix,
        archive.display()
    );
    let file = std::fs::File::create(archive)
        .with_context(|| format!("failed to create {}", archive.display()))?;
    let packed = pack_store(store, root_prefix, StreamingArchiveWriter::new(BufWriter::new(file)))
        .await
        .with_context(|| format!("failed to pack {}", store_url))?;
    let mut sink = packed.writer.into_inner()?;
    sink.flush()?;

    info!(
        "Wrote {} entries, {} volumes",
        packed.entry_count, packed.manifest.dataset.total_volume_count
    );
    Ok(())
}
