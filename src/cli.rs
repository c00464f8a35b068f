use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blob::BlobRef;
use crate::config::{EngineConfig, LogSink, MIB};
use crate::load_config::load_config;
use crate::logging::init_logging;
use crate::pipeline;
use crate::store::{AwsCliBlobStore, BlobStore, LocalBlobStore};

/// CLI for chunk-sync: replicate a large directory tree through a blob store.
#[derive(Parser, Debug)]
#[clap(
    name = "chunk-sync",
    version,
    about = "Chunk, verify and transfer large directory trees to and from a blob store"
)]
pub struct Cli {
    #[clap(flatten)]
    pub options: GlobalOptions,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Options shared by every verb. Flags override values from `--config`.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Path to a YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Chunk size bound in MiB
    #[clap(long, global = true)]
    pub chunk_size_mb: Option<u64>,

    /// Worker pool size for build, extract and transfer phases
    #[clap(long, global = true)]
    pub max_parallel: Option<usize>,

    /// zstd level for chunk archives (1-22)
    #[clap(long, global = true)]
    pub compression_level: Option<i32>,

    /// Large subtree, relative to the source root
    #[clap(long, global = true)]
    pub large_subtree: Option<PathBuf>,

    /// Append log lines to this file instead of stderr
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Use a directory as the blob store instead of the AWS CLI
    #[clap(long, global = true)]
    pub local_store: Option<PathBuf>,

    /// Custom S3 endpoint passed to the AWS CLI
    #[clap(long, global = true)]
    pub endpoint_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split a source tree into chunk archives, a bundle, a manifest and a fingerprint
    Chunk { source_dir: PathBuf, out_dir: PathBuf },
    /// Verify a chunk directory and extract it into a destination
    Restore { chunk_dir: PathBuf, dest_dir: PathBuf },
    /// Upload a chunk directory under an s3:// prefix
    Upload { chunk_dir: PathBuf, remote_prefix: String },
    /// Download and verify the artifacts under an s3:// prefix
    Download { remote_prefix: String, chunk_dir: PathBuf },
    /// Chunk and upload, skipping everything when the remote is up to date
    Push { source_dir: PathBuf, remote_prefix: String },
    /// Download, verify and restore in one step
    Pull { remote_prefix: String, dest_dir: PathBuf },
    /// Re-check every manifest entry in a chunk directory
    Verify { chunk_dir: PathBuf },
}

impl GlobalOptions {
    /// Config file (or defaults) with flag overrides applied, validated.
    pub fn resolve(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => EngineConfig::default(),
        };
        if let Some(mb) = self.chunk_size_mb {
            config.chunk_size_bytes = mb
                .checked_mul(MIB)
                .with_context(|| format!("--chunk-size-mb {mb} overflows"))?;
        }
        if let Some(max_parallel) = self.max_parallel {
            config.max_parallel = max_parallel;
        }
        if let Some(level) = self.compression_level {
            config.compression_level = level;
        }
        if let Some(large) = &self.large_subtree {
            config.large_subtree = large.clone();
        }
        if let Some(log_file) = &self.log_file {
            config.log_sink = LogSink::File(log_file.clone());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn store(&self) -> Arc<dyn BlobStore> {
        match &self.local_store {
            Some(root) => Arc::new(LocalBlobStore::new(root)),
            None => Arc::new(AwsCliBlobStore::new(self.endpoint_url.clone())),
        }
    }
}

fn parse_prefix(input: &str) -> Result<BlobRef> {
    BlobRef::parse(input).with_context(|| format!("Invalid remote prefix {input:?}"))
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// CLI entrypoint shared by main() and the integration tests. Prints one summary
/// line to stdout on success.
pub fn run(cli: Cli) -> Result<()> {
    let config = cli.options.resolve()?;
    init_logging(&config.log_sink)?;
    tracing::info!("trace_initialised");
    config.trace_loaded();

    match cli.command {
        Commands::Chunk { source_dir, out_dir } => {
            let report = pipeline::chunk(&config, &source_dir, &out_dir)?;
            if report.skipped {
                println!(
                    "chunk: {} unchanged, reused {} artifacts ({})",
                    display(&source_dir),
                    report.artifacts.len(),
                    human_bytes(report.archive_bytes)
                );
            } else {
                println!(
                    "chunk: {} chunks + bundle, {} artifacts, {} in {} ms",
                    report.chunks,
                    report.artifacts.len(),
                    human_bytes(report.archive_bytes),
                    report.elapsed_ms
                );
            }
        }
        Commands::Restore { chunk_dir, dest_dir } => {
            let report = pipeline::restore(&config, &chunk_dir, &dest_dir)?;
            println!(
                "restore: {} artifacts, {} entries into {} ({} executables marked)",
                report.artifacts_extracted,
                report.entries,
                display(&dest_dir),
                report.executables_marked
            );
        }
        Commands::Upload { chunk_dir, remote_prefix } => {
            let prefix = parse_prefix(&remote_prefix)?;
            let report = pipeline::upload(&config, cli.options.store(), &chunk_dir, &prefix)?;
            println!(
                "upload: {} artifacts, {} to {}",
                report.artifacts,
                human_bytes(report.bytes),
                report.prefix
            );
        }
        Commands::Download { remote_prefix, chunk_dir } => {
            let prefix = parse_prefix(&remote_prefix)?;
            let report = pipeline::download(&config, cli.options.store(), &prefix, &chunk_dir)?;
            println!(
                "download: {} artifacts, {} into {}",
                report.artifacts,
                human_bytes(report.bytes),
                display(&chunk_dir)
            );
        }
        Commands::Push { source_dir, remote_prefix } => {
            let prefix = parse_prefix(&remote_prefix)?;
            let report = pipeline::push(&config, cli.options.store(), &source_dir, &prefix)?;
            match (&report.chunk, &report.transfer) {
                (Some(chunk), Some(transfer)) => println!(
                    "push: {} chunks, {} to {}",
                    chunk.chunks,
                    human_bytes(transfer.bytes),
                    transfer.prefix
                ),
                _ => println!("push: {prefix} already up to date"),
            }
        }
        Commands::Pull { remote_prefix, dest_dir } => {
            let prefix = parse_prefix(&remote_prefix)?;
            let report = pipeline::pull(&config, cli.options.store(), &prefix, &dest_dir)?;
            println!(
                "pull: {} artifacts, {} entries into {}",
                report.restore.artifacts_extracted,
                report.restore.entries,
                display(&dest_dir)
            );
        }
        Commands::Verify { chunk_dir } => {
            let report = pipeline::verify(&config, &chunk_dir)?;
            let failures = report.failures();
            if !failures.is_empty() {
                for failure in &failures {
                    println!("FAILED {failure}");
                }
                anyhow::bail!("{} manifest entries failed verification", failures.len());
            }
            println!("verify: {} entries OK", report.results.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "chunk-sync",
            "--chunk-size-mb",
            "64",
            "--max-parallel",
            "2",
            "chunk",
            "/src",
            "/out",
        ]);
        let config = cli.options.resolve().unwrap();
        assert_eq!(config.chunk_size_bytes, 64 * MIB);
        assert_eq!(config.max_parallel, 2);
        assert!(matches!(cli.command, Commands::Chunk { .. }));
    }

    #[test]
    fn global_flags_are_accepted_after_the_verb() {
        let cli = Cli::parse_from([
            "chunk-sync",
            "pull",
            "s3://bucket/envs/a",
            "/dest",
            "--local-store",
            "/tmp/store",
            "--log-file",
            "/tmp/sync.log",
        ]);
        assert_eq!(cli.options.local_store, Some(PathBuf::from("/tmp/store")));
        let config = cli.options.resolve().unwrap();
        assert_eq!(config.log_sink, LogSink::File(PathBuf::from("/tmp/sync.log")));
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let cli = Cli::parse_from(["chunk-sync", "--max-parallel", "0", "verify", "/c"]);
        assert!(cli.options.resolve().is_err());
    }

    #[test]
    fn human_bytes_scales_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * MIB), "3.0 MiB");
    }
}
