use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use pdfsift_core::{PipelineConfig, StorageKind};

#[derive(Parser)]
#[command(
    name = "pdfsift",
    about = "Bulk static triage of suspicious PDF documents: object graph, script extraction, sandboxed deobfuscation"
)]
struct Args {
    /// A PDF file, a directory of PDFs, or a newline-delimited list of paths
    input: PathBuf,

    /// Storage backend for result records
    #[arg(short, long, default_value = "stdout", value_parser = ["stdout", "file", "jsonl"])]
    out: String,

    /// Output name stem when file or jsonl storage is used
    #[arg(short, long, default_value = "")]
    name: String,

    /// Worker process count; defaults to half the available cores
    #[arg(long)]
    workers: Option<usize>,

    /// Sample category label copied onto every record
    #[arg(long, default_value = "")]
    category: String,

    /// External similarity-digest executable (e.g. sdhash); omitted disables digests
    #[arg(long)]
    sdhash_cmd: Option<PathBuf>,

    /// Wall-clock budget per deobfuscation sandbox session
    #[arg(long, default_value_t = 10)]
    deob_timeout_secs: u64,

    /// Skip the script sandbox entirely
    #[arg(long)]
    no_sandbox: bool,

    /// Raise the default log level to debug
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let candidates = resolve_input(&args.input)?;
    info!(candidates = candidates.len(), input = %args.input.display(), "Resolved input");

    let config = PipelineConfig {
        workers: args.workers.unwrap_or_else(pdfsift_core::config::default_workers),
        storage: args.out.parse::<StorageKind>()?,
        storage_name: args.name.clone(),
        category: args.category.clone(),
        sdhash_command: args.sdhash_cmd.clone(),
        deob_timeout: Duration::from_secs(args.deob_timeout_secs),
        sandbox: !args.no_sandbox,
        ..PipelineConfig::default()
    };

    let summary = pdfsift_core::run(config, candidates)?;
    info!(
        admitted = summary.admitted,
        hashed = summary.hashed,
        stored = summary.stored,
        "Run finished"
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Directory input walks for files; a file starting with `%PDF` is a single
/// job; any other file is read as a newline-delimited path list.
fn resolve_input(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_dir() {
        let mut out = Vec::new();
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                out.push(entry.into_path());
            }
        }
        return Ok(out);
    }
    if input.is_file() {
        let mut magic = [0u8; 4];
        let mut file = fs::File::open(input)
            .with_context(|| format!("unable to open {}", input.display()))?;
        let n = file.read(&mut magic).unwrap_or(0);
        if &magic[..n] == b"%PDF" {
            return Ok(vec![input.to_path_buf()]);
        }
        let listing = fs::read_to_string(input)
            .with_context(|| format!("unable to read path list {}", input.display()))?;
        let paths: Vec<PathBuf> =
            listing.lines().map(str::trim).filter(|l| !l.is_empty()).map(PathBuf::from).collect();
        info!(jobs = paths.len(), "Read path list");
        return Ok(paths);
    }
    Err(anyhow!("unable to find PDF file or directory: {}", input.display()))
}
