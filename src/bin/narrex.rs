//! Narrex CLI: resumable narrative extraction and character image batches.
//!
//! Usage:
//!   narrex run --input <dir> [--concurrency N] [--failed retry|skip] [--limit N]
//!   narrex images --prompts <file.json> [--output <dir>]
//!   narrex progress [--input <dir>] [--images]
//!   narrex reset [--images]
//!   narrex export [--output <file.jsonl>] [--images]

use clap::{Args, Parser, Subcommand};
use narrex::image::comfy::{ComfyBackend, ComfySettings};
use narrex::config::capacity_warning;
use narrex::image::load_prompts;
use narrex::inference::http::ChatClient;
use narrex::{
    enumerate_inputs, AdmissionGate, BatchRunner, BatchStats, CancellationToken, CheckpointStore,
    Config, ExtractionGraph, ExtractionJob, FailedPolicy, ImageBackend, ImageJob, InferenceClient,
    MockClient, MockImageBackend, OpenCheckpointStore, SqliteCheckpointStore,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "narrex",
    version,
    about = "Resumable narrative extraction over long-form text"
)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to the checkpoint ledger (SQLite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract characters, plot and satisfaction beats from every pending input
    Run(RunArgs),
    /// Generate character images from a prompt file
    Images(ImageArgs),
    /// Show ledger counts without running any work
    Progress {
        /// Also count inputs in this directory that have no ledger entry yet
        #[arg(long)]
        input: Option<PathBuf>,
        /// Use the image ledger
        #[arg(long)]
        images: bool,
    },
    /// Wipe the ledger and its extracted rows
    Reset {
        /// Use the image ledger
        #[arg(long)]
        images: bool,
    },
    /// Write extracted rows as JSON Lines
    Export {
        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Use the image ledger
        #[arg(long)]
        images: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Directory of input documents
    #[arg(long)]
    input: PathBuf,
    /// Input file extension
    #[arg(long)]
    extension: Option<String>,
    /// Documents processed concurrently
    #[arg(long)]
    concurrency: Option<usize>,
    /// Process-wide ceiling on concurrent collaborator calls
    #[arg(long)]
    admission_limit: Option<usize>,
    /// Whether previously failed inputs are retried
    #[arg(long, value_parser = parse_policy)]
    failed: Option<FailedPolicy>,
    /// Dispatch at most this many pending inputs
    #[arg(long)]
    limit: Option<usize>,
    /// Per-task collaborator timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Use the built-in mock collaborator instead of the configured server
    #[arg(long)]
    dry_run: bool,
    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ImageArgs {
    /// JSON file: [{"name": ..., "prompt": ...}]
    #[arg(long)]
    prompts: PathBuf,
    /// Output directory for images
    #[arg(long)]
    output: Option<PathBuf>,
    /// Images per character
    #[arg(long)]
    count: Option<u32>,
    /// Characters rendered concurrently
    #[arg(long)]
    concurrency: Option<usize>,
    /// Whether previously failed characters are retried
    #[arg(long, value_parser = parse_policy)]
    failed: Option<FailedPolicy>,
    /// Use the built-in mock backend instead of the configured server
    #[arg(long)]
    dry_run: bool,
    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

fn parse_policy(s: &str) -> Result<FailedPolicy, String> {
    s.parse()
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(path: &Path) -> Result<SqliteCheckpointStore, String> {
    SqliteCheckpointStore::open(path)
        .map_err(|e| format!("Failed to open ledger {}: {}", path.display(), e))
}

fn ledger_path(config: &Config, db: Option<PathBuf>, images: bool) -> PathBuf {
    db.unwrap_or_else(|| {
        if images {
            config.image_checkpoint_db()
        } else {
            config.checkpoint_db()
        }
    })
}

/// Cancel the token on Ctrl-C; committed work is kept.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing committed work and leaving the rest pending");
            handle.cancel();
        }
    });
    token
}

fn report(stats: &BatchStats, json: bool) -> i32 {
    if json {
        match serde_json::to_string_pretty(stats) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        print!("{}", stats);
    }
    if stats.failed > 0 {
        1
    } else {
        0
    }
}

async fn cmd_run(config: &Config, db: PathBuf, args: RunArgs) -> i32 {
    let extension = args
        .extension
        .unwrap_or_else(|| config.batch.input_extension.clone());
    let inputs = match enumerate_inputs(&args.input, &extension) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let store = match open_store(&db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let client: Arc<dyn InferenceClient> = if args.dry_run {
        Arc::new(MockClient::available())
    } else {
        match ChatClient::new(config.inference.chat_settings()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    };
    if !client.is_available().await {
        warn!(
            base_url = %config.inference.base_url,
            "collaborator not reachable; documents will be recorded as failed"
        );
    }

    let admission = args
        .admission_limit
        .unwrap_or(config.inference.admission_limit);
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.inference.timeout());
    let file_concurrency = args.concurrency.unwrap_or(config.batch.file_concurrency);
    if let Some(warning) = capacity_warning(file_concurrency, admission) {
        warn!("{}", warning);
    }
    let graph = ExtractionGraph::new(AdmissionGate::new(client, admission)).with_timeout(timeout);

    let runner = BatchRunner::new(
        Arc::new(store),
        args.failed.unwrap_or(config.batch.failed_policy),
    )
    .with_file_concurrency(file_concurrency)
    .with_max_consecutive_checkpoint_failures(config.batch.max_consecutive_checkpoint_failures)
    .with_limit(args.limit)
    .with_cancellation(cancel_on_interrupt());

    info!(inputs = inputs.len(), ledger = %db.display(), "starting extraction");
    match runner.run(Arc::new(ExtractionJob::new(graph)), inputs).await {
        Ok(stats) => report(&stats, args.json),
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

async fn cmd_images(config: &Config, db: PathBuf, args: ImageArgs) -> i32 {
    let prompts = match load_prompts(&args.prompts) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: cannot load {}: {}", args.prompts.display(), e);
            return 1;
        }
    };

    let backend: Arc<dyn ImageBackend> = if args.dry_run {
        Arc::new(MockImageBackend::available())
    } else {
        let settings = ComfySettings::from_template_file(
            config.image.base_url.clone(),
            &config.image.workflow_template,
            Duration::from_millis(config.image.poll_interval_ms),
        );
        match settings.and_then(ComfyBackend::new) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    };
    if !backend.is_available().await {
        eprintln!(
            "Error: image backend at {} is not reachable",
            config.image.base_url
        );
        return 1;
    }

    let store = match open_store(&db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let output = args
        .output
        .unwrap_or_else(|| config.image.output_dir.clone());
    let job = ImageJob::new(backend, output)
        .with_images_per_character(args.count.unwrap_or(config.image.images_per_character))
        .with_timeout(Duration::from_secs(config.image.timeout_secs));

    let runner = BatchRunner::new(
        Arc::new(store),
        args.failed.unwrap_or(config.batch.failed_policy),
    )
    .with_file_concurrency(args.concurrency.unwrap_or(config.image.file_concurrency))
    .with_max_consecutive_checkpoint_failures(config.batch.max_consecutive_checkpoint_failures)
    .with_cancellation(cancel_on_interrupt());

    match runner.run(Arc::new(job), prompts).await {
        Ok(stats) => report(&stats, args.json),
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

fn cmd_progress(db: &Path, input: Option<&Path>, extension: &str) -> i32 {
    let store = match open_store(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let counts = match store.counts() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    println!("{:<12} {:>8}", "STATUS", "COUNT");
    println!("{}", "-".repeat(21));
    println!("{:<12} {:>8}", "done", counts.done);
    println!("{:<12} {:>8}", "failed", counts.failed);
    println!("{:<12} {:>8}", "pending", counts.pending);

    if let Some(dir) = input {
        let inputs = match enumerate_inputs(dir, extension) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let mut unrecorded = 0;
        for input in &inputs {
            match store.entry(&input.id) {
                Ok(None) => unrecorded += 1,
                Ok(Some(_)) => {}
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return 1;
                }
            }
        }
        println!("{:<12} {:>8}", "unrecorded", unrecorded);
        if !inputs.is_empty() {
            let pct = counts.done as f64 * 100.0 / inputs.len() as f64;
            println!("{} of {} inputs done ({:.1}%)", counts.done, inputs.len(), pct);
        }
    }
    0
}

fn cmd_reset(db: &Path) -> i32 {
    let store = match open_store(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match store.reset() {
        Ok(()) => {
            println!("Reset ledger {}", db.display());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_export(db: &Path, output: Option<&Path>) -> i32 {
    let store = match open_store(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let rows = match store.rows() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut writer: Box<dyn Write> = match output {
        Some(path) => match std::fs::File::create(path) {
            Ok(f) => Box::new(std::io::BufWriter::new(f)),
            Err(e) => {
                eprintln!("Error: cannot create {}: {}", path.display(), e);
                return 1;
            }
        },
        None => Box::new(std::io::stdout().lock()),
    };
    for (id, row) in &rows {
        let line = serde_json::json!({ "id": id, "row": row });
        if let Err(e) = writeln!(writer, "{}", line) {
            eprintln!("Error: {}", e);
            return 1;
        }
    }
    if let Err(e) = writer.flush() {
        eprintln!("Error: {}", e);
        return 1;
    }
    if let Some(path) = output {
        eprintln!("Exported {} rows to {}", rows.len(), path.display());
    }
    0
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    let code = match cli.command {
        Commands::Run(args) => {
            let db = ledger_path(&config, cli.db, false);
            cmd_run(&config, db, args).await
        }
        Commands::Images(args) => {
            let db = ledger_path(&config, cli.db, true);
            cmd_images(&config, db, args).await
        }
        Commands::Progress { input, images } => {
            let db = ledger_path(&config, cli.db, images);
            cmd_progress(&db, input.as_deref(), &config.batch.input_extension)
        }
        Commands::Reset { images } => cmd_reset(&ledger_path(&config, cli.db, images)),
        Commands::Export { output, images } => {
            cmd_export(&ledger_path(&config, cli.db, images), output.as_deref())
        }
    };
    std::process::exit(code);
}
