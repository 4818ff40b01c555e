use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dcimsync::config::AppConfig;
use dcimsync::context::AppContext;
use dcimsync::core::{
    EntryState, IngestEvent, IngestRequest, KindFilter, MountedDevice, Orchestrator, RangeFilter,
    ScanTick, TransferResult, TransferStatus, audit_session,
};
use dcimsync::logging::{self, LogConfig};
use serde::Serialize;
use std::io::Write;
use std::ops::Not;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dcimsync")]
#[command(about = "Verified, idempotent media import from camera-style devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// List the media found under <MOUNT>/DCIM
    Scan(ScanArgs),
    /// Copy and verify media into a new session folder
    Transfer(TransferArgs),
    /// Show recent transfer runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-verify a finished session folder against its sidecars
    Audit { session: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct SelectionArgs {
    /// Mount root of the device
    mount: PathBuf,

    #[arg(long, value_enum, default_value_t = KindFilter::All)]
    kind: KindFilter,

    /// 1-based inclusive range over the photo-then-video list, e.g. 1-100
    #[arg(long)]
    range: Option<RangeFilter>,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Only count files, skipping metadata extraction
    #[arg(long)]
    count: bool,

    /// Print every entry
    #[arg(long)]
    list: bool,
}

#[derive(Args)]
struct TransferArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Device display name used for the session folder
    #[arg(long)]
    name: Option<String>,

    /// Continue into an existing session folder
    #[arg(long)]
    session: Option<PathBuf>,
}

/// Command-line overrides, merged over the config file and environment.
#[derive(Args, Serialize)]
struct SettingsArgs {
    /// Explicit config file
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long = "destination", global = true)]
    destination_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long = "history", global = true)]
    history_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long = "batch-size", global = true)]
    transfer_batch_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long = "ffprobe", global = true)]
    ffprobe_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Not::not")]
    #[arg(long, short, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.settings.config {
        Some(path) => AppConfig::load_from(path, Some(&cli.settings))?,
        None => AppConfig::new(Some(&cli.settings))?,
    };

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })?;

    match cli.command {
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Audit { session } => run_audit(session).await?,
        Commands::Scan(args) => {
            let ctx = AppContext::new(config).await?;
            run_scan(ctx, args).await.context("Scan failed")?
        }
        Commands::Transfer(args) => {
            let ctx = AppContext::new(config).await?;
            run_transfer(ctx, args).await?
        }
        Commands::History { limit } => {
            let ctx = AppContext::new(config).await?;
            run_history(ctx, limit).await?
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl-C, telling the user what will finish first.
fn cancel_on_ctrl_c(token: CancellationToken, finishing: &'static str) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current {finishing}...");
            token.cancel();
        }
    });
}

async fn run_scan(ctx: AppContext, args: ScanArgs) -> Result<()> {
    let scanner = ctx.scanner(args.selection.kind, args.selection.range);

    if args.count {
        let count = scanner.count(&args.selection.mount)?;
        println!(
            "{} photos, {} videos ({} total)",
            count.photos,
            count.videos,
            count.total()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone(), "file");

    let (tx, mut rx) = mpsc::channel::<ScanTick>(64);
    let printer = tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            eprint!("\rScanning {}/{} {:<40}", tick.processed + 1, tick.total, tick.current_name);
            let _ = std::io::stderr().flush();
        }
        eprintln!();
    });

    let inventory = scanner.scan(&args.selection.mount, tx, cancel).await?;
    let _ = printer.await;

    if args.list {
        for entry in inventory.iter() {
            println!(
                "{}\t{}\t{}",
                entry.kind().as_str(),
                entry.size_bytes,
                entry.relative_path.display()
            );
        }
    }

    let summary = inventory.summary();
    println!(
        "{} photos, {} videos, {} bytes",
        summary.photos, summary.videos, summary.total_bytes
    );
    if let Some(partial) = inventory.partial() {
        println!("({partial})");
    }
    Ok(())
}

async fn run_transfer(ctx: AppContext, args: TransferArgs) -> Result<()> {
    let device = match args.name {
        Some(name) => MountedDevice::new(name, &args.selection.mount),
        None => MountedDevice::from_mount_point(&args.selection.mount),
    };
    let request = IngestRequest {
        destination_root: ctx.config.destination_directory.clone(),
        kind: args.selection.kind,
        range: args.selection.range,
        session: args.session,
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone(), "batch");

    let (tx, mut rx) = mpsc::channel::<IngestEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let outcome = Orchestrator::new(ctx).ingest(&device, request, tx, cancel).await;
    let _ = printer.await;

    match outcome {
        Ok(result) => {
            print_result(&result);
            if result.counts.failed > 0 {
                bail!("{} file(s) failed", result.counts.failed);
            }
            Ok(())
        }
        Err(aborted) => {
            print_result(&aborted.partial);
            Err(aborted.into())
        }
    }
}

fn print_event(event: &IngestEvent) {
    match event {
        IngestEvent::Scan(tick) => {
            eprint!("\rScanning {}/{}", tick.processed + 1, tick.total);
        }
        IngestEvent::Scanned(summary) => {
            eprintln!(
                "\rFound {} photos and {} videos ({} bytes)",
                summary.photos, summary.videos, summary.total_bytes
            );
        }
        IngestEvent::Transfer(TransferStatus::Ready { destination, .. }) => {
            eprintln!("Copying into {}", destination.display());
        }
        IngestEvent::Transfer(TransferStatus::InProgress {
            percentage, message, ..
        }) => {
            eprint!("\r[{percentage:>3}%] {message:<60}");
        }
        IngestEvent::Transfer(TransferStatus::Cancelled { processed, total }) => {
            eprintln!("\nCancelled after {processed} of {total}");
        }
        IngestEvent::Transfer(TransferStatus::Failed(message)) => {
            eprintln!("\nFailed: {message}");
        }
        IngestEvent::Transfer(_) => {}
    }
    let _ = std::io::stderr().flush();
}

fn print_result(result: &TransferResult) {
    eprintln!();
    for outcome in &result.outcomes {
        if matches!(outcome.state, EntryState::Failed | EntryState::FailedCorrupt) {
            let reason = outcome
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            println!("FAILED  {}: {reason}", outcome.entry.relative_path.display());
        } else if outcome.state == EntryState::Warned {
            println!("WARNING {}: source file is empty", outcome.entry.relative_path.display());
        }
    }
    println!("{}", result.counts);
    println!("Destination: {}", result.destination.display());
}

async fn run_history(ctx: AppContext, limit: usize) -> Result<()> {
    let runs = ctx.history.runs(limit).await?;
    if runs.is_empty() {
        println!("No transfers recorded");
    }
    for run in runs {
        println!(
            "{}  {}  {}",
            run.timestamp.format("%Y-%m-%d %H:%M:%S"),
            run.results,
            run.destination_path.display()
        );
    }
    Ok(())
}

async fn run_audit(session: PathBuf) -> Result<()> {
    let report = audit_session(&session).await?;
    for path in &report.corrupted {
        println!("CORRUPT {}", path.display());
    }
    println!(
        "{} verified, {} corrupted, {} without metadata",
        report.verified,
        report.corrupted.len(),
        report.missing_metadata
    );
    if !report.is_clean() {
        bail!("{} corrupted file(s) in {}", report.corrupted.len(), session.display());
    }
    Ok(())
}
