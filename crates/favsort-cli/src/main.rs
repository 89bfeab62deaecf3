mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use env_logger::Builder;
use favsort_core::worker::{self, JobHandle, ScanRequest, WorkerEvent};
use favsort_core::{CancellationToken, ExportOptions, MediaEntry, ScanOptions};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use settings::Settings;

#[derive(Parser)]
#[command(name = "favsort", version, about = "Recover the display order of favorites media and export it")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON settings file with remembered paths and scan options
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a favorites cache directory (default: the current user's cache)
    Cache {
        path: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Scan a zip archive without extracting it
    Archive {
        zip: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Destination root; files go to <output>/<YYYY-MM-DD>/<folder>
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Folder name under the date folder (default: next free number)
    #[arg(long)]
    name: Option<String>,

    /// Print the ordered list without exporting
    #[arg(long)]
    preview: bool,

    /// Re-sort by modification time before numbering
    #[arg(long)]
    by_time: bool,

    /// Print the scan report and export summary as JSON
    #[arg(long)]
    json: bool,

    /// Keep video cover images
    #[arg(long)]
    keep_thumbnails: bool,

    /// Scan the given directory as is, without looking for a favorites folder
    #[arg(long)]
    no_locate: bool,

    /// Follow symbolic links while scanning
    #[arg(long)]
    follow_links: bool,

    /// Ignore any favorites index database next to the cache
    #[arg(long)]
    no_index: bool,

    /// Do not copy source modification times onto exported files
    #[arg(long)]
    no_preserve_time: bool,
}

fn init_logging(level: Option<&str>) {
    let mut builder = Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

/// Drain a job's events into a progress bar, forwarding Ctrl-C as a cancel request.
fn run_job<T>(handle: JobHandle<T>, interrupt: &CancellationToken, label: &str) -> favsort_core::Result<T> {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(&format!("[{{bar:40}}] {{pos}}/{{len}} {} {{msg}}", label)) {
        pb.set_style(style);
    }

    loop {
        if interrupt.is_cancelled() {
            handle.cancel();
        }
        match handle.events().recv_timeout(Duration::from_millis(100)) {
            Ok(WorkerEvent::Progress(p)) => {
                pb.set_length(p.total_count);
                pb.set_position(p.current_index);
                pb.set_message(p.status_message);
            }
            Ok(WorkerEvent::Finished) | Ok(WorkerEvent::Failed(_)) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    pb.finish_and_clear();
    handle.join()
}

fn print_preview(entries: &[MediaEntry]) {
    for e in entries {
        let seq = e.sequence_number.unwrap_or(0);
        let flag = if e.order_key.is_unordered() { " (unordered)" } else { "" };
        println!(
            "{:>5}  {:<40}  {:<5}  {:?}{}",
            seq,
            e.name,
            format!("{:?}", e.kind).to_lowercase(),
            e.confidence(),
            flag
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let t_total = Instant::now();

    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        ctrlc::set_handler(move || {
            if interrupt.is_cancelled() {
                eprintln!("\nForce shutdown requested. Exiting immediately...");
                std::process::exit(130);
            }
            interrupt.cancel();
            eprintln!("\nCancel requested. Finishing current file... (Press Ctrl+C again to force quit)");
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    let (request, run) = match cli.command {
        Command::Cache { path, run } => {
            let root = path
                .or_else(|| settings.cache_path.clone())
                .or_else(favsort_core::locate::default_cache_root)
                .context("No cache directory given and no default cache folder found")?;
            let options = scan_options(&settings.scan, &run);
            (ScanRequest::Cache { root, options }, run)
        }
        Command::Archive { zip, run } => {
            let path = zip
                .or_else(|| settings.archive_path.clone())
                .context("No archive given")?;
            let options = scan_options(&settings.scan, &run);
            (ScanRequest::Archive { path, options }, run)
        }
    };

    let report = match run_job(worker::spawn_scan(request), &interrupt, "scanning") {
        Ok(report) => report,
        Err(e) if e.is_cancelled() => {
            eprintln!("Scan cancelled");
            std::process::exit(130);
        }
        Err(e) => return Err(e).context("Scan failed"),
    };
    info!("Favorites root: {}", report.root.display());
    for fault in &report.faults {
        warn!("Skipped {}", fault);
    }

    let mut entries = report.entries.clone();
    if run.by_time {
        entries = favsort_core::reorder_by_modified(entries);
    }

    if run.json {
        let mut shown = report;
        shown.entries = entries.clone();
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        print_preview(&entries);
        eprintln!(
            "{} media files, {} duplicates removed, {} skipped",
            entries.len(),
            report.duplicates_collapsed,
            report.faults.len()
        );
    }

    if run.preview {
        return Ok(());
    }
    if entries.is_empty() {
        eprintln!("No media found, nothing to export");
        return Ok(());
    }

    let destination_root = run
        .output
        .clone()
        .or(settings.output_path)
        .context("No output directory; pass --output or set output_path in the settings file")?;
    let options = ExportOptions {
        destination_root,
        folder_name: run.name.clone(),
        preserve_modified: !run.no_preserve_time,
    };

    let summary = run_job(worker::spawn_export(entries, options), &interrupt, "saving").context("Export failed")?;
    for failure in &summary.failures {
        eprintln!("Failed: {} -> {} ({})", failure.source_name, failure.destination.display(), failure.reason);
    }

    if run.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if summary.cancelled {
        eprintln!("Export cancelled");
    }
    eprintln!(
        "Done! {} succeeded, {} skipped, {} failed -> {} ({:.2}s)",
        summary.succeeded_count,
        summary.skipped_count,
        summary.failed_count,
        summary.destination_folder.display(),
        t_total.elapsed().as_secs_f64()
    );

    Ok(())
}

fn scan_options(base: &ScanOptions, run: &RunArgs) -> ScanOptions {
    let mut options = base.clone();
    if run.keep_thumbnails {
        options.skip_thumbnails = false;
    }
    if run.no_locate {
        options.locate_favorites = false;
    }
    if run.follow_links {
        options.follow_links = true;
    }
    if run.no_index {
        options.use_index = false;
    }
    options
}
