// rifugio-monitor - scheduled availability check for a rifugio's PDF calendar
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use rifugio_monitor::config::MonitorConfig;
use rifugio_monitor::logging::init_tracing;
use rifugio_monitor::{
    content_hash, AnyNotifier, AvailabilityExtractor, DateRange, ExtractionRequest,
    ExtractionResult, HttpSource, Monitor, Notifier, TargetMonth,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (default: rifugio-monitor.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the PDF, extract, and notify about new nights (default)
    Check {
        /// Print the notice instead of sending it; state is not saved
        #[arg(long)]
        dry_run: bool,
    },
    /// Extract availability from a local PDF
    Extract {
        pdf: PathBuf,
        #[arg(long)]
        month: Option<TargetMonth>,
        /// Day range such as 9-21
        #[arg(long)]
        range: Option<DateRange>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        json: bool,
    },
    /// Print the SHA-256 content hash of a PDF
    Hash { pdf: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs)?;

    let config = MonitorConfig::load(args.config.as_deref())?;
    match args.command.unwrap_or(Command::Check { dry_run: false }) {
        Command::Check { dry_run } => check(&config, dry_run).await,
        Command::Extract { pdf, month, range, year, json } => {
            extract_file(&config, &pdf, month, range, year, json)
        }
        Command::Hash { pdf } => {
            let bytes = read_pdf(&pdf)?;
            println!("{}", content_hash(&bytes));
            Ok(())
        }
    }
}

async fn check(config: &MonitorConfig, dry_run: bool) -> Result<()> {
    let timeout = Duration::from_secs(config.source.timeout_secs);
    let source = HttpSource::new(config.source.url.clone(), timeout)?;
    let notifier = AnyNotifier::from_config(&config.notify, timeout)?;
    let monitor = Monitor::new(config, source, notifier)?.dry_run(dry_run);

    let run_timeout = Duration::from_secs(config.source.run_timeout_secs);
    let outcome = match tokio::time::timeout(run_timeout, monitor.run()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow!("run did not finish within {}s", config.source.run_timeout_secs)),
    };

    match outcome {
        Ok(report) => {
            info!(
                available = report.result.available_dates().len(),
                new = report.new_dates.len(),
                unknown = report.result.unknown_dates().len(),
                notified = report.notified,
                "check complete"
            );
            Ok(())
        }
        Err(e) => {
            error!("check failed: {:#}", e);
            if config.notify.notify_errors && !dry_run {
                if let Err(notify_err) = monitor.notifier().notify_error(&format!("{:#}", e)).await {
                    warn!("could not report the failure: {:#}", notify_err);
                }
            }
            Err(e)
        }
    }
}

fn extract_file(
    config: &MonitorConfig,
    pdf: &Path,
    month: Option<TargetMonth>,
    range: Option<DateRange>,
    year: Option<i32>,
    json: bool,
) -> Result<()> {
    let bytes = read_pdf(pdf)?;
    let month = match month {
        Some(month) => month,
        None => config.target.target_month()?,
    };
    let range = match range {
        Some(range) => range,
        None => config.target.range()?,
    };
    let request = ExtractionRequest::new(range, month).with_year(year.or(config.target.year));

    let result = AvailabilityExtractor::new(&config.extraction)
        .extract(&bytes, &request)
        .with_context(|| format!("failed to extract {}", pdf.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_table(&result, month);
    }
    Ok(())
}

fn print_table(result: &ExtractionResult, month: TargetMonth) {
    println!("{} {}", month.name(), result.range);
    for date in &result.dates {
        let method = date.method.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3} {:<4} {} {:<13} {}",
            date.day,
            date.weekday.as_deref().unwrap_or(""),
            date.status.emoji(),
            date.status.label(),
            method
        );
    }
    for skipped in &result.skipped {
        println!("skipped {}: {}", skipped.method, skipped.reason);
    }
    println!("confidence: {:?}", result.confidence());
}

fn read_pdf(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}
