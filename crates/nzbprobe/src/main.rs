//! nzbprobe binary: one-shot verification and continuous scanning.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use nzbprobe::scanner::{ScanSettings, Scanner};
use nzbprobe::{Config, NntpPool, ProbeError, Verifier, VerifyQueue};

const EXIT_BAD_ARGS: u8 = 1;
const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_BAD_MANIFEST: u8 = 3;
const EXIT_POOL_FAILED: u8 = 4;
const EXIT_VERIFY_FAILED: u8 = 5;

#[derive(Parser, Debug)]
#[command(
    name = "nzbprobe",
    about = "Check that the articles of an NZB file are still available on Usenet"
)]
struct Cli {
    /// Path to the NZB file to verify (one-shot mode)
    #[arg(short = 'n', long = "nzb")]
    nzb: Option<PathBuf>,

    /// Path to the YAML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Continuously scan directories for NZB files to verify
    Scan {
        /// Path to the YAML config file
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nzbprobe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Trip `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(term) => term,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutting down...");
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Scan { config }) => run_scan(config).await,
        None => {
            let (Some(nzb), Some(config)) = (cli.nzb, cli.config) else {
                error!("both --nzb and --config are required");
                return ExitCode::from(EXIT_BAD_ARGS);
            };
            run_check(nzb, config).await
        }
    }
}

/// One-shot verification of a single NZB file.
async fn run_check(nzb_path: PathBuf, config_path: PathBuf) -> ExitCode {
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    if let Err(err) = config.validate_percents() {
        error!(error = %err, "invalid config");
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    let manifest = match nzbprobe::nzb::parse_file(&nzb_path) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!(error = %err, "failed to load NZB file");
            return ExitCode::from(EXIT_BAD_MANIFEST);
        }
    };
    println!(
        "NZB info: {} files, {} segments, total size: {} bytes",
        manifest.total_files(),
        manifest.total_segments,
        manifest.total_bytes
    );

    let pool = match NntpPool::new(&config.download_providers) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            error!(error = %err, "error creating connection pool");
            return ExitCode::from(EXIT_POOL_FAILED);
        }
    };
    let verifier = Verifier::new(pool.clone(), config.download_workers);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let outcome = verifier
        .verify(
            &cancel,
            &manifest,
            config.scanner.check_percent,
            config.scanner.missing_percent,
        )
        .await;
    pool.quit().await;

    match outcome {
        Ok(result) => {
            println!(
                "verification passed: {}/{} sampled segments available ({:.1}% failure rate)",
                result.segments_sampled - result.segments_failed,
                result.segments_sampled,
                result.failure_rate
            );
            ExitCode::SUCCESS
        }
        Err(ProbeError::Cancelled) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "error processing NZB");
            ExitCode::from(EXIT_VERIFY_FAILED)
        }
    }
}

/// Continuous scanning mode.
async fn run_scan(config_path: PathBuf) -> ExitCode {
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return ExitCode::from(EXIT_BAD_CONFIG);
        }
    };
    if let Err(err) = config.validate_for_scan() {
        error!(error = %err, "invalid scanner config");
        return ExitCode::from(EXIT_BAD_CONFIG);
    }

    let pool = match NntpPool::new(&config.download_providers) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            error!(error = %err, "error creating connection pool");
            return ExitCode::from(EXIT_POOL_FAILED);
        }
    };

    let queue = match VerifyQueue::open(&config.scanner.database_path).await {
        Ok(queue) => Arc::new(queue),
        Err(err) => {
            error!(
                path = %config.scanner.database_path.display(),
                error = %err,
                "failed to open queue database"
            );
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    let verifier = Arc::new(Verifier::new(pool.clone(), config.download_workers));
    let settings = ScanSettings::from_config(&config);
    info!(
        interval_secs = settings.scan_interval.as_secs(),
        max_files_per_day = settings.max_files_per_day,
        watch_dirs = ?settings.watch_directories,
        reprocess = ?settings.reprocess_interval,
        failed_directory = ?settings.failed_directory,
        "starting scanner..."
    );
    let scanner = Scanner::new(queue, verifier, settings);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = scanner.start(cancel).await;
    pool.quit().await;

    match result {
        Ok(()) | Err(ProbeError::Cancelled) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "scanner error");
            ExitCode::from(EXIT_VERIFY_FAILED)
        }
    }
}
