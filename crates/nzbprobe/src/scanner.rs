//! Directory scanner, worker pool and scheduling loop
//!
//! `Scanner::start` owns the lifecycle: it spawns the verification workers,
//! runs an initial scan, then rescans on a fixed interval until the outer
//! cancellation token trips or `stop` is called. A scan walks the watch
//! roots in parallel, enrols new `.nzb` files into the persistent queue and
//! hands paths to the workers over a bounded channel. Sends never block;
//! anything that does not fit stays in the queue and re-emerges on a later
//! tick.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ignore::{WalkBuilder, WalkState};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ProbeError, Result};
use crate::nzb;
use crate::queue::{VerifyQueue, RETENTION};
use crate::verifier::{VerificationResult, Verifier};

/// Scanner knobs distilled from the configuration.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub watch_directories: Vec<PathBuf>,
    pub scan_interval: Duration,
    pub max_files_per_day: u32,
    pub concurrent_jobs: usize,
    pub reprocess_interval: Option<Duration>,
    pub failed_directory: Option<PathBuf>,
    pub check_percent: u8,
    pub missing_percent: u8,
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch_directories: config.scanner.watch_directories.clone(),
            scan_interval: config.scan_interval(),
            max_files_per_day: config.scanner.max_files_per_day,
            concurrent_jobs: config.scanner.concurrent_jobs.max(1),
            reprocess_interval: config.reprocess_interval(),
            failed_directory: config.scanner.failed_directory.clone(),
            check_percent: config.scanner.check_percent,
            missing_percent: config.scanner.missing_percent,
        }
    }
}

enum Dispatch {
    Sent,
    ChannelFull,
    OverBudget,
    AlreadyInFlight,
}

/// Continuous scanner over the configured watch directories.
pub struct Scanner {
    queue: Arc<VerifyQueue>,
    verifier: Arc<Verifier>,
    settings: Arc<ScanSettings>,
    job_tx: mpsc::Sender<PathBuf>,
    job_rx: StdMutex<Option<mpsc::Receiver<PathBuf>>>,
    /// Paths sitting in the channel or being verified right now. Keeps one
    /// path from being dispatched twice within the process.
    inflight: Arc<StdMutex<HashSet<PathBuf>>>,
    stop: CancellationToken,
}

struct WorkerCtx {
    id: usize,
    queue: Arc<VerifyQueue>,
    verifier: Arc<Verifier>,
    settings: Arc<ScanSettings>,
    inflight: Arc<StdMutex<HashSet<PathBuf>>>,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(queue: Arc<VerifyQueue>, verifier: Arc<Verifier>, settings: ScanSettings) -> Self {
        let (job_tx, job_rx) = mpsc::channel(settings.concurrent_jobs.max(1));
        Self {
            queue,
            verifier,
            settings: Arc::new(settings),
            job_tx,
            job_rx: StdMutex::new(Some(job_rx)),
            inflight: Arc::new(StdMutex::new(HashSet::new())),
            stop: CancellationToken::new(),
        }
    }

    /// Run until `cancel` trips or [`Scanner::stop`] is called.
    ///
    /// Returns `Err(Cancelled)` for an external cancellation and `Ok(())`
    /// for an explicit stop. Workers are joined and the queue is closed
    /// exactly once before returning.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let job_rx = self
            .job_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| ProbeError::Config("scanner already started".to_string()))?;
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(self.settings.concurrent_jobs);
        for id in 0..self.settings.concurrent_jobs {
            let ctx = WorkerCtx {
                id,
                queue: self.queue.clone(),
                verifier: self.verifier.clone(),
                settings: self.settings.clone(),
                inflight: self.inflight.clone(),
                stop: self.stop.clone(),
                cancel: cancel.clone(),
            };
            workers.push(tokio::spawn(worker_loop(ctx, job_rx.clone())));
        }

        self.scan(&cancel).await;

        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately and the initial scan already ran.
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(ProbeError::Cancelled),
                _ = self.stop.cancelled() => break Ok(()),
                _ = ticker.tick() => self.scan(&cancel).await,
            }
        };

        // Workers drain on the stop signal; join them before the store goes
        // away so mark_processed never races the close.
        self.stop.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        self.queue.close().await;

        outcome
    }

    /// Request a clean stop. Workers exit once their current file finishes.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// One scan pass: walk, enrol, dispatch, reprocess, prune.
    pub async fn scan(&self, cancel: &CancellationToken) {
        info!("starting directory scan");

        for path in self.collect_candidates(cancel).await {
            if cancel.is_cancelled() || self.stop.is_cancelled() {
                return;
            }
            if self.queue.contains(&path).await {
                continue;
            }
            if !self.queue.add(&path).await {
                continue;
            }
            info!(path = %path.display(), "found new NZB file");
            self.dispatch(path).await;
        }

        self.dispatch_pending(cancel).await;

        if self.settings.reprocess_interval.is_some() {
            self.check_reprocess_items(cancel).await;
        }

        let pruned = self.queue.prune_old_items(RETENTION).await;
        if pruned > 0 {
            info!(count = pruned, "pruned old items from queue");
        }

        info!("directory scan completed");
    }

    /// Walk every watch root in parallel and collect `.nzb` candidates.
    /// Sorted so enqueue order within one scan is deterministic.
    async fn collect_candidates(&self, cancel: &CancellationToken) -> Vec<PathBuf> {
        let roots = self.settings.watch_directories.clone();
        let cancel = cancel.clone();

        let walk = tokio::task::spawn_blocking(move || {
            let found: Arc<StdMutex<Vec<PathBuf>>> = Arc::new(StdMutex::new(Vec::new()));

            for root in &roots {
                if cancel.is_cancelled() {
                    break;
                }
                if !root.exists() {
                    warn!(dir = %root.display(), "watch directory does not exist");
                    continue;
                }

                let walker = WalkBuilder::new(root)
                    .hidden(false)
                    .follow_links(false)
                    .ignore(false)
                    .git_ignore(false)
                    .git_global(false)
                    .git_exclude(false)
                    .build_parallel();

                walker.run(|| {
                    let found = found.clone();
                    let cancel = cancel.clone();
                    Box::new(move |entry| {
                        if cancel.is_cancelled() {
                            return WalkState::Quit;
                        }
                        let entry = match entry {
                            Ok(entry) => entry,
                            Err(err) => {
                                warn!(error = %err, "error scanning directory");
                                return WalkState::Continue;
                            }
                        };
                        if entry.file_type().map_or(true, |t| !t.is_file()) {
                            return WalkState::Continue;
                        }
                        if !is_nzb(entry.path()) {
                            return WalkState::Continue;
                        }
                        if let Ok(mut found) = found.lock() {
                            found.push(entry.path().to_path_buf());
                        }
                        WalkState::Continue
                    })
                });
            }

            let mut paths = match Arc::try_unwrap(found) {
                Ok(mutex) => mutex.into_inner().unwrap_or_default(),
                Err(arc) => arc.lock().map(|v| v.clone()).unwrap_or_default(),
            };
            paths.sort();
            paths
        })
        .await;

        match walk {
            Ok(paths) => paths,
            Err(err) => {
                error!(error = %err, "directory walk task panicked");
                Vec::new()
            }
        }
    }

    /// Budget-gated, non-blocking handoff of one path to the workers.
    async fn dispatch(&self, path: PathBuf) -> Dispatch {
        if self.queue.processed_today().await >= self.settings.max_files_per_day as u64 {
            info!(
                path = %path.display(),
                "daily processing limit reached, file will be processed on a later day"
            );
            return Dispatch::OverBudget;
        }

        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !inflight.insert(path.clone()) {
                return Dispatch::AlreadyInFlight;
            }
        }

        match self.job_tx.try_send(path.clone()) {
            Ok(()) => {
                info!(path = %path.display(), "queued file for verification");
                Dispatch::Sent
            }
            Err(TrySendError::Full(path)) | Err(TrySendError::Closed(path)) => {
                self.inflight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&path);
                info!(
                    path = %path.display(),
                    "worker channel is full, file will be picked up later"
                );
                Dispatch::ChannelFull
            }
        }
    }

    /// Re-offer enrolled-but-unprocessed items left over from earlier scans
    /// (full channel or exhausted budget).
    async fn dispatch_pending(&self, cancel: &CancellationToken) {
        for item in self.queue.pending_items().await {
            if cancel.is_cancelled() || self.stop.is_cancelled() {
                return;
            }
            match self.dispatch(PathBuf::from(&item.file_path)).await {
                Dispatch::ChannelFull | Dispatch::OverBudget => return,
                Dispatch::Sent | Dispatch::AlreadyInFlight => {}
            }
        }
    }

    /// Re-enqueue processed items whose reprocess interval has elapsed,
    /// clipped to the remaining daily budget.
    async fn check_reprocess_items(&self, cancel: &CancellationToken) {
        let Some(interval) = self.settings.reprocess_interval else {
            return;
        };

        let items = self.queue.items_due_for_reprocessing(interval).await;
        if items.is_empty() {
            return;
        }
        info!(count = items.len(), "found items to reprocess");

        let done = self.queue.processed_today().await;
        let available = (self.settings.max_files_per_day as u64).saturating_sub(done);
        if available == 0 {
            info!("daily processing limit reached, items will be reprocessed on a later day");
            return;
        }

        for item in items.into_iter().take(available as usize) {
            if cancel.is_cancelled() || self.stop.is_cancelled() {
                return;
            }
            let path = PathBuf::from(&item.file_path);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => {}
                _ => {
                    info!(path = %item.file_path, "file no longer exists, skipping reprocessing");
                    continue;
                }
            }
            info!(
                path = %item.file_path,
                last_processed = ?item.processed_at,
                process_count = item.process_count,
                "queuing item for reprocessing"
            );
            if matches!(self.dispatch(path).await, Dispatch::ChannelFull) {
                info!("worker channel is full, remaining items will be reprocessed later");
                return;
            }
        }
    }
}

/// One verification worker: receive a path, verify it, record the attempt.
async fn worker_loop(ctx: WorkerCtx, job_rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>) {
    debug!(worker = ctx.id, "verification worker started");
    loop {
        let path = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ctx.stop.cancelled() => break,
                received = rx.recv() => match received {
                    Some(path) => path,
                    None => break,
                },
            }
        };

        let keep_going = process_path(&ctx, &path).await;
        ctx.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&path);
        if !keep_going {
            break;
        }
    }
    debug!(worker = ctx.id, "verification worker stopped");
}

/// Returns `false` when the worker should exit (cancelled mid-verification).
async fn process_path(ctx: &WorkerCtx, path: &Path) -> bool {
    if ctx.queue.processed_today().await >= ctx.settings.max_files_per_day as u64 {
        info!(
            path = %path.display(),
            "daily processing limit reached, skipping file"
        );
        return true;
    }

    match verify_file(ctx, path).await {
        Ok(result) => {
            info!(
                path = %path.display(),
                sampled = result.segments_sampled,
                failed = result.segments_failed,
                "verification passed"
            );
        }
        Err(ProbeError::Cancelled) => {
            // Shutdown, not a verdict. Leave the item untouched for the
            // next run.
            debug!(path = %path.display(), "verification cancelled");
            return false;
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "verification failed");
            if let Some(failed_dir) = &ctx.settings.failed_directory {
                if let Err(move_err) =
                    quarantine(&ctx.settings.watch_directories, failed_dir, path).await
                {
                    error!(
                        path = %path.display(),
                        target_dir = %failed_dir.display(),
                        error = %move_err,
                        "failed to move file to failed directory"
                    );
                }
            }
        }
    }

    // Attempted is attempted, pass or fail; this is what the daily budget
    // and the reprocess clock count.
    ctx.queue.mark_processed(path).await;
    true
}

async fn verify_file(ctx: &WorkerCtx, path: &Path) -> Result<VerificationResult> {
    info!(path = %path.display(), "processing NZB file");
    let manifest = nzb::parse_file(path)?;
    info!(
        files = manifest.total_files(),
        segments = manifest.total_segments,
        bytes = manifest.total_bytes,
        "manifest loaded"
    );
    ctx.verifier
        .verify(
            &ctx.cancel,
            &manifest,
            ctx.settings.check_percent,
            ctx.settings.missing_percent,
        )
        .await
}

fn is_nzb(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("nzb"))
}

/// Move a failed file under `failed_dir`, preserving its path relative to
/// the watch root that contains it. Falls back to the bare filename when no
/// root is a prefix, and to copy-then-delete when rename crosses devices.
pub async fn quarantine(
    watch_dirs: &[PathBuf],
    failed_dir: &Path,
    file: &Path,
) -> std::io::Result<()> {
    let abs_file = std::path::absolute(file)?;

    let mut target = None;
    for dir in watch_dirs {
        let Ok(abs_dir) = std::path::absolute(dir) else {
            continue;
        };
        if let Ok(rel) = abs_file.strip_prefix(&abs_dir) {
            target = Some(failed_dir.join(rel));
            break;
        }
    }
    let target = match target {
        Some(target) => target,
        None => match abs_file.file_name() {
            Some(name) => failed_dir.join(name),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file has no basename",
                ))
            }
        },
    };

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(&abs_file, &target).await.is_err() {
        tokio::fs::copy(&abs_file, &target).await?;
        tokio::fs::remove_file(&abs_file).await?;
    }

    info!(from = %abs_file.display(), to = %target.display(), "moved failed NZB file");
    Ok(())
}
