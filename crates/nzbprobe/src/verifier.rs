//! Sampling verification engine
//!
//! Fetches a configurable fraction of each file's segments, discards the
//! bytes, and decides pass/fail against a missing-segment budget computed
//! over the whole manifest. Fetches run concurrently up to the configured
//! worker count; the first failure that crosses the budget cancels the rest
//! and becomes the reported error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ProbeError, Result};
use crate::nntp::ArticleFetcher;
use crate::nzb::Manifest;

/// Fallback fetch concurrency.
const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outcome of one verification run.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub total_segments: u64,
    pub segments_sampled: u64,
    pub segments_failed: u64,
    pub failure_rate: f64,
    pub verdict: Verdict,
}

/// Drives sampled article fetches through a shared fetcher.
///
/// The fetcher must be safe for concurrent use; every in-flight fetch of one
/// verification shares it.
pub struct Verifier {
    fetcher: Arc<dyn ArticleFetcher>,
    concurrency: usize,
}

impl Verifier {
    pub fn new(fetcher: Arc<dyn ArticleFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: if concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                concurrency
            },
        }
    }

    /// Verify `manifest`, sampling `check_percent` of each file's segments
    /// and tolerating `missing_percent` of the manifest's total segments.
    ///
    /// Returns [`ProbeError::BudgetExceeded`] once more segments fail than
    /// the budget allows, and [`ProbeError::Cancelled`] when `cancel` trips
    /// before a verdict is reached.
    pub async fn verify(
        &self,
        cancel: &CancellationToken,
        manifest: &Manifest,
        check_percent: u8,
        missing_percent: u8,
    ) -> Result<VerificationResult> {
        let total_segments = manifest.total_segments;
        let allowed_missing = total_segments * missing_percent as u64 / 100;
        info!(
            total_segments,
            allowed_missing,
            missing_percent,
            "starting verification"
        );

        // Budget breaches cancel this scope without touching the caller's.
        let scope = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let failed = Arc::new(AtomicU64::new(0));
        let fetched_bytes = Arc::new(AtomicU64::new(0));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut sampled = 0u64;

        'files: for file in &manifest.files {
            if scope.is_cancelled() {
                break;
            }

            let indices = {
                let mut rng = rand::thread_rng();
                select_indices(file.segments.len(), check_percent, &mut rng)
            };
            info!(
                file = %file.name,
                sampled = indices.len(),
                total = file.segments.len(),
                check_percent,
                "checking file"
            );
            sampled += indices.len() as u64;

            let groups: Arc<[String]> = file.groups.clone().into();
            let file_name: Arc<str> = file.name.as_str().into();

            for index in indices {
                let permit = tokio::select! {
                    _ = scope.cancelled() => break 'files,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'files,
                    },
                };

                let segment_id = file.segments[index].message_id.clone();
                let fetcher = self.fetcher.clone();
                let scope = scope.clone();
                let failed = failed.clone();
                let fetched_bytes = fetched_bytes.clone();
                let groups = groups.clone();
                let file_name = file_name.clone();

                tasks.spawn(async move {
                    let _permit = permit;
                    let mut sink = tokio::io::sink();
                    match fetcher.body(&scope, &segment_id, &mut sink, &groups).await {
                        Ok(bytes) => {
                            fetched_bytes.fetch_add(bytes, Ordering::Relaxed);
                            Ok(())
                        }
                        // A cancelled fetch is not a missing segment.
                        Err(_) if scope.is_cancelled() => Ok(()),
                        Err(err) => {
                            let current = failed.fetch_add(1, Ordering::SeqCst) + 1;
                            if current > allowed_missing {
                                error!(
                                    segment = %segment_id,
                                    file = %file_name,
                                    failed = current,
                                    total_segments,
                                    allowed_missing,
                                    missing_percent,
                                    error = %err,
                                    "too many failed segments"
                                );
                                scope.cancel();
                                Err(ProbeError::BudgetExceeded {
                                    segment_id: Some(segment_id),
                                    failed: current,
                                    total: total_segments,
                                    failure_rate: rate(current, total_segments),
                                    allowed_percent: missing_percent,
                                })
                            } else {
                                warn!(
                                    segment = %segment_id,
                                    file = %file_name,
                                    failed = current,
                                    error = %err,
                                    "segment fetch failed"
                                );
                                Ok(())
                            }
                        }
                    }
                });
            }
        }

        // The first task to cross the budget is the reporter.
        let mut budget_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if budget_err.is_none() {
                        budget_err = Some(err);
                    }
                }
                Err(join_err) => warn!(error = %join_err, "fetch task panicked"),
            }
        }

        let segments_failed = failed.load(Ordering::SeqCst);
        let failure_rate = rate(segments_failed, total_segments);
        let verdict = if segments_failed > allowed_missing {
            Verdict::Fail
        } else {
            Verdict::Pass
        };
        info!(
            total_segments,
            segments_sampled = sampled,
            segments_failed,
            bytes = fetched_bytes.load(Ordering::Relaxed),
            failure_rate = %format!("{failure_rate:.1}%"),
            allowed_missing_percent = missing_percent,
            "verification completed"
        );

        if let Some(err) = budget_err {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        if segments_failed > allowed_missing {
            return Err(ProbeError::BudgetExceeded {
                segment_id: None,
                failed: segments_failed,
                total: total_segments,
                failure_rate,
                allowed_percent: missing_percent,
            });
        }

        Ok(VerificationResult {
            total_segments,
            segments_sampled: sampled,
            segments_failed,
            failure_rate,
            verdict,
        })
    }
}

fn rate(failed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        failed as f64 * 100.0 / total as f64
    }
}

/// Pick the segment indices to fetch for one file: all of them at 100%,
/// otherwise `max(1, ⌊n·percent/100⌋)` distinct indices drawn uniformly.
fn select_indices(n: usize, check_percent: u8, rng: &mut impl Rng) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    if check_percent >= 100 {
        return (0..n).collect();
    }
    let k = (n * check_percent as usize / 100).max(1);
    if k >= n {
        (0..n).collect()
    } else {
        rand::seq::index::sample(rng, n, k).into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::{ArticleFetcher, NntpError};
    use crate::nzb::{ManifestFile, Segment};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWrite;

    fn manifest(files: usize, segments_per_file: usize) -> Manifest {
        let mut m = Manifest::default();
        for f in 0..files {
            let segments: Vec<Segment> = (0..segments_per_file)
                .map(|s| Segment {
                    message_id: format!("file{f}-seg{s}@test"),
                    bytes: 1000,
                    number: s as u32 + 1,
                })
                .collect();
            m.total_segments += segments.len() as u64;
            m.total_bytes += 1000 * segments.len() as u64;
            m.files.push(ManifestFile {
                name: format!("file{f}.rar"),
                subject: format!("file{f}.rar"),
                bytes: 1000 * segments_per_file as u64,
                groups: vec!["alt.test".to_string()],
                segments,
            });
        }
        m
    }

    /// Fetcher that fails the listed article ids and counts calls.
    struct ScriptedFetcher {
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(failing: impl IntoIterator<Item = String>) -> Self {
            Self {
                failing: failing.into_iter().collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArticleFetcher for ScriptedFetcher {
        async fn body(
            &self,
            cancel: &CancellationToken,
            message_id: &str,
            _sink: &mut (dyn AsyncWrite + Send + Unpin),
            _groups: &[String],
        ) -> std::result::Result<u64, NntpError> {
            if cancel.is_cancelled() {
                return Err(NntpError::Cancelled);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(message_id) {
                Err(NntpError::ArticleMissing(message_id.to_string()))
            } else {
                Ok(1000)
            }
        }
    }

    #[test]
    fn sampling_size_and_distinctness() {
        let mut rng = StdRng::seed_from_u64(7);

        let indices = select_indices(100, 10, &mut rng);
        assert_eq!(indices.len(), 10);
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 10);
        assert!(indices.iter().all(|&i| i < 100));

        // Floor, with a minimum of one.
        assert_eq!(select_indices(19, 10, &mut rng).len(), 1);
        assert_eq!(select_indices(5, 1, &mut rng).len(), 1);

        // 100% selects everything in order.
        assert_eq!(select_indices(4, 100, &mut rng), vec![0, 1, 2, 3]);
        assert!(select_indices(0, 50, &mut rng).is_empty());
    }

    #[tokio::test]
    async fn all_segments_pass_at_full_sample() {
        let fetcher = Arc::new(ScriptedFetcher::new([]));
        let verifier = Verifier::new(fetcher.clone(), 4);
        let cancel = CancellationToken::new();

        let result = verifier
            .verify(&cancel, &manifest(2, 10), 100, 0)
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.total_segments, 20);
        assert_eq!(result.segments_sampled, 20);
        assert_eq!(result.segments_failed, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn failures_within_budget_pass() {
        // 100 segments, 5% budget, exactly 5 failures.
        let failing = (0..5).map(|s| format!("file0-seg{s}@test"));
        let verifier = Verifier::new(Arc::new(ScriptedFetcher::new(failing)), 8);
        let cancel = CancellationToken::new();

        let result = verifier
            .verify(&cancel, &manifest(1, 100), 100, 5)
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.segments_failed, 5);
    }

    #[tokio::test]
    async fn budget_breach_reports_counts() {
        // 100 segments, 5% budget, 6 failures.
        let failing = (0..6).map(|s| format!("file0-seg{s}@test"));
        let verifier = Verifier::new(Arc::new(ScriptedFetcher::new(failing)), 1);
        let cancel = CancellationToken::new();

        let err = verifier
            .verify(&cancel, &manifest(1, 100), 100, 5)
            .await
            .unwrap_err();

        match err {
            ProbeError::BudgetExceeded {
                segment_id,
                failed,
                total,
                allowed_percent,
                ..
            } => {
                assert!(segment_id.is_some());
                assert_eq!(failed, 6);
                assert_eq!(total, 100);
                assert_eq!(allowed_percent, 5);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
        // The caller's scope stays untouched.
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn zero_budget_fails_on_first_miss() {
        let failing = ["file1-seg3@test".to_string()];
        let verifier = Verifier::new(Arc::new(ScriptedFetcher::new(failing)), 4);
        let cancel = CancellationToken::new();

        let err = verifier
            .verify(&cancel, &manifest(2, 10), 100, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::BudgetExceeded { failed: 1, .. }));
    }

    #[tokio::test]
    async fn pre_cancelled_scope_fetches_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::new([]));
        let verifier = Verifier::new(fetcher.clone(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = verifier
            .verify(&cancel, &manifest(3, 10), 100, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Cancelled));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_run_is_not_a_budget_breach() {
        /// Fails every fetch, but only after the caller cancels.
        struct CancelWaiter;

        #[async_trait]
        impl ArticleFetcher for CancelWaiter {
            async fn body(
                &self,
                cancel: &CancellationToken,
                _message_id: &str,
                _sink: &mut (dyn AsyncWrite + Send + Unpin),
                _groups: &[String],
            ) -> std::result::Result<u64, NntpError> {
                cancel.cancelled().await;
                Err(NntpError::Cancelled)
            }
        }

        let verifier = Verifier::new(Arc::new(CancelWaiter), 4);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = verifier
            .verify(&cancel, &manifest(1, 50), 100, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
    }
}
