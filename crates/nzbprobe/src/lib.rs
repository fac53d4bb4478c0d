//! nzbprobe: sample-check the availability of NZB articles on Usenet
//!
//! The crate verifies that the articles referenced by an NZB file are still
//! retrievable from the configured providers. It fetches a configurable
//! fraction of the referenced segments, discards the bytes, and decides
//! pass/fail against a missing-segment budget over the whole manifest.
//!
//! Two modes are exposed through the binary:
//!
//! - one-shot: verify a single NZB file and exit
//! - scan: continuously watch directories, with a persistent queue, a daily
//!   attempt budget, optional periodic re-verification, and quarantine of
//!   failed files

pub mod config;
pub mod error;
pub mod nntp;
pub mod nzb;
pub mod queue;
pub mod scanner;
pub mod verifier;

pub use config::{Config, ProviderConfig, ScannerConfig};
pub use error::{ProbeError, Result};
pub use nntp::{ArticleFetcher, NntpError, NntpPool};
pub use nzb::{Manifest, ManifestFile, Segment};
pub use queue::{QueueItem, VerifyQueue};
pub use scanner::{ScanSettings, Scanner};
pub use verifier::{VerificationResult, Verdict, Verifier};
