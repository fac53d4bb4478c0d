//! NNTP article fetching
//!
//! The verification engine only needs one capability: stream an article body
//! into a sink and report how many bytes came back. [`ArticleFetcher`] is
//! that seam; [`NntpPool`] is the production implementation, a set of
//! per-provider connection pools with failover.

mod client;
mod pool;

pub use pool::NntpPool;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// NNTP error type
#[derive(Error, Debug)]
pub enum NntpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no download providers configured")]
    NoProviders,

    #[error("article {0} not found")]
    ArticleMissing(String),

    #[error("authentication rejected by {host}: {reply}")]
    AuthRejected { host: String, reply: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fetch cancelled")]
    Cancelled,
}

/// Capability to fetch one article body.
///
/// Implementations must be safe for concurrent use from many tasks and must
/// observe `cancel` promptly, returning [`NntpError::Cancelled`] without
/// further network traffic once it trips.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    /// Fetch the body of `message_id`, streaming the decoded lines into
    /// `sink`. `groups` are the newsgroups the article was posted to, used
    /// as a fallback for servers that only resolve ids inside a selected
    /// group. Returns the number of body bytes transferred.
    async fn body(
        &self,
        cancel: &CancellationToken,
        message_id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        groups: &[String],
    ) -> Result<u64, NntpError>;
}
