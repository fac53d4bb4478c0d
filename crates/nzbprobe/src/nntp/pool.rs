//! Pooled NNTP client with provider failover.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::NntpConnection;
use super::{ArticleFetcher, NntpError};
use crate::config::ProviderConfig;

/// Connection pool over the configured providers.
///
/// Each provider gets its own idle-connection pool bounded by its
/// `max_connections`. A fetch walks the providers in configuration order and
/// returns the first success; an article missing everywhere surfaces as
/// [`NntpError::ArticleMissing`].
pub struct NntpPool {
    providers: Vec<ProviderPool>,
}

struct ProviderPool {
    config: ProviderConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<NntpConnection>>,
}

impl NntpPool {
    pub fn new(providers: &[ProviderConfig]) -> Result<Self, NntpError> {
        if providers.is_empty() {
            return Err(NntpError::NoProviders);
        }
        Ok(Self {
            providers: providers
                .iter()
                .cloned()
                .map(|config| ProviderPool {
                    permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
                    idle: Mutex::new(Vec::new()),
                    config,
                })
                .collect(),
        })
    }

    /// Close all idle connections.
    pub async fn quit(&self) {
        for provider in &self.providers {
            let idle = std::mem::take(&mut *provider.idle.lock().await);
            for conn in idle {
                conn.quit().await;
            }
        }
    }
}

#[async_trait]
impl ArticleFetcher for NntpPool {
    async fn body(
        &self,
        cancel: &CancellationToken,
        message_id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        groups: &[String],
    ) -> Result<u64, NntpError> {
        let mut last_err = None;
        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(NntpError::Cancelled);
            }
            match provider.fetch(cancel, message_id, sink, groups).await {
                Ok(transferred) => return Ok(transferred),
                Err(NntpError::Cancelled) => return Err(NntpError::Cancelled),
                Err(err) => {
                    debug!(
                        provider = %provider.config.host,
                        article = message_id,
                        error = %err,
                        "provider failed, trying next"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(NntpError::NoProviders))
    }
}

impl ProviderPool {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        message_id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        groups: &[String],
    ) -> Result<u64, NntpError> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(NntpError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| NntpError::Protocol("connection pool closed".to_string()))?
            }
        };

        let mut conn = match self.idle.lock().await.pop() {
            Some(conn) => conn,
            None => NntpConnection::connect(&self.config).await?,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the connection mid-command; it cannot be reused.
                return Err(NntpError::Cancelled);
            }
            result = conn.body(message_id, sink, groups) => result,
        };

        match result {
            Ok(transferred) => {
                self.idle.lock().await.push(conn);
                Ok(transferred)
            }
            // The connection is still in a good state after a 430.
            Err(err @ NntpError::ArticleMissing(_)) => {
                self.idle.lock().await.push(conn);
                Err(err)
            }
            Err(err) => {
                warn!(provider = %self.config.host, error = %err, "dropping NNTP connection");
                Err(err)
            }
        }
    }
}
