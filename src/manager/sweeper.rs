use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::SessionManager;
use crate::capture::OrphanSweepReport;
use crate::config::CaptureConfig;
use crate::error::AppResult;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Interrupted sessions failed because their recovery window passed.
    pub sessions_expired: usize,
    /// Orphaned capture entries removed.
    pub orphans: OrphanSweepReport,
}

/// Periodic maintenance: session expiry and orphan capture cleanup.
pub struct Sweeper {
    manager: Arc<SessionManager>,
    interval: Duration,
    orphan_max_age: chrono::Duration,
}

impl Sweeper {
    /// Create a sweeper with the configured interval and orphan age.
    pub fn new(manager: Arc<SessionManager>, config: &CaptureConfig) -> Self {
        let orphan_max_age_secs = i64::try_from(config.orphan_max_age_secs).unwrap_or(i64::MAX);
        Self {
            manager,
            interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            orphan_max_age: chrono::Duration::seconds(orphan_max_age_secs),
        }
    }

    /// Run one pass.
    pub async fn run_once(&self) -> AppResult<SweepSummary> {
        let sessions_expired = self.manager.expire_recoverable_sessions().await?;
        let orphans = self
            .manager
            .sweep_orphan_captures(self.orphan_max_age)
            .await?;

        let summary = SweepSummary {
            sessions_expired,
            orphans,
        };
        debug!(?summary, "Sweep pass finished");
        Ok(summary)
    }

    /// Run passes on the interval until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        info!(interval_secs = self.interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Sweep pass failed");
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }

    /// Run forever on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run_until(std::future::pending()))
    }
}
