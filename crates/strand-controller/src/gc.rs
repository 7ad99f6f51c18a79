//! Garbage collection of expired archive records

use crate::archive::WorkflowArchive;
use crate::error::ArchiveResult;
use crate::metrics::ControllerMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodic sweep deleting archive records past their retention deadline
pub struct ArchivedWorkflowGc {
    archive: Arc<dyn WorkflowArchive>,
    period: Duration,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl ArchivedWorkflowGc {
    pub fn new(archive: Arc<dyn WorkflowArchive>, period: Duration) -> Self {
        Self {
            archive,
            period,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delete every record expired at `now`; returns how many were removed
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> ArchiveResult<usize> {
        let expired = self.archive.list_expired(now).await?;
        let mut deleted = 0;
        for record in expired {
            match self.archive.delete(&record.id).await {
                Ok(true) => {
                    tracing::info!(workflow = %record.key, id = %record.id, "Deleted expired archived workflow");
                    deleted += 1;
                }
                // Removed concurrently
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(workflow = %record.key, error = %e, "Failed to delete archived workflow");
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.gc_deleted_total.inc_by(deleted as u64);
        }
        Ok(deleted)
    }

    /// Sweep on every tick until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.archive.is_enabled() || self.period.is_zero() {
            tracing::info!("Archive disabled, archived workflow garbage collection not started");
            return;
        }

        tracing::info!(period_secs = self.period.as_secs(), "Starting archived workflow GC");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::error!(error = %e, "Archived workflow GC failed");
                    }
                }
            }
        }

        tracing::info!("Stopped archived workflow GC");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveRecord, InMemoryWorkflowArchive, NullWorkflowArchive};
    use strand_types::{ObjectMeta, Workflow};

    async fn seed(archive: &InMemoryWorkflowArchive, name: &str, age_secs: i64, ttl_secs: i64) {
        let mut wf = Workflow {
            metadata: ObjectMeta::named("default", name),
            ..Default::default()
        };
        wf.status.finished_at = Some(Utc::now() - chrono::Duration::seconds(age_secs));
        let record =
            ArchiveRecord::from_workflow(&wf, Some(chrono::Duration::seconds(ttl_secs))).unwrap();
        archive.archive_workflow(record).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_when_already_cancelled() {
        let archive: Arc<dyn WorkflowArchive> = Arc::new(InMemoryWorkflowArchive::new());
        let gc = ArchivedWorkflowGc::new(archive, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        gc.run(cancel).await;
    }

    #[tokio::test]
    async fn test_run_returns_for_null_archive() {
        let gc = ArchivedWorkflowGc::new(Arc::new(NullWorkflowArchive), Duration::from_secs(60));
        gc.run(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired() {
        let archive = Arc::new(InMemoryWorkflowArchive::new());
        seed(&archive, "old", 120, 60).await;
        seed(&archive, "fresh", 10, 60).await;

        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let gc = ArchivedWorkflowGc::new(archive.clone(), Duration::from_secs(60))
            .with_metrics(metrics.clone());
        assert_eq!(gc.sweep_once(Utc::now()).await.unwrap(), 1);
        assert_eq!(archive.len().await.unwrap(), 1);
        assert_eq!(metrics.gc_deleted_total.get(), 1);

        assert_eq!(gc.sweep_once(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_tolerates_empty_archive() {
        let gc = ArchivedWorkflowGc::new(Arc::new(InMemoryWorkflowArchive::new()), Duration::from_secs(1));
        assert_eq!(gc.sweep_once(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_tick_until_cancelled() {
        let archive = Arc::new(InMemoryWorkflowArchive::new());
        seed(&archive, "old", 120, 60).await;
        let gc = ArchivedWorkflowGc::new(archive.clone(), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { gc.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(archive.len().await.unwrap(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
