//! Daemon setup and lifecycle management

use crate::archive::{InMemoryWorkflowArchive, NullWorkflowArchive, WorkflowArchive};
use crate::cluster::InMemoryCluster;
use crate::config::ControllerConfig;
use crate::controller::WorkflowController;
use crate::error::{ControllerError, ControllerResult};
use crate::manifests::Manifests;
use crate::recorder::BroadcastRecorder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Local-mode controller daemon backed by the in-memory cluster
pub struct Daemon {
    config: ControllerConfig,
    cluster: Arc<InMemoryCluster>,
    controller: Arc<WorkflowController>,
}

impl Daemon {
    /// Build the cluster, seed it from manifests and wire up the controller
    pub async fn new(config: ControllerConfig) -> ControllerResult<Self> {
        let cluster = Arc::new(InMemoryCluster::new());

        if let Some(dir) = &config.manifests {
            let created = Manifests::load_dir(dir)?.apply(&cluster).await?;
            tracing::info!(dir = %dir.display(), objects = created, "Seeded cluster from manifests");
        }

        let archive: Arc<dyn WorkflowArchive> = if config.archive.enabled {
            Arc::new(InMemoryWorkflowArchive::new())
        } else {
            Arc::new(NullWorkflowArchive)
        };
        let recorder = Arc::new(BroadcastRecorder::default());

        let controller = WorkflowController::new(cluster.clone(), config.clone(), archive, recorder)?;

        Ok(Self {
            config,
            cluster,
            controller: Arc::new(controller),
        })
    }

    pub fn cluster(&self) -> &Arc<InMemoryCluster> {
        &self.cluster
    }

    pub fn controller(&self) -> &Arc<WorkflowController> {
        &self.controller
    }

    /// Run until Ctrl-C or SIGTERM, then wait for in-flight cycles
    pub async fn run(self) -> ControllerResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> ControllerResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        let controller = tokio::spawn(Arc::clone(&self.controller).run(cancel.clone()));

        tracing::info!(
            namespace = ?self.config.namespace,
            workers = self.config.workers.workflow,
            archive = self.config.archive.enabled,
            "Strand controller running"
        );

        shutdown.await;
        tracing::info!("Strand controller shutting down");
        cancel.cancel();

        let result = controller
            .await
            .map_err(|e| ControllerError::Config(format!("controller task failed: {}", e)))?;

        if let Ok(metrics) = self.controller.metrics().export() {
            tracing::debug!(metrics = %metrics, "Final metrics");
        }
        result
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
