//! Workflow controller
//!
//! Owns the resource mirrors and their watch tasks, the workflow and pod work
//! queues, the worker pools draining them and the archive garbage collector.

use crate::archive::WorkflowArchive;
use crate::cluster::{ClusterClient, ResourceApi};
use crate::config::ControllerConfig;
use crate::error::{ClusterError, ControllerError, ControllerResult};
use crate::gate::ArchiveGate;
use crate::gc::ArchivedWorkflowGc;
use crate::keylock::KeyLock;
use crate::metrics::ControllerMetrics;
use crate::mirror::{mirror, Change, MirrorReader, MirrorWriter};
use crate::operation::{operate, surface_failure};
use crate::queue::{backoff, WorkQueue};
use crate::recorder::EventRecorder;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use strand_types::{ClusterWorkflowTemplate, ObjectKey, Pod, Resource, Workflow, WorkflowTemplate};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// State shared by every operation cycle
pub struct ControllerContext {
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) config: ControllerConfig,
    pub(crate) keylock: KeyLock,
    pub(crate) workflows: MirrorReader<Workflow>,
    pub(crate) pods: MirrorReader<Pod>,
    pub(crate) templates: MirrorReader<WorkflowTemplate>,
    /// Set only when the access review allowed listing cluster-scoped templates
    pub(crate) cluster_templates: OnceLock<MirrorReader<ClusterWorkflowTemplate>>,
    pub(crate) archive: Arc<dyn WorkflowArchive>,
    pub(crate) gate: ArchiveGate,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) metrics: Arc<ControllerMetrics>,
    pub(crate) workflow_queue: WorkQueue<ObjectKey>,
}

impl ControllerContext {
    /// Re-enqueue workflows that were waiting on a released lock
    pub(crate) fn wake(&self, identities: Vec<String>) {
        for identity in identities {
            match ObjectKey::parse(&identity) {
                Some(key) => {
                    tracing::debug!(workflow = %key, "Waking lock waiter");
                    self.workflow_queue.add(key);
                }
                None => tracing::warn!(identity, "Ignoring malformed lock holder"),
            }
        }
    }
}

/// A deleted object as delivered by a watch
#[derive(Debug, Clone)]
pub enum DeletedObject {
    Workflow(Box<Workflow>),
    /// Untyped payload; only used if it decodes as a workflow
    Unstructured(serde_json::Value),
    /// Final state unknown; only its `namespace/name` key survived
    Tombstone(String),
}

impl DeletedObject {
    /// Identity of the deleted workflow, if this is one
    pub fn workflow_key(&self) -> Option<ObjectKey> {
        match self {
            DeletedObject::Workflow(wf) if !wf.metadata.name.is_empty() => Some(wf.key()),
            DeletedObject::Workflow(_) => None,
            DeletedObject::Unstructured(value) => {
                let kind = value.get("kind").and_then(|k| k.as_str());
                if kind.is_some_and(|k| k != Workflow::KIND) {
                    return None;
                }
                serde_json::from_value::<Workflow>(value.clone())
                    .ok()
                    .filter(|wf| !wf.metadata.name.is_empty())
                    .map(|wf| wf.key())
            }
            DeletedObject::Tombstone(key) => ObjectKey::parse(key),
        }
    }
}

struct Writers {
    workflows: MirrorWriter<Workflow>,
    pods: MirrorWriter<Pod>,
    templates: MirrorWriter<WorkflowTemplate>,
}

/// The reconciliation loop
pub struct WorkflowController {
    ctx: Arc<ControllerContext>,
    pod_queue: WorkQueue<ObjectKey>,
    writers: Mutex<Option<Writers>>,
    cluster_template_writer: Mutex<Option<MirrorWriter<ClusterWorkflowTemplate>>>,
}

impl WorkflowController {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: ControllerConfig,
        archive: Arc<dyn WorkflowArchive>,
        recorder: Arc<dyn EventRecorder>,
    ) -> ControllerResult<Self> {
        config.validate()?;
        let gate = ArchiveGate::from_config(&config.archive)?;
        let metrics = Arc::new(ControllerMetrics::new()?);

        let (base, max) = (config.retry.base_delay(), config.retry.max_delay());
        let workflow_queue = WorkQueue::with_backoff("workflows", base, max);
        let pod_queue = WorkQueue::with_backoff("pods", base, max);

        let (workflows_writer, workflows) = mirror();
        let (pods_writer, pods) = mirror();
        let (templates_writer, templates) = mirror();

        let ctx = ControllerContext {
            cluster,
            config,
            keylock: KeyLock::new(),
            workflows,
            pods,
            templates,
            cluster_templates: OnceLock::new(),
            archive,
            gate,
            recorder,
            metrics,
            workflow_queue,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            pod_queue,
            writers: Mutex::new(Some(Writers {
                workflows: workflows_writer,
                pods: pods_writer,
                templates: templates_writer,
            })),
            cluster_template_writer: Mutex::new(None),
        })
    }

    pub(crate) fn context(&self) -> &Arc<ControllerContext> {
        &self.ctx
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.ctx.metrics
    }

    pub fn workflows(&self) -> &MirrorReader<Workflow> {
        &self.ctx.workflows
    }

    /// Set up the cluster-scoped template mirror if the access review allows it.
    ///
    /// Returns whether the mirror exists afterwards. A denied or failed review
    /// is not an error: cluster-scoped template references simply stay
    /// unresolvable. Transient review failures are retried with backoff first.
    pub async fn create_cluster_template_mirror(&self) -> bool {
        if self.ctx.cluster_templates.get().is_some() {
            return true;
        }
        if !self.review_cluster_template_access().await {
            return false;
        }

        let (writer, reader) = mirror();
        if self.ctx.cluster_templates.set(reader).is_ok() {
            *self.cluster_template_writer.lock() = Some(writer);
        }
        true
    }

    async fn review_cluster_template_access(&self) -> bool {
        let retry = &self.ctx.config.retry;
        let mut attempt = 0;
        loop {
            match self
                .ctx
                .cluster
                .can_i("list", ClusterWorkflowTemplate::KIND, None)
                .await
            {
                Ok(true) => return true,
                Ok(false) | Err(ClusterError::Forbidden(_)) => {
                    tracing::warn!("Not allowed to list cluster workflow templates, cluster-scoped template references are disabled");
                    return false;
                }
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = backoff(attempt, retry.base_delay(), retry.max_delay());
                    tracing::debug!(error = %e, attempt, "Access review failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Access review failed, cluster-scoped template references are disabled");
                    return false;
                }
            }
        }
    }

    pub fn cluster_template_mirror(&self) -> Option<&MirrorReader<ClusterWorkflowTemplate>> {
        self.ctx.cluster_templates.get()
    }

    /// Release every lock held by or waited on by a deleted workflow.
    ///
    /// Anything that is not recognisably a workflow is ignored.
    pub fn release_all_workflow_locks(&self, obj: Option<&DeletedObject>) {
        match obj.and_then(DeletedObject::workflow_key) {
            Some(key) => {
                let woken = self.ctx.keylock.release_all(&key.to_string());
                self.ctx.wake(woken);
            }
            None => tracing::debug!("Ignoring lock release for unrecognised object"),
        }
    }

    /// Delete expired archive records until `cancel` fires
    pub async fn archived_workflow_garbage_collector(&self, cancel: CancellationToken) {
        ArchivedWorkflowGc::new(
            Arc::clone(&self.ctx.archive),
            self.ctx.config.archive.gc_interval(),
        )
        .with_metrics(Arc::clone(&self.ctx.metrics))
        .run(cancel)
        .await
    }

    /// Run until `cancel` fires, then drain in-flight cycles.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> ControllerResult<()> {
        self.create_cluster_template_mirror().await;
        let Some(Writers {
            workflows: workflows_writer,
            pods: pods_writer,
            templates: templates_writer,
        }) = self.writers.lock().take()
        else {
            return Err(ControllerError::Config(
                "workflow controller is already running".to_string(),
            ));
        };

        let namespace = self.ctx.config.namespace.clone();
        let cluster = Arc::clone(&self.ctx.cluster);
        let mut tasks = JoinSet::new();

        tracing::info!(namespace = ?namespace, "Starting workflow controller");

        {
            let events = ResourceApi::<Workflow>::watch(&*cluster, namespace.as_deref());
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let ctx = Arc::clone(&this.ctx);
                workflows_writer
                    .run(events, cancel, move |change| match change {
                        Change::Upserted(wf) => ctx.workflow_queue.add(wf.key()),
                        Change::Removed(wf) => {
                            this.release_all_workflow_locks(Some(&DeletedObject::Workflow(Box::new(wf))))
                        }
                    })
                    .await
            });
        }
        {
            let events = ResourceApi::<Pod>::watch(&*cluster, namespace.as_deref());
            let ctx = Arc::clone(&self.ctx);
            let pod_queue = self.pod_queue.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                pods_writer
                    .run(events, cancel, move |change| match change {
                        Change::Upserted(pod) => pod_queue.add(pod.key()),
                        // Gone from the mirror, so resolve the owner here.
                        Change::Removed(pod) => {
                            if let Some(owner) = pod.owning_workflow() {
                                ctx.workflow_queue
                                    .add(ObjectKey::new(pod.metadata.namespace.clone(), owner));
                            }
                        }
                    })
                    .await
            });
        }
        {
            let events = ResourceApi::<WorkflowTemplate>::watch(&*cluster, namespace.as_deref());
            tasks.spawn(templates_writer.run(events, cancel.clone(), |_| {}));
        }
        let cluster_template_writer = self.cluster_template_writer.lock().take();
        if let Some(writer) = cluster_template_writer {
            let events = ResourceApi::<ClusterWorkflowTemplate>::watch(&*cluster, None);
            tasks.spawn(writer.run(events, cancel.clone(), |_| {}));
        }

        let synced = tokio::select! {
            _ = cancel.cancelled() => false,
            synced = self.wait_for_cache_sync() => synced,
        };
        if synced {
            tracing::info!("Caches synced, starting workers");
            for worker in 0..self.ctx.config.workers.workflow {
                let this = Arc::clone(&self);
                tasks.spawn(async move { this.run_workflow_worker(worker).await });
            }
            for worker in 0..self.ctx.config.workers.pod {
                let this = Arc::clone(&self);
                tasks.spawn(async move { this.run_pod_worker(worker).await });
            }
            {
                let this = Arc::clone(&self);
                let cancel = cancel.clone();
                tasks.spawn(async move { this.archived_workflow_garbage_collector(cancel).await });
            }
        } else {
            tracing::warn!("Stopped before caches synced");
        }

        cancel.cancelled().await;
        tracing::info!("Shutting down workflow controller");
        self.ctx.workflow_queue.shutdown();
        self.pod_queue.shutdown();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Controller task failed");
            }
        }
        tracing::info!("Workflow controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self) -> bool {
        let ctx = &self.ctx;
        if !(ctx.workflows.wait_for_sync().await
            && ctx.pods.wait_for_sync().await
            && ctx.templates.wait_for_sync().await)
        {
            return false;
        }
        match ctx.cluster_templates.get() {
            Some(reader) => reader.wait_for_sync().await,
            None => true,
        }
    }

    async fn run_workflow_worker(&self, worker: usize) {
        tracing::debug!(worker, "Workflow worker started");
        let queue = &self.ctx.workflow_queue;
        while let Some(key) = queue.get().await {
            self.process_workflow(&key).await;
            queue.done(&key);
            self.ctx
                .metrics
                .queue_depth
                .with_label_values(&[queue.name()])
                .set(queue.len() as i64);
        }
        tracing::debug!(worker, "Workflow worker stopped");
    }

    async fn process_workflow(&self, key: &ObjectKey) {
        let queue = &self.ctx.workflow_queue;
        match operate(&self.ctx, key).await {
            Ok(outcome) => {
                queue.forget(key);
                tracing::trace!(workflow = %key, result = outcome.result.as_str(), "Operation cycle done");
                if let Some(delay) = outcome.requeue_after {
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(e) if e.is_transient() && queue.num_requeues(key) < self.ctx.config.retry.max_retries => {
                tracing::warn!(
                    workflow = %key,
                    error = %e,
                    attempt = queue.num_requeues(key) + 1,
                    "Transient failure, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                tracing::error!(workflow = %key, error = %e, "Operation cycle failed");
                queue.forget(key);
                if let Err(e) = surface_failure(&self.ctx, key, &e).await {
                    tracing::error!(workflow = %key, error = %e, "Failed to record workflow failure");
                }
            }
        }
    }

    async fn run_pod_worker(&self, worker: usize) {
        tracing::debug!(worker, "Pod worker started");
        while let Some(key) = self.pod_queue.get().await {
            if let Some(owner) = self.ctx.pods.get(&key).as_ref().and_then(Pod::owning_workflow) {
                self.ctx
                    .workflow_queue
                    .add(ObjectKey::new(key.namespace.clone(), owner));
            }
            self.pod_queue.done(&key);
        }
        tracing::debug!(worker, "Pod worker stopped");
    }

    /// Load every mirror straight from the cluster
    #[cfg(test)]
    pub(crate) async fn prime(&self) {
        use crate::cluster::WatchEvent;

        let cluster = &*self.ctx.cluster;
        let workflows = ResourceApi::<Workflow>::list(cluster, None).await.unwrap();
        let pods = ResourceApi::<Pod>::list(cluster, None).await.unwrap();
        let templates = ResourceApi::<WorkflowTemplate>::list(cluster, None).await.unwrap();
        let cluster_templates = ResourceApi::<ClusterWorkflowTemplate>::list(cluster, None)
            .await
            .unwrap();

        let mut writers = self.writers.lock();
        let writers = writers.as_mut().unwrap();
        writers.workflows.apply(WatchEvent::Restarted(workflows));
        writers.pods.apply(WatchEvent::Restarted(pods));
        writers.templates.apply(WatchEvent::Restarted(templates));
        if let Some(writer) = self.cluster_template_writer.lock().as_mut() {
            writer.apply(WatchEvent::Restarted(cluster_templates));
        }
    }
}
