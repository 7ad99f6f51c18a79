//! The per-workflow operation cycle
//!
//! One call to [`operate`] advances one workflow by one step:
//!
//! 1. Take the workflow's key lock
//! 2. Resolve the executable spec (template reference, then defaults)
//! 3. Admit a new workflow, or map its pods' phases onto its nodes
//! 4. On a terminal phase, archive if the gate approves, then persist
//!
//! The key lock is a guard, so it is released on every exit path.

use crate::archive::ArchiveRecord;
use crate::cluster::ResourceApi;
use crate::controller::ControllerContext;
use crate::error::{ControllerError, ControllerResult, ResolveError};
use crate::keylock::NamedAcquire;
use crate::resolver::{load_execution_spec, set_workflow_defaults};
use chrono::{DateTime, Utc};
use std::time::Duration;
use strand_types::{
    labels, EventType, LockKind, NodePhase, NodeStatus, ObjectKey, ObjectMeta, ObjectReference,
    Pod, PodPhase, PodSpec, Resource, Template, Workflow, WorkflowPhase,
};

/// What a cycle did to the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Nothing to do
    NoOp,
    /// State moved forward and was persisted
    Progressed,
    /// The workflow reached a terminal phase in this cycle
    Terminal,
}

impl Reconciled {
    pub fn as_str(self) -> &'static str {
        match self {
            Reconciled::NoOp => "noop",
            Reconciled::Progressed => "progressed",
            Reconciled::Terminal => "terminal",
        }
    }
}

/// Result of one operation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub result: Reconciled,

    /// Run the workflow again after this delay (TTL expiry)
    pub requeue_after: Option<Duration>,
}

impl OperationOutcome {
    fn of(result: Reconciled) -> Self {
        Self {
            result,
            requeue_after: None,
        }
    }
}

/// Run one operation cycle for the workflow at `key`
pub async fn operate(ctx: &ControllerContext, key: &ObjectKey) -> ControllerResult<OperationOutcome> {
    let identity = key.to_string();
    let _guard = ctx.keylock.acquire(&identity).await;
    let timer = ctx.metrics.operation_duration_seconds.start_timer();

    let result = operate_locked(ctx, key, &identity).await;

    timer.observe_duration();
    let outcome = match &result {
        Ok(outcome) => outcome.result.as_str(),
        Err(_) => "error",
    };
    ctx.metrics.operations_total.with_label_values(&[outcome]).inc();
    result
}

/// Mark the workflow at `key` as errored after its cycle failed for good
pub async fn surface_failure(
    ctx: &ControllerContext,
    key: &ObjectKey,
    err: &ControllerError,
) -> ControllerResult<()> {
    let identity = key.to_string();
    let _guard = ctx.keylock.acquire(&identity).await;

    let wf = match ResourceApi::<Workflow>::get(&*ctx.cluster, key).await {
        Ok(wf) => wf,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if wf.is_completed() {
        return Ok(());
    }
    let exec = resolve(ctx, &wf).unwrap_or_else(|_| wf.clone());
    finish(ctx, wf, &exec, &identity, WorkflowPhase::Error, err.to_string()).await?;
    Ok(())
}

async fn operate_locked(
    ctx: &ControllerContext,
    key: &ObjectKey,
    identity: &str,
) -> ControllerResult<OperationOutcome> {
    let wf = match ResourceApi::<Workflow>::get(&*ctx.cluster, key).await {
        Ok(wf) => wf,
        Err(e) if e.is_not_found() => {
            tracing::debug!(workflow = %key, "Workflow is gone");
            ctx.wake(ctx.keylock.release_all(identity));
            return Ok(OperationOutcome::of(Reconciled::NoOp));
        }
        Err(e) => return Err(e.into()),
    };
    if wf.metadata.deletion_timestamp.is_some() {
        ctx.wake(ctx.keylock.release_all(identity));
        return Ok(OperationOutcome::of(Reconciled::NoOp));
    }

    let exec = match resolve(ctx, &wf) {
        Ok(exec) => exec,
        // A finished workflow only needs archiving and TTL; its template may be long gone.
        Err(e) if wf.is_completed() => {
            tracing::debug!(workflow = %key, error = %e, "Using stored spec of completed workflow");
            wf.clone()
        }
        Err(e) => {
            let message = match &e {
                ResolveError::Serialization(_) => format!("invalid workflow spec: {}", e),
                _ => e.to_string(),
            };
            tracing::warn!(workflow = %key, error = %e, "Failed to resolve workflow spec");
            let stored = wf.clone();
            return finish(ctx, wf, &stored, identity, WorkflowPhase::Error, message).await;
        }
    };

    if wf.is_completed() {
        return reconcile_completed(ctx, wf, &exec, key, identity).await;
    }

    if matches!(wf.status.phase, WorkflowPhase::Unset | WorkflowPhase::Pending) {
        if let Some(outcome) = acquire_synchronization(ctx, &wf, &exec, key, identity).await? {
            return Ok(outcome);
        }
        return admit(ctx, wf, &exec, identity).await;
    }

    reconcile_nodes(ctx, wf, &exec, key, identity).await
}

fn resolve(ctx: &ControllerContext, wf: &Workflow) -> Result<Workflow, ResolveError> {
    let mut exec = wf.clone();
    exec.spec = load_execution_spec(wf, &ctx.templates, ctx.cluster_templates.get())?;
    set_workflow_defaults(&mut exec, ctx.config.workflow_defaults.as_ref())?;
    Ok(exec)
}

async fn persist(ctx: &ControllerContext, wf: Workflow) -> ControllerResult<Workflow> {
    Ok(ResourceApi::<Workflow>::update(&*ctx.cluster, wf).await?)
}

fn record(ctx: &ControllerContext, wf: &Workflow, event_type: EventType, reason: &str, message: &str) {
    ctx.recorder
        .record(ObjectReference::to(wf), event_type, reason, message);
}

fn transition(ctx: &ControllerContext, wf: &mut Workflow, phase: WorkflowPhase) {
    if wf.status.phase != phase {
        wf.status.phase = phase;
        ctx.metrics
            .phase_transitions_total
            .with_label_values(&[phase.as_str()])
            .inc();
    }
}

/// Hold the workflow's declared named lock before it starts.
///
/// Returns an outcome when the workflow has to keep waiting.
async fn acquire_synchronization(
    ctx: &ControllerContext,
    wf: &Workflow,
    exec: &Workflow,
    key: &ObjectKey,
    identity: &str,
) -> ControllerResult<Option<OperationOutcome>> {
    let Some(sync) = &exec.spec.synchronization else {
        return Ok(None);
    };
    let (Some((kind, name)), Some(lock_key)) = (sync.lock(), sync.lock_key(&key.namespace)) else {
        return Ok(None);
    };
    let limit = match kind {
        LockKind::Semaphore => ctx.config.semaphore_limit(&key.namespace, name),
        LockKind::Mutex => 1,
    };

    match ctx.keylock.try_acquire_named(identity, &lock_key, limit) {
        NamedAcquire::Acquired => {
            tracing::info!(workflow = %key, lock = name, "Acquired lock");
            Ok(None)
        }
        NamedAcquire::AlreadyHeld => Ok(None),
        NamedAcquire::Waiting { position } => {
            let message = format!("Waiting for lock {}", name);
            tracing::debug!(workflow = %key, lock = name, position, "Waiting for lock");
            if wf.status.phase == WorkflowPhase::Pending && wf.status.message == message {
                return Ok(Some(OperationOutcome::of(Reconciled::NoOp)));
            }
            let mut wf = wf.clone();
            transition(ctx, &mut wf, WorkflowPhase::Pending);
            wf.status.message = message;
            persist(ctx, wf).await?;
            Ok(Some(OperationOutcome::of(Reconciled::Progressed)))
        }
    }
}

/// Give up every named lock slot or queue place held by a finished workflow
fn release_synchronization(ctx: &ControllerContext, identity: &str) {
    ctx.wake(ctx.keylock.release_all(identity));
}

fn build_pod(wf: &Workflow, exec: &Workflow, template: &Template) -> Pod {
    let mut metadata = ObjectMeta::named(
        wf.metadata.namespace.clone(),
        format!("{}-{}", wf.metadata.name, template.name),
    );
    metadata.labels = template.metadata.labels.clone();
    metadata
        .labels
        .insert(labels::WORKFLOW.to_string(), wf.metadata.name.clone());
    metadata.annotations = template.metadata.annotations.clone();
    metadata
        .annotations
        .insert(labels::TEMPLATE.to_string(), template.name.clone());

    Pod {
        metadata,
        spec: PodSpec {
            container: template.container.clone(),
            service_account_name: exec.spec.service_account_name.clone(),
            host_network: exec.spec.host_network.unwrap_or(false),
            priority: exec.spec.priority,
            volumes: exec.spec.volumes.clone(),
        },
        status: Default::default(),
    }
}

/// Create the entrypoint pod and mark the workflow Running
async fn admit(
    ctx: &ControllerContext,
    mut wf: Workflow,
    exec: &Workflow,
    identity: &str,
) -> ControllerResult<OperationOutcome> {
    let entrypoint = &exec.spec.entrypoint;
    let Some(template) = exec.template(entrypoint) else {
        let message = format!("entrypoint template {:?} not found", entrypoint);
        return finish(ctx, wf, exec, identity, WorkflowPhase::Error, message).await;
    };

    let pod = build_pod(&wf, exec, template);
    let pod_name = pod.metadata.name.clone();
    match ResourceApi::<Pod>::create(&*ctx.cluster, pod).await {
        Ok(_) => tracing::info!(workflow = %identity, pod = %pod_name, "Created pod"),
        Err(e) if e.is_already_exists() => {
            tracing::debug!(workflow = %identity, pod = %pod_name, "Pod already exists")
        }
        Err(e) => return Err(e.into()),
    }

    let now = Utc::now();
    transition(ctx, &mut wf, WorkflowPhase::Running);
    wf.status.message.clear();
    wf.status.started_at.get_or_insert(now);
    wf.status.nodes.insert(
        pod_name.clone(),
        NodeStatus {
            id: pod_name.clone(),
            name: wf.metadata.name.clone(),
            template_name: template.name.clone(),
            phase: NodePhase::Pending,
            message: String::new(),
            pod_name: Some(pod_name),
            outputs: None,
            started_at: Some(now),
            finished_at: None,
        },
    );

    let wf = persist(ctx, wf).await?;
    record(ctx, &wf, EventType::Normal, "WorkflowRunning", "Workflow started");
    Ok(OperationOutcome::of(Reconciled::Progressed))
}

/// Move `node` to the phase of its pod; returns whether anything changed
fn assess_node(node: &mut NodeStatus, pod: &Pod, now: DateTime<Utc>) -> bool {
    let next = match pod.status.phase {
        PodPhase::Pending => NodePhase::Pending,
        PodPhase::Running => NodePhase::Running,
        PodPhase::Succeeded => NodePhase::Succeeded,
        PodPhase::Failed => NodePhase::Failed,
        PodPhase::Unknown => return false,
    };
    if next == node.phase {
        return false;
    }

    node.phase = next;
    match next {
        NodePhase::Succeeded => {
            node.finished_at = Some(now);
            if let Some(raw) = pod.metadata.annotation(labels::OUTPUTS) {
                match serde_json::from_str(raw) {
                    Ok(outputs) => node.outputs = Some(outputs),
                    Err(e) => {
                        node.phase = NodePhase::Failed;
                        node.message = format!("failed to parse outputs: {}", e);
                    }
                }
            }
        }
        NodePhase::Failed => {
            node.finished_at = Some(now);
            node.message = pod.status.message.clone();
        }
        _ => {}
    }
    true
}

/// Phase of a workflow whose nodes are all done; `None` while any still runs
fn derive_phase(wf: &Workflow) -> Option<(WorkflowPhase, String)> {
    let nodes = &wf.status.nodes;
    if nodes.is_empty() || nodes.values().any(|n| !n.phase.is_completed()) {
        return None;
    }
    let first = |phase: NodePhase| nodes.values().find(|n| n.phase == phase);
    if let Some(node) = first(NodePhase::Error) {
        Some((WorkflowPhase::Error, node.message.clone()))
    } else if let Some(node) = first(NodePhase::Failed) {
        Some((WorkflowPhase::Failed, node.message.clone()))
    } else {
        Some((WorkflowPhase::Succeeded, String::new()))
    }
}

async fn reconcile_nodes(
    ctx: &ControllerContext,
    mut wf: Workflow,
    exec: &Workflow,
    key: &ObjectKey,
    identity: &str,
) -> ControllerResult<OperationOutcome> {
    if wf.status.nodes.is_empty() {
        return admit(ctx, wf, exec, identity).await;
    }

    let now = Utc::now();
    let mut changed = false;
    for node in wf.status.nodes.values_mut() {
        if node.phase.is_completed() {
            continue;
        }
        let Some(pod_name) = &node.pod_name else {
            continue;
        };
        let Some(pod) = ctx.pods.get(&ObjectKey::new(key.namespace.clone(), pod_name.clone()))
        else {
            continue;
        };
        if assess_node(node, &pod, now) {
            tracing::debug!(workflow = %key, node = %node.id, phase = ?node.phase, "Node advanced");
            changed = true;
        }
    }

    if let Some((phase, message)) = derive_phase(&wf) {
        return finish(ctx, wf, exec, identity, phase, message).await;
    }
    if !changed {
        return Ok(OperationOutcome::of(Reconciled::NoOp));
    }
    persist(ctx, wf).await?;
    Ok(OperationOutcome::of(Reconciled::Progressed))
}

fn needs_archive(ctx: &ControllerContext, wf: &Workflow, exec: &Workflow) -> bool {
    ctx.archive.is_enabled()
        && wf.metadata.label(labels::ARCHIVING_STATUS).is_none()
        && ctx.gate.is_archivable(exec)
}

/// Write the archive record and stamp the workflow as archived
async fn archive(ctx: &ControllerContext, wf: &mut Workflow) -> ControllerResult<()> {
    wf.metadata
        .labels
        .insert(labels::ARCHIVING_STATUS.to_string(), labels::ARCHIVED.to_string());
    let written = match ArchiveRecord::from_workflow(wf, ctx.config.archive.ttl()) {
        Ok(record) => ctx.archive.archive_workflow(record).await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => {
            ctx.metrics.archive_writes_total.with_label_values(&["ok"]).inc();
            tracing::info!(workflow = %wf.key(), "Archived workflow");
            Ok(())
        }
        Err(e) => {
            wf.metadata.labels.remove(labels::ARCHIVING_STATUS);
            ctx.metrics.archive_writes_total.with_label_values(&["error"]).inc();
            Err(e.into())
        }
    }
}

/// Put the workflow into terminal `phase`, archive it and persist
async fn finish(
    ctx: &ControllerContext,
    mut wf: Workflow,
    exec: &Workflow,
    identity: &str,
    phase: WorkflowPhase,
    message: String,
) -> ControllerResult<OperationOutcome> {
    let now = Utc::now();
    transition(ctx, &mut wf, phase);
    wf.status.message = message;
    wf.status.finished_at = Some(now);
    wf.metadata
        .labels
        .insert(labels::COMPLETED.to_string(), "true".to_string());

    if needs_archive(ctx, &wf, exec) {
        archive(ctx, &mut wf).await?;
    }
    let wf = persist(ctx, wf).await?;
    release_synchronization(ctx, identity);

    match phase {
        WorkflowPhase::Succeeded => {
            record(ctx, &wf, EventType::Normal, "WorkflowSucceeded", "Workflow completed")
        }
        _ => record(ctx, &wf, EventType::Warning, "WorkflowFailed", &wf.status.message),
    }
    tracing::info!(workflow = %identity, phase = %phase, "Workflow completed");

    Ok(OperationOutcome {
        result: Reconciled::Terminal,
        requeue_after: ttl_deadline(&wf, exec).map(|deadline| remaining(deadline, now)),
    })
}

async fn reconcile_completed(
    ctx: &ControllerContext,
    mut wf: Workflow,
    exec: &Workflow,
    key: &ObjectKey,
    identity: &str,
) -> ControllerResult<OperationOutcome> {
    let mut result = Reconciled::NoOp;
    if needs_archive(ctx, &wf, exec) {
        archive(ctx, &mut wf).await?;
        wf = persist(ctx, wf).await?;
        result = Reconciled::Progressed;
    }
    release_synchronization(ctx, identity);

    let Some(deadline) = ttl_deadline(&wf, exec) else {
        return Ok(OperationOutcome::of(result));
    };
    let now = Utc::now();
    if deadline > now {
        return Ok(OperationOutcome {
            result,
            requeue_after: Some(remaining(deadline, now)),
        });
    }

    match ResourceApi::<Workflow>::delete(&*ctx.cluster, key).await {
        Ok(()) => {
            tracing::info!(workflow = %key, "Deleted workflow after TTL");
            record(ctx, &wf, EventType::Normal, "WorkflowTTLExpired", "Workflow deleted after TTL");
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    ctx.wake(ctx.keylock.release_all(identity));
    Ok(OperationOutcome::of(Reconciled::Progressed))
}

/// When a finished workflow should be deleted.
///
/// The per-outcome strategy field wins, then `secondsAfterCompletion`, then
/// `ttlSecondsAfterFinished`.
fn ttl_deadline(wf: &Workflow, exec: &Workflow) -> Option<DateTime<Utc>> {
    let finished_at = wf.status.finished_at?;
    let strategy = exec.spec.ttl_strategy.as_ref().and_then(|s| {
        let by_outcome = match wf.status.phase {
            WorkflowPhase::Succeeded => s.seconds_after_success,
            WorkflowPhase::Failed | WorkflowPhase::Error => s.seconds_after_failure,
            _ => None,
        };
        by_outcome.or(s.seconds_after_completion)
    });
    let seconds = strategy.or(exec.spec.ttl_seconds_after_finished)?;
    Some(finished_at + chrono::Duration::seconds(i64::from(seconds.max(0))))
}

fn remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}
