//! End-to-end runs of the workflow controller against the in-memory cluster

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strand_controller::{
    BroadcastRecorder, ControllerConfig, InMemoryCluster, InMemoryWorkflowArchive, ResourceApi,
    WorkflowArchive, WorkflowController,
};
use strand_types::{labels, ObjectKey, Pod, PodPhase, Resource, Workflow, WorkflowPhase};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    cluster: Arc<InMemoryCluster>,
    archive: Arc<InMemoryWorkflowArchive>,
    cancel: CancellationToken,
    handle: JoinHandle<strand_controller::ControllerResult<()>>,
}

impl Running {
    fn start() -> Self {
        let mut config = ControllerConfig::default();
        config.archive.enabled = true;
        config.workers.workflow = 2;
        config.workers.pod = 1;

        let cluster = Arc::new(InMemoryCluster::new());
        let archive = Arc::new(InMemoryWorkflowArchive::new());
        let controller = WorkflowController::new(
            cluster.clone(),
            config,
            archive.clone(),
            Arc::new(BroadcastRecorder::default()),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(controller).run(cancel.clone()));
        Self {
            cluster,
            archive,
            cancel,
            handle,
        }
    }

    async fn submit(&self, yaml: &str) -> ObjectKey {
        let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
        ResourceApi::<Workflow>::create(&*self.cluster, wf)
            .await
            .unwrap()
            .key()
    }

    async fn workflow(&self, key: &ObjectKey) -> Workflow {
        ResourceApi::<Workflow>::get(&*self.cluster, key).await.unwrap()
    }

    async fn finish_pod(&self, name: &str, phase: PodPhase) {
        let key = ObjectKey::new("default", name);
        let cluster = Arc::clone(&self.cluster);
        let mut pod = eventually(|| {
            let cluster = Arc::clone(&cluster);
            let key = key.clone();
            async move { ResourceApi::<Pod>::get(&*cluster, &key).await.ok() }
        })
        .await;
        pod.status.phase = phase;
        ResourceApi::<Pod>::update(&*self.cluster, pod).await.unwrap();
    }

    async fn wait_for_phase(&self, key: &ObjectKey, phase: WorkflowPhase) -> Workflow {
        let cluster = Arc::clone(&self.cluster);
        eventually(|| {
            let cluster = Arc::clone(&cluster);
            let key = key.clone();
            async move {
                ResourceApi::<Workflow>::get(&*cluster, &key)
                    .await
                    .ok()
                    .filter(|wf| wf.status.phase == phase)
            }
        })
        .await
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn single_step(name: &str, extra: &str) -> String {
    format!(
        r#"
metadata:
  name: {name}
  namespace: default
spec:
  entrypoint: main
{extra}
  templates:
  - name: main
    container:
      image: docker/whalesay
"#
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_runs_to_success_and_is_archived() {
    let running = Running::start();
    let key = running.submit(&single_step("hello", "")).await;

    running.finish_pod("hello-main", PodPhase::Succeeded).await;
    let wf = running.wait_for_phase(&key, WorkflowPhase::Succeeded).await;

    assert_eq!(wf.metadata.label(labels::ARCHIVING_STATUS), Some(labels::ARCHIVED));
    assert_eq!(running.archive.len().await.unwrap(), 1);
    let record = running.archive.get(&wf.metadata.uid).await.unwrap().unwrap();
    assert_eq!(record.key, key);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_pod_fails_workflow() {
    let running = Running::start();
    let key = running.submit(&single_step("broken", "")).await;

    running.finish_pod("broken-main", PodPhase::Failed).await;
    let wf = running.wait_for_phase(&key, WorkflowPhase::Failed).await;
    assert!(wf.status.finished_at.is_some());

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_template_reference_errors() {
    let running = Running::start();
    let key = running
        .submit(
            r#"
metadata:
  name: dangling
  namespace: default
spec:
  workflowTemplateRef:
    name: nope
"#,
        )
        .await;

    let wf = running.wait_for_phase(&key, WorkflowPhase::Error).await;
    assert!(wf.status.message.contains("nope"));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutex_holders_run_one_at_a_time() {
    let running = Running::start();
    let sync = "  synchronization:\n    mutex:\n      name: deploy";
    let first = running.submit(&single_step("first", sync)).await;
    let second = running.submit(&single_step("second", sync)).await;

    // Whichever is admitted first holds the mutex; the other waits.
    let (holder, waiter) = {
        let cluster = Arc::clone(&running.cluster);
        let (first, second) = (first.clone(), second.clone());
        eventually(|| {
            let cluster = Arc::clone(&cluster);
            let (first, second) = (first.clone(), second.clone());
            async move {
                let a = ResourceApi::<Workflow>::get(&*cluster, &first).await.ok()?;
                let b = ResourceApi::<Workflow>::get(&*cluster, &second).await.ok()?;
                match (a.status.phase, b.status.phase) {
                    (WorkflowPhase::Running, WorkflowPhase::Pending) => Some((first, second)),
                    (WorkflowPhase::Pending, WorkflowPhase::Running) => Some((second, first)),
                    _ => None,
                }
            }
        })
        .await
    };
    assert_eq!(
        running.workflow(&waiter).await.status.message,
        "Waiting for lock deploy"
    );

    running
        .finish_pod(&format!("{}-main", holder.name), PodPhase::Succeeded)
        .await;
    running.wait_for_phase(&holder, WorkflowPhase::Succeeded).await;
    running.wait_for_phase(&waiter, WorkflowPhase::Running).await;

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleting_workflow_releases_its_mutex() {
    let running = Running::start();
    let sync = "  synchronization:\n    mutex:\n      name: db";
    let first = running.submit(&single_step("first", sync)).await;
    running.wait_for_phase(&first, WorkflowPhase::Running).await;
    let second = running.submit(&single_step("second", sync)).await;
    running.wait_for_phase(&second, WorkflowPhase::Pending).await;

    ResourceApi::<Workflow>::delete(&*running.cluster, &first)
        .await
        .unwrap();
    running.wait_for_phase(&second, WorkflowPhase::Running).await;

    running.stop().await;
}
