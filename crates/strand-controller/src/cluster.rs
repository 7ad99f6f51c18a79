//! Cluster API abstraction
//!
//! The controller talks to the cluster through [`ClusterClient`], which is the
//! composition of one [`ResourceApi`] per resource kind plus [`AccessReview`].
//! [`InMemoryCluster`] implements the whole surface for local mode and tests.

use crate::error::{ClusterError, ClusterResult};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_types::{
    ClusterWorkflowTemplate, ObjectKey, Pod, Resource, Workflow, WorkflowTemplate,
};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A change observed on a watch
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// Full state of the watched set, sent first and after every resync
    Restarted(Vec<T>),
    /// Object created or updated
    Applied(T),
    /// Object removed; carries its last known state
    Deleted(T),
}

pub type WatchStream<T> = BoxStream<'static, WatchEvent<T>>;

/// CRUD and watch for one resource kind
#[async_trait]
pub trait ResourceApi<T: Resource>: Send + Sync {
    /// List objects, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> ClusterResult<Vec<T>>;

    async fn get(&self, key: &ObjectKey) -> ClusterResult<T>;

    /// Create an object; the cluster assigns uid, resourceVersion and, when
    /// `generateName` is set without a name, the name itself
    async fn create(&self, obj: T) -> ClusterResult<T>;

    /// Replace an object; a non-empty stale resourceVersion is a conflict
    async fn update(&self, obj: T) -> ClusterResult<T>;

    async fn delete(&self, key: &ObjectKey) -> ClusterResult<()>;

    /// Subscribe to changes, starting with a `Restarted` snapshot
    fn watch(&self, namespace: Option<&str>) -> WatchStream<T>;
}

/// Dry-run permission checks
#[async_trait]
pub trait AccessReview: Send + Sync {
    /// Whether the controller may perform `verb` on `kind`; `None` asks cluster-wide
    async fn can_i(&self, verb: &str, kind: &str, namespace: Option<&str>) -> ClusterResult<bool>;
}

/// Everything the controller needs from the cluster
pub trait ClusterClient:
    ResourceApi<Workflow>
    + ResourceApi<WorkflowTemplate>
    + ResourceApi<ClusterWorkflowTemplate>
    + ResourceApi<Pod>
    + AccessReview
    + Send
    + Sync
{
}

impl<C> ClusterClient for C where
    C: ResourceApi<Workflow>
        + ResourceApi<WorkflowTemplate>
        + ResourceApi<ClusterWorkflowTemplate>
        + ResourceApi<Pod>
        + AccessReview
        + Send
        + Sync
{
}

/// Objects of one kind plus the fan-out of their changes
#[derive(Debug)]
pub struct ObjectStore<T> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> ObjectStore<T> {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn in_scope(obj: &T, namespace: Option<&str>) -> bool {
        T::CLUSTER_SCOPED || namespace.map_or(true, |ns| obj.meta().namespace == ns)
    }

    fn snapshot(&self, namespace: Option<&str>) -> Vec<T> {
        self.objects
            .read()
            .values()
            .filter(|obj| Self::in_scope(obj, namespace))
            .cloned()
            .collect()
    }

    fn get(&self, key: &ObjectKey) -> ClusterResult<T> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: T::KIND,
                key: key.clone(),
            })
    }

    fn create(&self, mut obj: T, version: u64) -> ClusterResult<T> {
        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            if meta.generate_name.is_empty() {
                return Err(ClusterError::Invalid(format!(
                    "{} requires a name or generateName",
                    T::KIND
                )));
            }
            let suffix = Uuid::new_v4().simple().to_string();
            meta.name = format!("{}{}", meta.generate_name, &suffix[..5]);
        }
        if T::CLUSTER_SCOPED {
            meta.namespace.clear();
        }
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = version.to_string();
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        let key = obj.key();
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: T::KIND, key });
        }
        objects.insert(key, obj.clone());
        let _ = self.events.send(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    fn update(&self, mut obj: T, version: u64) -> ClusterResult<T> {
        let key = obj.key();
        let mut objects = self.objects.write();
        let current = objects.get(&key).ok_or_else(|| ClusterError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })?;
        let stale = {
            let requested = &obj.meta().resource_version;
            !requested.is_empty() && *requested != current.meta().resource_version
        };
        if stale {
            return Err(ClusterError::Conflict { kind: T::KIND, key });
        }

        let (uid, created) = {
            let meta = current.meta();
            (meta.uid.clone(), meta.creation_timestamp)
        };
        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.resource_version = version.to_string();

        objects.insert(key, obj.clone());
        let _ = self.events.send(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    fn delete(&self, key: &ObjectKey) -> ClusterResult<()> {
        let mut objects = self.objects.write();
        let mut removed = objects.remove(key).ok_or_else(|| ClusterError::NotFound {
            kind: T::KIND,
            key: key.clone(),
        })?;
        removed.meta_mut().deletion_timestamp = Some(Utc::now());
        let _ = self.events.send(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(self: &Arc<Self>, namespace: Option<&str>) -> WatchStream<T> {
        // Subscribe before the snapshot so no change falls between the two.
        let rx = self.events.subscribe();
        let namespace = namespace.map(str::to_string);
        let initial = self.snapshot(namespace.as_deref());
        let state = (Arc::clone(self), rx, namespace, Some(initial));

        stream::unfold(state, |(store, mut rx, namespace, pending)| async move {
            if let Some(list) = pending {
                return Some((WatchEvent::Restarted(list), (store, rx, namespace, None)));
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let obj = match &event {
                            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
                            WatchEvent::Restarted(_) => continue,
                        };
                        if Self::in_scope(obj, namespace.as_deref()) {
                            return Some((event, (store, rx, namespace, None)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(kind = T::KIND, skipped, "Watch lagged, relisting");
                        let list = store.snapshot(namespace.as_deref());
                        return Some((WatchEvent::Restarted(list), (store, rx, namespace, None)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// A complete cluster held in memory
#[derive(Debug)]
pub struct InMemoryCluster {
    workflows: Arc<ObjectStore<Workflow>>,
    templates: Arc<ObjectStore<WorkflowTemplate>>,
    cluster_templates: Arc<ObjectStore<ClusterWorkflowTemplate>>,
    pods: Arc<ObjectStore<Pod>>,
    version: AtomicU64,
    cluster_scope_allowed: AtomicBool,
    pending_faults: AtomicUsize,
    review_failures: Mutex<VecDeque<ClusterError>>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    const WATCH_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self {
            workflows: Arc::new(ObjectStore::new(Self::WATCH_CAPACITY)),
            templates: Arc::new(ObjectStore::new(Self::WATCH_CAPACITY)),
            cluster_templates: Arc::new(ObjectStore::new(Self::WATCH_CAPACITY)),
            pods: Arc::new(ObjectStore::new(Self::WATCH_CAPACITY)),
            version: AtomicU64::new(0),
            cluster_scope_allowed: AtomicBool::new(true),
            pending_faults: AtomicUsize::new(0),
            review_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Set the answer to cluster-wide access reviews
    pub fn with_cluster_scope(self, allowed: bool) -> Self {
        self.set_cluster_scope_allowed(allowed);
        self
    }

    pub fn set_cluster_scope_allowed(&self, allowed: bool) {
        self.cluster_scope_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Answer the next access reviews with `errors`, in order
    pub fn fail_access_reviews(&self, errors: impl IntoIterator<Item = ClusterError>) {
        self.review_failures.lock().extend(errors);
    }

    /// Make the next `count` writes fail with [`ClusterError::Unavailable`]
    pub fn inject_faults(&self, count: usize) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> ClusterResult<()> {
        let hit = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(ClusterError::Unavailable("injected fault".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

macro_rules! in_memory_resource_api {
    ($ty:ty, $field:ident) => {
        #[async_trait]
        impl ResourceApi<$ty> for InMemoryCluster {
            async fn list(&self, namespace: Option<&str>) -> ClusterResult<Vec<$ty>> {
                Ok(self.$field.snapshot(namespace))
            }

            async fn get(&self, key: &ObjectKey) -> ClusterResult<$ty> {
                self.$field.get(key)
            }

            async fn create(&self, obj: $ty) -> ClusterResult<$ty> {
                self.check_fault()?;
                self.$field.create(obj, self.next_version())
            }

            async fn update(&self, obj: $ty) -> ClusterResult<$ty> {
                self.check_fault()?;
                self.$field.update(obj, self.next_version())
            }

            async fn delete(&self, key: &ObjectKey) -> ClusterResult<()> {
                self.check_fault()?;
                self.$field.delete(key)
            }

            fn watch(&self, namespace: Option<&str>) -> WatchStream<$ty> {
                self.$field.watch(namespace)
            }
        }
    };
}

in_memory_resource_api!(Workflow, workflows);
in_memory_resource_api!(WorkflowTemplate, templates);
in_memory_resource_api!(ClusterWorkflowTemplate, cluster_templates);
in_memory_resource_api!(Pod, pods);

#[async_trait]
impl AccessReview for InMemoryCluster {
    async fn can_i(&self, verb: &str, kind: &str, namespace: Option<&str>) -> ClusterResult<bool> {
        if let Some(err) = self.review_failures.lock().pop_front() {
            return Err(err);
        }
        let allowed = namespace.is_some() || self.cluster_scope_allowed.load(Ordering::SeqCst);
        tracing::debug!(verb, kind, ?namespace, allowed, "Access review");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::ObjectMeta;

    fn workflow(namespace: &str, name: &str) -> Workflow {
        Workflow {
            metadata: ObjectMeta::named(namespace, name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let cluster = InMemoryCluster::new();
        let created = ResourceApi::<Workflow>::create(&cluster, workflow("default", "a"))
            .await
            .unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(!created.metadata.resource_version.is_empty());
        assert!(created.metadata.creation_timestamp.is_some());

        let err = ResourceApi::<Workflow>::create(&cluster, workflow("default", "a"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_generate_name() {
        let cluster = InMemoryCluster::new();
        let mut wf = workflow("default", "");
        wf.metadata.generate_name = "hello-".into();
        let created = ResourceApi::<Workflow>::create(&cluster, wf).await.unwrap();
        assert!(created.metadata.name.starts_with("hello-"));
        assert_eq!(created.metadata.name.len(), "hello-".len() + 5);

        let err = ResourceApi::<Workflow>::create(&cluster, workflow("default", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let cluster = InMemoryCluster::new();
        let first = ResourceApi::<Workflow>::create(&cluster, workflow("default", "a"))
            .await
            .unwrap();
        let mut newer = first.clone();
        newer.spec.entrypoint = "main".into();
        let newer = ResourceApi::<Workflow>::update(&cluster, newer).await.unwrap();
        assert_ne!(newer.metadata.resource_version, first.metadata.resource_version);
        assert_eq!(newer.metadata.uid, first.metadata.uid);

        let err = ResourceApi::<Workflow>::update(&cluster, first).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_cluster_scoped_create_drops_namespace() {
        let cluster = InMemoryCluster::new();
        let tmpl = ClusterWorkflowTemplate {
            metadata: ObjectMeta::named("ignored", "shared"),
            ..Default::default()
        };
        ResourceApi::<ClusterWorkflowTemplate>::create(&cluster, tmpl)
            .await
            .unwrap();
        let got = ResourceApi::<ClusterWorkflowTemplate>::get(&cluster, &ObjectKey::cluster("shared"))
            .await
            .unwrap();
        assert!(got.metadata.namespace.is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults_are_transient_and_bounded() {
        let cluster = InMemoryCluster::new();
        cluster.inject_faults(1);
        let err = ResourceApi::<Workflow>::create(&cluster, workflow("default", "a"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        ResourceApi::<Workflow>::create(&cluster, workflow("default", "a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_starts_with_snapshot_and_filters_namespace() {
        let cluster = InMemoryCluster::new();
        ResourceApi::<Workflow>::create(&cluster, workflow("a", "one"))
            .await
            .unwrap();
        ResourceApi::<Workflow>::create(&cluster, workflow("b", "two"))
            .await
            .unwrap();

        let mut watch = ResourceApi::<Workflow>::watch(&cluster, Some("a"));
        match watch.next().await {
            Some(WatchEvent::Restarted(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].metadata.name, "one");
            }
            other => panic!("unexpected first event: {:?}", other),
        }

        ResourceApi::<Workflow>::create(&cluster, workflow("b", "three"))
            .await
            .unwrap();
        ResourceApi::<Workflow>::delete(&cluster, &ObjectKey::new("a", "one"))
            .await
            .unwrap();
        match watch.next().await {
            Some(WatchEvent::Deleted(wf)) => {
                assert_eq!(wf.metadata.name, "one");
                assert!(wf.metadata.deletion_timestamp.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_access_review() {
        let cluster = InMemoryCluster::new().with_cluster_scope(false);
        assert!(!cluster
            .can_i("list", ClusterWorkflowTemplate::KIND, None)
            .await
            .unwrap());
        assert!(cluster
            .can_i("list", WorkflowTemplate::KIND, Some("default"))
            .await
            .unwrap());
        cluster.set_cluster_scope_allowed(true);
        assert!(cluster
            .can_i("list", ClusterWorkflowTemplate::KIND, None)
            .await
            .unwrap());
    }
}
