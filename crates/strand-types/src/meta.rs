//! Object metadata and identity shared by every resource kind

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known label and annotation keys owned by the controller
pub mod labels {
    /// Pod label naming the owning workflow
    pub const WORKFLOW: &str = "workflows.strand.io/workflow";

    /// Workflow label opting a workflow into the default archive selector
    pub const ARCHIVE_STRATEGY: &str = "workflows.strand.io/archive-strategy";

    /// Workflow label stamped once an archive record exists
    pub const ARCHIVING_STATUS: &str = "workflows.strand.io/workflow-archiving-status";

    /// Value of [`ARCHIVING_STATUS`] after a successful archive write
    pub const ARCHIVED: &str = "Archived";

    /// Workflow label mirroring a terminal phase
    pub const COMPLETED: &str = "workflows.strand.io/completed";

    /// Pod annotation carrying the step outputs as a JSON document
    pub const OUTPUTS: &str = "workflows.strand.io/outputs";

    /// Pod annotation naming the template the pod executes
    pub const TEMPLATE: &str = "workflows.strand.io/template";
}

/// Namespace + name identity of a cluster object.
///
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Parse the `namespace/name` (or bare `name`) form.
    ///
    /// Returns `None` for empty names or more than one separator.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('/');
        let first = parts.next()?;
        let key = match (parts.next(), parts.next()) {
            (None, _) => Self::cluster(first),
            (Some(name), None) => Self::new(first, name),
            (Some(_), Some(_)) => return None,
        };
        if key.name.is_empty() {
            return None;
        }
        Some(key)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Standard object metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Prefix used by the cluster to generate `name` on create
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Opaque version used for optimistic concurrency on update
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A kind of object the cluster stores and watches.
pub trait Resource:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name as it appears in manifests
    const KIND: &'static str;

    /// Whether objects of this kind live outside any namespace
    const CLUSTER_SCOPED: bool = false;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        if Self::CLUSTER_SCOPED {
            ObjectKey::cluster(meta.name.clone())
        } else {
            ObjectKey::new(meta.namespace.clone(), meta.name.clone())
        }
    }
}
