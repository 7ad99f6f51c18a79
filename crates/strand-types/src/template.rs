//! Reusable workflow templates
//!
//! Both kinds carry a full [`WorkflowSpec`]. A workflow that references one
//! executes the template's spec with its own fields layered on top.

use crate::meta::{ObjectMeta, Resource};
use crate::workflow::WorkflowSpec;
use serde::{Deserialize, Serialize};

/// Namespaced template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: WorkflowSpec,
}

impl Resource for WorkflowTemplate {
    const KIND: &'static str = "WorkflowTemplate";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Cluster-scoped template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterWorkflowTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: WorkflowSpec,
}

impl Resource for ClusterWorkflowTemplate {
    const KIND: &'static str = "ClusterWorkflowTemplate";
    const CLUSTER_SCOPED: bool = true;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
