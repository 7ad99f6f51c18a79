//! Strand Types - Resource schema for the workflow controller
//!
//! These are the objects the controller reads from and writes to the cluster.
//! The wire format is the camelCase YAML/JSON users author.
//!
//! ## Key Concepts
//!
//! - **Workflow**: A user-authored multi-step job and its mutable status
//! - **WorkflowTemplate**: A reusable spec a workflow can reference by name
//! - **ClusterWorkflowTemplate**: The cluster-scoped variant of a template
//! - **Pod**: The cluster-scheduled execution unit backing one workflow node
//! - **LabelSelector**: Label predicate used by the archive policy
//! - **RecordedEvent**: A fire-and-forget event about a resource

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod meta;
pub mod pod;
pub mod selector;
pub mod template;
pub mod workflow;

pub use events::{EventType, ObjectReference, RecordedEvent};
pub use meta::{labels, ObjectKey, ObjectMeta, Resource};
pub use pod::{Pod, PodPhase, PodSpec, PodStatus};
pub use selector::{LabelSelector, Requirement, SelectorError, SelectorOperator};
pub use template::{ClusterWorkflowTemplate, WorkflowTemplate};
pub use workflow::{
    Arguments, Container, LockKind, MutexRef, NodePhase, NodeStatus, Parameter, SemaphoreRef,
    Synchronization, Template, TemplateMetadata, TtlStrategy, Workflow, WorkflowPhase,
    WorkflowSpec, WorkflowStatus, WorkflowTemplateRef,
};
