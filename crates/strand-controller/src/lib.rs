//! Strand Controller library
//!
//! The reconciliation core of the workflow orchestrator:
//! - Per-workflow key locks and named semaphores/mutexes
//! - Watch-synchronized resource mirrors
//! - Spec resolution (template references and cluster defaults)
//! - The operation cycle and the controller loop driving it
//! - Archive gating, archive store and garbage collection
//! - Daemon lifecycle for local mode

pub mod archive;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod gate;
pub mod gc;
pub mod keylock;
pub mod manifests;
pub mod metrics;
pub mod mirror;
pub mod operation;
pub mod queue;
pub mod recorder;
pub mod resolver;

pub use archive::{ArchiveRecord, InMemoryWorkflowArchive, NullWorkflowArchive, WorkflowArchive};
pub use cluster::{AccessReview, ClusterClient, InMemoryCluster, ResourceApi, WatchEvent};
pub use crate::config::{ArchivePolicy, ControllerConfig};
pub use controller::{ControllerContext, DeletedObject, WorkflowController};
pub use daemon::Daemon;
pub use error::{ArchiveError, ClusterError, ControllerError, ControllerResult, ResolveError};
pub use gate::ArchiveGate;
pub use gc::ArchivedWorkflowGc;
pub use keylock::{KeyGuard, KeyLock, NamedAcquire};
pub use manifests::Manifests;
pub use metrics::ControllerMetrics;
pub use mirror::{Change, MirrorReader, MirrorWriter};
pub use operation::{operate, OperationOutcome, Reconciled};
pub use queue::WorkQueue;
pub use recorder::{BroadcastRecorder, EventRecorder};
pub use resolver::{load_execution_spec, set_workflow_defaults};
