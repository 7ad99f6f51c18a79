//! Error types for strand-controller

use strand_types::{ObjectKey, SelectorError};
use thiserror::Error;

/// Result type for cluster API calls
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Result type for archive store calls
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors returned by the cluster API
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// Stale resourceVersion on update
    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: ObjectKey },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid object: {0}")]
    Invalid(String),
}

impl ClusterError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_) | ClusterError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Errors producing an executable spec
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{kind} {key} not found")]
    TemplateNotFound { kind: &'static str, key: ObjectKey },

    /// A cluster-scoped reference while cluster templates are not mirrored
    #[error("cluster workflow template {0} cannot be resolved: cluster scope is not available")]
    ClusterScopeUnavailable(String),

    #[error("spec cannot be represented: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ResolveError::TemplateNotFound { .. } | ResolveError::ClusterScopeUnavailable(_)
        )
    }
}

/// Archive store errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive unavailable: {0}")]
    Unavailable(String),

    #[error("Archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Unavailable(_))
    }
}

/// Controller-level errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Invalid label selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether the failed operation should be retried with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => e.is_transient(),
            ControllerError::Archive(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<::config::ConfigError> for ControllerError {
    fn from(err: ::config::ConfigError) -> Self {
        ControllerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let key = ObjectKey::new("default", "wf");
        assert!(ControllerError::from(ClusterError::Unavailable("timeout".into())).is_transient());
        assert!(ControllerError::from(ClusterError::Conflict {
            kind: "Workflow",
            key: key.clone()
        })
        .is_transient());
        assert!(!ControllerError::from(ClusterError::NotFound {
            kind: "Workflow",
            key
        })
        .is_transient());
        assert!(ControllerError::from(ArchiveError::Unavailable("down".into())).is_transient());
        assert!(!ControllerError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_resolve_not_found_class() {
        let err = ResolveError::TemplateNotFound {
            kind: "WorkflowTemplate",
            key: ObjectKey::new("default", "missing"),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "WorkflowTemplate default/missing not found");
        assert!(ResolveError::ClusterScopeUnavailable("shared".into()).is_not_found());
    }
}
