//! Event types for controller observability
//!
//! Events record notable transitions of the objects the controller manages
//! and are fanned out to any subscriber of the event recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Informational event
    Normal,
    /// Something went wrong and was surfaced to the user
    Warning,
}

/// Identity of the object an event is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl ObjectReference {
    /// Reference to any resource
    pub fn to<R: crate::Resource>(resource: &R) -> Self {
        let meta = resource.meta();
        Self {
            kind: R::KIND.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

/// A recorded event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// The object the event is about
    pub involved: ObjectReference,

    pub event_type: EventType,

    /// Short machine-readable reason, e.g. `WorkflowFailed`
    pub reason: String,

    /// Human-readable message
    pub message: String,
}

impl RecordedEvent {
    pub fn new(
        involved: ObjectReference,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            involved,
            event_type,
            reason: reason.into(),
            message: message.into(),
        }
    }
}
