//! Archive store for finished workflows

use crate::error::{ArchiveError, ArchiveResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use strand_types::{ObjectKey, Resource, Workflow};

/// A persisted snapshot of a finished workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    /// Workflow uid, or its key when the workflow has no uid
    pub id: String,

    pub key: ObjectKey,

    /// Serialized workflow as it was when archived
    pub workflow: serde_json::Value,

    pub archived_at: DateTime<Utc>,

    /// Retention deadline; `None` keeps the record forever
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArchiveRecord {
    /// Snapshot `wf`, retained for `ttl` past its finish time
    pub fn from_workflow(wf: &Workflow, ttl: Option<Duration>) -> ArchiveResult<Self> {
        let now = Utc::now();
        let id = if wf.metadata.uid.is_empty() {
            wf.key().to_string()
        } else {
            wf.metadata.uid.clone()
        };
        let finished = wf.status.finished_at.unwrap_or(now);
        Ok(Self {
            id,
            key: wf.key(),
            workflow: serde_json::to_value(wf)?,
            archived_at: now,
            expires_at: ttl.map(|ttl| finished + ttl),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Deserialize the stored snapshot
    pub fn snapshot(&self) -> ArchiveResult<Workflow> {
        Ok(serde_json::from_value(self.workflow.clone())?)
    }
}

/// Persistent store of archive records
#[async_trait]
pub trait WorkflowArchive: Send + Sync {
    /// Whether archiving is turned on at all
    fn is_enabled(&self) -> bool;

    /// Insert or replace the record with the same id
    async fn archive_workflow(&self, record: ArchiveRecord) -> ArchiveResult<()>;

    /// Records whose deadline is at or before `before`
    async fn list_expired(&self, before: DateTime<Utc>) -> ArchiveResult<Vec<ArchiveRecord>>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, id: &str) -> ArchiveResult<bool>;

    async fn get(&self, id: &str) -> ArchiveResult<Option<ArchiveRecord>>;

    async fn len(&self) -> ArchiveResult<usize>;
}

/// Archive used when archiving is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorkflowArchive;

#[async_trait]
impl WorkflowArchive for NullWorkflowArchive {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn archive_workflow(&self, _record: ArchiveRecord) -> ArchiveResult<()> {
        Ok(())
    }

    async fn list_expired(&self, _before: DateTime<Utc>) -> ArchiveResult<Vec<ArchiveRecord>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _id: &str) -> ArchiveResult<bool> {
        Ok(false)
    }

    async fn get(&self, _id: &str) -> ArchiveResult<Option<ArchiveRecord>> {
        Ok(None)
    }

    async fn len(&self) -> ArchiveResult<usize> {
        Ok(0)
    }
}

/// In-memory archive for local mode and tests
#[derive(Debug, Default)]
pub struct InMemoryWorkflowArchive {
    records: DashMap<String, ArchiveRecord>,
    pending_faults: AtomicUsize,
}

impl InMemoryWorkflowArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`ArchiveError::Unavailable`]
    pub fn inject_faults(&self, count: usize) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> ArchiveResult<()> {
        let hit = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(ArchiveError::Unavailable("injected fault".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkflowArchive for InMemoryWorkflowArchive {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn archive_workflow(&self, record: ArchiveRecord) -> ArchiveResult<()> {
        self.check_fault()?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> ArchiveResult<Vec<ArchiveRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired(before))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete(&self, id: &str) -> ArchiveResult<bool> {
        self.check_fault()?;
        Ok(self.records.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> ArchiveResult<Option<ArchiveRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn len(&self) -> ArchiveResult<usize> {
        Ok(self.records.len())
    }
}
