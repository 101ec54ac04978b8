use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Resource id used for resources that exist once per project (roadmap, ideation, settings).
pub const SINGLETON_RESOURCE_ID: &str = "main";

/// Categories of synchronized project artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    ProjectSettings,
    Tasks,
    TaskLogs,
    Roadmap,
    Ideation,
    Insights,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::ProjectSettings,
        ResourceKind::Tasks,
        ResourceKind::TaskLogs,
        ResourceKind::Roadmap,
        ResourceKind::Ideation,
        ResourceKind::Insights,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ProjectSettings => "projectSettings",
            ResourceKind::Tasks => "tasks",
            ResourceKind::TaskLogs => "taskLogs",
            ResourceKind::Roadmap => "roadmap",
            ResourceKind::Ideation => "ideation",
            ResourceKind::Insights => "insights",
        }
    }

    /// Whether the remote store exposes this kind as a subscribable collection.
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self,
            ResourceKind::Tasks | ResourceKind::Insights | ResourceKind::Roadmap | ResourceKind::Ideation
        )
    }

    /// Whether the resource is a per-project singleton keyed by [`SINGLETON_RESOURCE_ID`].
    pub fn is_singleton(&self) -> bool {
        matches!(
            self,
            ResourceKind::ProjectSettings | ResourceKind::Roadmap | ResourceKind::Ideation
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one revisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionKey {
    pub project_id: String,
    pub resource: ResourceKind,
    pub resource_id: String,
}

impl RevisionKey {
    pub fn new(project_id: &str, resource: ResourceKind, resource_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            resource,
            resource_id: resource_id.to_string(),
        }
    }

    pub fn singleton(project_id: &str, resource: ResourceKind) -> Self {
        Self::new(project_id, resource, SINGLETON_RESOURCE_ID)
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project_id, self.resource, self.resource_id)
    }
}

/// Last-known revision marker of a resource.
///
/// `revision` is compared numerically; timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub revision: i64,
    pub server_updated_at: i64,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl RevisionRecord {
    pub fn new(revision: i64, server_updated_at: i64, updated_by: impl Into<String>) -> Self {
        Self {
            revision,
            server_updated_at,
            updated_by: updated_by.into(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A debounced, classified change of a local artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub project_id: String,
    pub project_path: PathBuf,
    pub absolute_path: PathBuf,
    /// Path relative to `project_path`, always `/`-separated.
    pub relative_path: String,
    pub resource: ResourceKind,
}

/// One resource that failed during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub resource: String,
    pub message: String,
}

/// Aggregated outcome of a batch reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Remote records rejected by the last-writer-wins check.
    pub skipped: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_skip(&mut self) {
        self.attempted += 1;
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, resource: impl Into<String>, message: impl ToString) {
        self.attempted += 1;
        self.failures.push(SyncFailure {
            resource: resource.into(),
            message: message.to_string(),
        });
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human readable summary for the host application.
    pub fn summary(&self) -> String {
        format!(
            "{} of {} resources failed to sync",
            self.failures.len(),
            self.attempted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_serde_names() {
        let json = serde_json::to_string(&ResourceKind::TaskLogs).unwrap();
        assert_eq!(json, "\"taskLogs\"");
        let kind: ResourceKind = serde_json::from_str("\"projectSettings\"").unwrap();
        assert_eq!(kind, ResourceKind::ProjectSettings);
        for kind in ResourceKind::ALL {
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
    }

    #[test]
    fn test_subscribed_kinds() {
        let subscribed: Vec<_> = ResourceKind::ALL
            .iter()
            .filter(|k| k.is_subscribed())
            .collect();
        assert_eq!(subscribed.len(), 4);
        assert!(!ResourceKind::TaskLogs.is_subscribed());
        assert!(!ResourceKind::ProjectSettings.is_subscribed());
    }

    #[test]
    fn test_revision_key_display() {
        let key = RevisionKey::singleton("proj", ResourceKind::Roadmap);
        assert_eq!(key.to_string(), "proj:roadmap:main");
    }

    #[test]
    fn test_report_summary() {
        let mut report = SyncReport::default();
        report.record_success();
        report.record_failure("tasks/001", "boom");
        report.record_skip();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.summary(), "1 of 3 resources failed to sync");
        assert!(!report.is_success());

        let mut total = SyncReport::default();
        total.merge(report);
        total.record_success();
        assert_eq!(total.attempted, 4);
        assert_eq!(total.succeeded, 2);
        assert_eq!(total.skipped, 1);
    }
}
