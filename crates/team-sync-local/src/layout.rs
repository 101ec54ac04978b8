//! On-disk artifact layout.
//!
//! Maps project files onto remote mutations and remote records onto file
//! writes. Each synchronized resource is keyed the same way in both
//! directions so a pushed resource coming back from the remote store lands on
//! the same revision key.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use team_sync_core::{ResourceKind, RevisionRecord, SyncError, SINGLETON_RESOURCE_ID};
use tracing::debug;

pub const AUTO_CLAUDE_DIR: &str = ".auto-claude";

const SPECS_DIR: &str = "specs";
const ROADMAP_FILE: &str = "roadmap/roadmap.json";
const IDEATION_FILE: &str = "ideation/ideation.json";
const SESSIONS_DIR: &str = "insights/sessions";

const TASK_METADATA: &str = "task_metadata.json";
const TASK_SPEC: &str = "spec.md";
const TASK_PLAN: &str = "implementation_plan.json";
const TASK_QA: &str = "qa_report.md";
const TASK_LOGS: &str = "task_logs.json";

/// Task files in push order: metadata first so the task exists with its title.
const TASK_FILES: [&str; 5] = [TASK_METADATA, TASK_SPEC, TASK_PLAN, TASK_QA, TASK_LOGS];

const REMOTE_ACTOR_FALLBACK: &str = "remote";

pub fn artifacts_dir(project_path: &Path) -> PathBuf {
    project_path.join(AUTO_CLAUDE_DIR)
}

/// Query/subscription name of a resource kind, for kinds the remote store exposes.
pub fn query_name(resource: ResourceKind) -> Option<&'static str> {
    match resource {
        ResourceKind::Tasks => Some("tasks:getProjectTasks"),
        ResourceKind::Insights => Some("insights:getSessions"),
        ResourceKind::Roadmap => Some("roadmap:getRoadmap"),
        ResourceKind::Ideation => Some("ideation:getIdeation"),
        ResourceKind::ProjectSettings | ResourceKind::TaskLogs => None,
    }
}

fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit('/').next().unwrap_or(relative_path)
}

/// Spec directory name following `specs/`, when it starts with three digits.
fn spec_id(relative_path: &str) -> Option<String> {
    let mut parts = relative_path.split('/');
    parts.find(|part| *part == SPECS_DIR)?;
    let candidate = parts.next()?;
    // The spec directory must not be the file itself
    parts.next()?;

    let bytes = candidate.as_bytes();
    if bytes.len() >= 3 && bytes[..3].iter().all(u8::is_ascii_digit) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Revision key id of a local artifact.
pub fn resource_id(resource: ResourceKind, relative_path: &str) -> Option<String> {
    match resource {
        ResourceKind::Tasks | ResourceKind::TaskLogs => spec_id(relative_path),
        ResourceKind::Insights => file_name(relative_path)
            .strip_suffix(".json")
            .filter(|stem| !stem.is_empty())
            .map(str::to_string),
        ResourceKind::Roadmap | ResourceKind::Ideation | ResourceKind::ProjectSettings => {
            Some(SINGLETON_RESOURCE_ID.to_string())
        }
    }
}

/// A local artifact turned into a remote mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPush {
    pub mutation: &'static str,
    pub args: Map<String, Value>,
}

impl LocalPush {
    /// Final mutation arguments, stamped with the new revision and actor.
    pub fn into_args(mut self, remote_project_id: &str, revision: i64, actor: &str) -> Value {
        self.args
            .insert("projectId".to_string(), Value::String(remote_project_id.to_string()));
        self.args.insert("updatedAt".to_string(), json!(revision));
        self.args
            .insert("updatedBy".to_string(), Value::String(actor.to_string()));
        Value::Object(self.args)
    }
}

fn parse_json(relative_path: &str, content: &str) -> Result<Value, SyncError> {
    serde_json::from_str(content).map_err(|e| SyncError::parse(relative_path, e))
}

/// `data[field]` when present, otherwise the whole document.
fn field_or_self(data: &Value, field: &str) -> Value {
    match data.get(field) {
        Some(value) if !value.is_null() => value.clone(),
        _ => data.clone(),
    }
}

fn string_or(data: &Value, field: &str, fallback: String) -> Value {
    match data.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Value::String(s.to_string()),
        _ => Value::String(fallback),
    }
}

/// Build the mutation for one local artifact from its content.
pub fn build_push(
    resource: ResourceKind,
    relative_path: &str,
    resource_id: &str,
    content: &str,
) -> Result<Option<LocalPush>, SyncError> {
    let mut args = Map::new();
    let mutation = match resource {
        ResourceKind::Tasks => {
            args.insert("specId".to_string(), Value::String(resource_id.to_string()));
            match file_name(relative_path) {
                TASK_METADATA => {
                    let metadata = parse_json(relative_path, content)?;
                    args.insert(
                        "title".to_string(),
                        string_or(&metadata, "title", format!("Task {}", resource_id)),
                    );
                    args.insert(
                        "status".to_string(),
                        string_or(&metadata, "status", "draft".to_string()),
                    );
                    args.insert("metadata".to_string(), metadata);
                }
                TASK_SPEC => {
                    args.insert("specContent".to_string(), Value::String(content.to_string()));
                }
                TASK_PLAN => {
                    args.insert(
                        "implementationPlan".to_string(),
                        parse_json(relative_path, content)?,
                    );
                }
                TASK_QA => {
                    args.insert("qaReport".to_string(), Value::String(content.to_string()));
                }
                _ => return Ok(None),
            }
            "tasks:upsertTask"
        }
        ResourceKind::TaskLogs => {
            let data = parse_json(relative_path, content)?;
            args.insert("specId".to_string(), Value::String(resource_id.to_string()));
            args.insert("phases".to_string(), field_or_self(&data, "phases"));
            "tasks:upsertTaskLogs"
        }
        ResourceKind::Roadmap => {
            let data = parse_json(relative_path, content)?;
            args.insert("features".to_string(), field_or_self(&data, "features"));
            "roadmap:upsertRoadmap"
        }
        ResourceKind::Ideation => {
            let data = parse_json(relative_path, content)?;
            args.insert("ideas".to_string(), field_or_self(&data, "ideas"));
            if let Some(config) = data.get("config") {
                args.insert("config".to_string(), config.clone());
            }
            "ideation:upsertIdeation"
        }
        ResourceKind::Insights => {
            let data = parse_json(relative_path, content)?;
            args.insert("sessionId".to_string(), Value::String(resource_id.to_string()));
            for field in ["title", "pendingAction", "modelConfig"] {
                if let Some(value) = data.get(field) {
                    args.insert(field.to_string(), value.clone());
                }
            }
            let messages = data.get("messages").cloned().unwrap_or_else(|| json!([]));
            args.insert("messages".to_string(), messages);
            "insights:upsertSession"
        }
        ResourceKind::ProjectSettings => return Ok(None),
    };
    Ok(Some(LocalPush { mutation, args }))
}

/// Read a local artifact and build its mutation.
///
/// A file that no longer exists yields `None`: local deletions are not propagated.
pub async fn read_local(
    absolute_path: &Path,
    relative_path: &str,
    resource: ResourceKind,
    resource_id: &str,
) -> Result<Option<LocalPush>, SyncError> {
    let content = match tokio::fs::read_to_string(absolute_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} disappeared before it could be pushed", relative_path);
            return Ok(None);
        }
        Err(e) => return Err(SyncError::fs(absolute_path, e)),
    };
    build_push(resource, relative_path, resource_id, &content)
}

/// A local artifact found by a full scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub resource: ResourceKind,
}

impl LocalArtifact {
    fn new(project_path: &Path, relative_path: String, resource: ResourceKind) -> Self {
        Self {
            absolute_path: project_path.join(&relative_path),
            relative_path,
            resource,
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn sorted_entries(dir: &Path) -> Result<Vec<(String, bool)>, SyncError> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(SyncError::fs(dir, e)),
    };
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| SyncError::fs(dir, e))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push((entry.file_name().to_string_lossy().to_string(), is_dir));
    }
    entries.sort();
    Ok(entries)
}

/// Every synchronizable artifact currently on disk, in push order.
pub async fn scan_local(project_path: &Path) -> Result<Vec<LocalArtifact>, SyncError> {
    let mut artifacts = Vec::new();
    let base = format!("{}/", AUTO_CLAUDE_DIR);

    let specs_dir = artifacts_dir(project_path).join(SPECS_DIR);
    for (spec, is_dir) in sorted_entries(&specs_dir).await? {
        if !is_dir {
            continue;
        }
        for file in TASK_FILES {
            let relative_path = format!("{}{}/{}/{}", base, SPECS_DIR, spec, file);
            if resource_id(ResourceKind::Tasks, &relative_path).is_none() {
                break;
            }
            let resource = if file == TASK_LOGS {
                ResourceKind::TaskLogs
            } else {
                ResourceKind::Tasks
            };
            let artifact = LocalArtifact::new(project_path, relative_path, resource);
            if is_file(&artifact.absolute_path).await {
                artifacts.push(artifact);
            }
        }
    }

    for (file, resource) in [(ROADMAP_FILE, ResourceKind::Roadmap), (IDEATION_FILE, ResourceKind::Ideation)] {
        let artifact = LocalArtifact::new(project_path, format!("{}{}", base, file), resource);
        if is_file(&artifact.absolute_path).await {
            artifacts.push(artifact);
        }
    }

    let sessions_dir = artifacts_dir(project_path).join(SESSIONS_DIR);
    for (name, is_dir) in sorted_entries(&sessions_dir).await? {
        if is_dir || !name.ends_with(".json") {
            continue;
        }
        let relative_path = format!("{}{}/{}", base, SESSIONS_DIR, name);
        artifacts.push(LocalArtifact::new(project_path, relative_path, ResourceKind::Insights));
    }

    Ok(artifacts)
}

/// A filesystem change needed to mirror a remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Write { path: PathBuf, contents: String },
    Remove { path: PathBuf },
}

impl FileOp {
    pub fn path(&self) -> &Path {
        match self {
            FileOp::Write { path, .. } | FileOp::Remove { path } => path,
        }
    }
}

/// A remote record ready to be applied locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteArtifact {
    pub resource_id: String,
    pub record: RevisionRecord,
    pub ops: Vec<FileOp>,
}

/// Normalize a query result to a list of records.
///
/// Singleton queries return `null` or one object.
pub fn remote_collection(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn validate_segment(resource: ResourceKind, id: &str) -> Result<(), SyncError> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(SyncError::InvalidResource(format!("{} id {:?}", resource, id)));
    }
    Ok(())
}

fn as_millis(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn pretty(value: &Value) -> Result<String, SyncError> {
    serde_json::to_string_pretty(value).map_err(|e| SyncError::parse("remote record", e))
}

/// `{field: record[field]}` for every field present on the record.
fn pick(record: &Value, fields: &[&str]) -> Value {
    let mut picked = Map::new();
    for field in fields {
        if let Some(value) = record.get(*field) {
            picked.insert(field.to_string(), value.clone());
        }
    }
    Value::Object(picked)
}

fn present(record: &Value, field: &str) -> Option<Value> {
    match record.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(value) => Some(value.clone()),
    }
}

fn incoming_record(resource: ResourceKind, record: &Value) -> Result<RevisionRecord, SyncError> {
    let updated_at = as_millis(record.get("updatedAt"))
        .ok_or_else(|| SyncError::parse(resource.as_str(), "remote record has no updatedAt"))?;
    let updated_by = record
        .get("updatedBy")
        .and_then(Value::as_str)
        .unwrap_or(REMOTE_ACTOR_FALLBACK)
        .to_string();

    let mut incoming = RevisionRecord::new(updated_at, updated_at, updated_by.clone());
    let tombstone = record.get("isDeleted").and_then(Value::as_bool).unwrap_or(false);
    let deleted_at = as_millis(record.get("deletedAt"));
    if tombstone || deleted_at.is_some() {
        incoming.deleted_at = Some(deleted_at.unwrap_or(updated_at));
        incoming.deleted_by = Some(
            record
                .get("deletedBy")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(updated_by),
        );
    }
    Ok(incoming)
}

/// Plan the local writes that mirror one remote record.
pub fn materialize(
    project_path: &Path,
    resource: ResourceKind,
    record: &Value,
) -> Result<RemoteArtifact, SyncError> {
    let base = artifacts_dir(project_path);
    let resource_id = match resource {
        ResourceKind::Tasks => record
            .get("specId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ResourceKind::Insights => record
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ResourceKind::Roadmap | ResourceKind::Ideation => SINGLETON_RESOURCE_ID.to_string(),
        ResourceKind::TaskLogs | ResourceKind::ProjectSettings => {
            return Err(SyncError::InvalidResource(format!(
                "{} is not materialized locally",
                resource
            )))
        }
    };
    validate_segment(resource, &resource_id)?;

    let incoming = incoming_record(resource, record)?;
    let mut ops = Vec::new();

    match resource {
        ResourceKind::Tasks => {
            let spec_dir = base.join(SPECS_DIR).join(&resource_id);
            if incoming.is_deleted() {
                for file in [TASK_METADATA, TASK_SPEC, TASK_PLAN, TASK_QA] {
                    ops.push(FileOp::Remove {
                        path: spec_dir.join(file),
                    });
                }
            } else {
                if let Some(metadata) = present(record, "metadata") {
                    ops.push(FileOp::Write {
                        path: spec_dir.join(TASK_METADATA),
                        contents: pretty(&metadata)?,
                    });
                }
                if let Some(Value::String(spec)) = present(record, "specContent") {
                    ops.push(FileOp::Write {
                        path: spec_dir.join(TASK_SPEC),
                        contents: spec,
                    });
                }
                if let Some(plan) = present(record, "implementationPlan") {
                    ops.push(FileOp::Write {
                        path: spec_dir.join(TASK_PLAN),
                        contents: pretty(&plan)?,
                    });
                }
                if let Some(Value::String(report)) = present(record, "qaReport") {
                    ops.push(FileOp::Write {
                        path: spec_dir.join(TASK_QA),
                        contents: report,
                    });
                }
            }
        }
        ResourceKind::Insights => {
            let path = base.join(SESSIONS_DIR).join(format!("{}.json", resource_id));
            if incoming.is_deleted() {
                ops.push(FileOp::Remove { path });
            } else {
                let session = pick(record, &["title", "messages", "pendingAction", "modelConfig"]);
                ops.push(FileOp::Write {
                    path,
                    contents: pretty(&session)?,
                });
            }
        }
        ResourceKind::Roadmap | ResourceKind::Ideation => {
            let (file, fields): (&str, &[&str]) = if resource == ResourceKind::Roadmap {
                (ROADMAP_FILE, &["features"])
            } else {
                (IDEATION_FILE, &["ideas", "config"])
            };
            let path = base.join(file);
            if incoming.is_deleted() {
                ops.push(FileOp::Remove { path });
            } else {
                ops.push(FileOp::Write {
                    path,
                    contents: pretty(&pick(record, fields))?,
                });
            }
        }
        ResourceKind::TaskLogs | ResourceKind::ProjectSettings => {}
    }

    Ok(RemoteArtifact {
        resource_id,
        record: incoming,
        ops,
    })
}

/// Temp sibling of `path`; its name matches none of the watch patterns.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.sync-tmp", name))
}

/// Write `contents` to `path` through a temp file and a rename.
///
/// The target only changes once, so the watcher sees a single notification for it.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::fs(parent, e))?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, contents)
        .await
        .map_err(|e| SyncError::fs(&temp, e))?;

    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(SyncError::fs(path, e));
    }
    Ok(())
}
