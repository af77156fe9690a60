//! Per-task JSON records under `tasks/<id>.json` and their state
//! transitions.
//!
//! The scheduler is the only writer of task records; workers communicate
//! back through their own `done.json` sentinel. Transitions are
//! check-then-write, acceptable under the single-writer discipline.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::team::TeamPaths;

/// How stale a heartbeat may be before the worker counts as stalled.
pub const HEARTBEAT_STALE_SECS: i64 = 60;

/// Task lifecycle states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One task record, persisted as `tasks/<id>.json`.
///
/// `id` is the 1-based string form of the task's index in the start
/// request and always equals the filename stem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    /// Worker that owns the task; null while pending.
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: String,
}

/// Completion sentinel written by a worker as `done.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSentinel {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Worker-self-reported liveness, written as `heartbeat.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub worker_name: String,
    pub status: String,
    /// ISO-8601 timestamp of the last update.
    pub updated_at: String,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Reader/writer for a team's task records.
#[derive(Debug, Clone)]
pub struct TaskStore {
    paths: TeamPaths,
}

impl TaskStore {
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    /// Read a task record. Returns `None` on any error; callers must
    /// tolerate missing or malformed records.
    pub fn read(&self, task_id: &str) -> Option<TaskRecord> {
        let contents = fs::read_to_string(self.paths.task(task_id)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Write a task record, creating parent directories as needed.
    pub fn write(&self, record: &TaskRecord) -> Result<()> {
        let path = self.paths.task(&record.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write task record {}", path.display()))?;
        Ok(())
    }

    /// Create a fresh pending record.
    pub fn create_pending(&self, task_id: &str, subject: &str, description: &str) -> Result<TaskRecord> {
        let record = TaskRecord {
            id: task_id.to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            owner: None,
            assigned_at: None,
            completed_at: None,
            failed_at: None,
            summary: None,
            result: None,
            created_at: Utc::now().to_rfc3339(),
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Transition pending → in_progress, setting the owner.
    ///
    /// Returns whether the transition happened; this is the sole arbiter
    /// of "I claimed this task". A no-op (false) when the current status
    /// is anything other than pending.
    pub fn claim(&self, task_id: &str, owner: &str) -> bool {
        let Some(mut record) = self.read(task_id) else {
            return false;
        };
        if record.status != TaskStatus::Pending {
            return false;
        }
        record.status = TaskStatus::InProgress;
        record.owner = Some(owner.to_string());
        record.assigned_at = Some(Utc::now().to_rfc3339());
        self.write(&record).is_ok()
    }

    /// Reset a task back to pending, clearing its owner.
    ///
    /// Used when the scheduler fails to notify a freshly spawned worker.
    pub fn reset_to_pending(&self, task_id: &str) -> Result<()> {
        let Some(mut record) = self.read(task_id) else {
            return Ok(());
        };
        record.status = TaskStatus::Pending;
        record.owner = None;
        record.assigned_at = None;
        self.write(&record)
    }

    /// Apply a worker's completion sentinel to the task record.
    ///
    /// Terminal records are never modified again, so re-processing a
    /// sentinel is a no-op.
    pub fn apply_done(&self, task_id: &str, sentinel: &DoneSentinel) -> Result<()> {
        let Some(mut record) = self.read(task_id) else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let failed = sentinel.status.as_deref() == Some("failed");
        record.status = if failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        record.summary = sentinel.summary.clone();
        record.result = sentinel.result.clone();
        if failed {
            record.failed_at = Some(sentinel.completed_at.clone().unwrap_or(now));
        } else {
            record.completed_at = Some(sentinel.completed_at.clone().unwrap_or(now));
        }
        self.write(&record)
    }

    /// Mark a task failed because its worker's pane died before any
    /// `done.json` was written.
    pub fn fail_dead_pane(&self, task_id: &str, worker: &str) -> Result<()> {
        let Some(mut record) = self.read(task_id) else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = TaskStatus::Failed;
        record.summary = Some(format!(
            "Worker pane died before done.json was written ({})",
            worker
        ));
        record.failed_at = Some(Utc::now().to_rfc3339());
        self.write(&record)
    }

    /// All task records, sorted by numeric id.
    pub fn list(&self) -> Vec<TaskRecord> {
        let dir = self.paths.tasks_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut records: Vec<TaskRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .filter_map(|e| fs::read_to_string(e.path()).ok())
            .filter_map(|c| serde_json::from_str(&c).ok())
            .collect();
        records.sort_by_key(|r: &TaskRecord| r.id.parse::<usize>().unwrap_or(usize::MAX));
        records
    }

    /// Lowest-id pending task, if any. Dispatch order follows task ids.
    pub fn next_pending(&self) -> Option<TaskRecord> {
        self.list()
            .into_iter()
            .find(|r| r.status == TaskStatus::Pending)
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for record in self.list() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// True when every task has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        let records = self.list();
        !records.is_empty() && records.iter().all(|r| r.status.is_terminal())
    }
}

/// Parse a heartbeat file and decide staleness against `now`.
pub fn heartbeat_is_stale(heartbeat: &Heartbeat, now: chrono::DateTime<Utc>) -> bool {
    match chrono::DateTime::parse_from_rfc3339(&heartbeat.updated_at) {
        Ok(ts) => (now - ts.with_timezone(&Utc)).num_seconds() > HEARTBEAT_STALE_SECS,
        Err(_) => true,
    }
}
