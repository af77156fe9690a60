//! Point-in-time team snapshots for status queries.
//!
//! Scans the team state tree and the worker panes, classifying the team
//! into a coarse phase and reporting per-worker liveness and heartbeat
//! staleness.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::tasks::{heartbeat_is_stale, Heartbeat, TaskCounts, TaskStore};
use crate::team::TeamPaths;
use crate::tmux::Multiplexer;

/// Coarse team phase derived from task counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamPhase {
    Planning,
    Executing,
    Fixing,
    Completed,
}

impl std::fmt::Display for TeamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamPhase::Planning => write!(f, "planning"),
            TeamPhase::Executing => write!(f, "executing"),
            TeamPhase::Fixing => write!(f, "fixing"),
            TeamPhase::Completed => write!(f, "completed"),
        }
    }
}

/// One worker's view in a snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_name: String,
    pub alive: bool,
    pub pane_id: Option<String>,
    pub current_task_id: Option<String>,
    pub last_heartbeat: Option<String>,
    pub stalled: bool,
    pub ready: bool,
}

/// How long each scan took, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTimings {
    pub task_scan_ms: u128,
    pub worker_scan_ms: u128,
    pub total_ms: u128,
}

/// Immutable view of team state at a moment in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSnapshot {
    pub team_name: String,
    pub phase: TeamPhase,
    pub task_counts: TaskCounts,
    pub workers: Vec<WorkerStatus>,
    pub dead_workers: Vec<String>,
    pub timings: SnapshotTimings,
}

/// Classify the team phase from task counts:
/// - `completed` when every task is terminal and none failed;
/// - `fixing` when nothing is pending or in progress but some failed;
/// - `planning` when nothing is in progress or completed and some are
///   pending;
/// - `executing` otherwise.
pub fn classify_phase(counts: &TaskCounts) -> TeamPhase {
    if counts.pending == 0 && counts.in_progress == 0 && counts.failed == 0 {
        return TeamPhase::Completed;
    }
    if counts.pending == 0 && counts.in_progress == 0 && counts.failed > 0 {
        return TeamPhase::Fixing;
    }
    if counts.in_progress == 0 && counts.completed == 0 && counts.pending > 0 {
        return TeamPhase::Planning;
    }
    TeamPhase::Executing
}

/// Produce a snapshot of the team rooted at `cwd`.
///
/// `worker_panes` maps worker names to their pane ids; workers without a
/// pane are reported from heartbeat data alone.
pub async fn snapshot(
    team_name: &str,
    cwd: &Path,
    worker_panes: &HashMap<String, String>,
    mux: &dyn Multiplexer,
) -> Result<TeamSnapshot> {
    let total_start = Instant::now();
    let paths = TeamPaths::new(cwd, team_name);
    let store = TaskStore::new(paths.clone());

    let task_start = Instant::now();
    let task_counts = store.counts();
    let task_scan_ms = task_start.elapsed().as_millis();

    let worker_start = Instant::now();
    let now = Utc::now();
    let mut workers = Vec::new();
    let mut dead_workers = Vec::new();

    for worker in list_worker_names(&paths) {
        let heartbeat: Option<Heartbeat> = fs::read_to_string(paths.heartbeat(&worker))
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok());
        let stalled = heartbeat
            .as_ref()
            .map(|hb| heartbeat_is_stale(hb, now))
            .unwrap_or(true);

        let pane_id = worker_panes.get(&worker).cloned();
        let alive = match &pane_id {
            Some(pane) => !mux.pane_dead(pane).await.unwrap_or(true),
            None => false,
        };
        if pane_id.is_some() && !alive {
            dead_workers.push(worker.clone());
        }

        workers.push(WorkerStatus {
            ready: paths.ready_sentinel(&worker).exists(),
            current_task_id: heartbeat.as_ref().and_then(|hb| hb.current_task_id.clone()),
            last_heartbeat: heartbeat.map(|hb| hb.updated_at),
            worker_name: worker,
            alive,
            pane_id,
            stalled,
        });
    }
    let worker_scan_ms = worker_start.elapsed().as_millis();

    Ok(TeamSnapshot {
        team_name: team_name.to_string(),
        phase: classify_phase(&task_counts),
        task_counts,
        workers,
        dead_workers,
        timings: SnapshotTimings {
            task_scan_ms,
            worker_scan_ms,
            total_ms: total_start.elapsed().as_millis(),
        },
    })
}

/// Worker names present in the team's `workers/` directory, sorted.
fn list_worker_names(paths: &TeamPaths) -> Vec<String> {
    let Ok(entries) = fs::read_dir(paths.workers_dir()) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort_by_key(|n| crate::team::worker_index(n).unwrap_or(usize::MAX));
    names
}
