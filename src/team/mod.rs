//! Team name validation and the per-team on-disk state layout.
//!
//! Everything the runtime persists for a team lives under
//! `.omc/state/team/<teamName>/` in the process working directory. Team
//! names appear in paths, environment variables, and tmux targets, so the
//! syntactic rules are enforced here before any of those are touched.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::TeamError;

/// Team names: lowercase alphanumerics and dashes, 2..=50 chars, no
/// leading or trailing dash.
const TEAM_NAME_PATTERN: &str = "^[a-z0-9][a-z0-9-]{0,48}[a-z0-9]$";

fn team_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TEAM_NAME_PATTERN).expect("team name pattern is valid"))
}

/// Validate a proposed team name, returning it trimmed on success.
///
/// Every external entry point that accepts a team name calls this before
/// any filesystem or multiplexer operation.
pub fn validate_team_name(name: &str) -> Result<String, TeamError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TeamError::InvalidTeamName("name is empty".to_string()));
    }
    if !team_name_regex().is_match(trimmed) {
        return Err(TeamError::InvalidTeamName(format!(
            "'{}' must match {} (lowercase letters, digits and dashes, \
             2-50 chars, no leading/trailing dash)",
            trimmed, TEAM_NAME_PATTERN
        )));
    }
    Ok(trimmed.to_string())
}

/// Derive the worker identity for a 0-based worker slot index.
pub fn worker_name(index: usize) -> String {
    format!("worker-{}", index + 1)
}

/// Parse a worker name back into its 0-based slot index.
pub fn worker_index(name: &str) -> Option<usize> {
    let n: usize = name.strip_prefix("worker-")?.parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n - 1)
}

/// All paths under a single team's state root.
///
/// The layout is fixed:
///
/// ```text
/// .omc/state/team/<teamName>/
///   config.json
///   shutdown.json
///   tasks/<taskId>.json
///   workers/<workerName>/{AGENTS.md, inbox.md, heartbeat.json,
///                         done.json, shutdown-ack.json, .ready}
///   mailbox/<workerName>.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct TeamPaths {
    root: PathBuf,
}

impl TeamPaths {
    pub fn new(cwd: &Path, team_name: &str) -> Self {
        Self {
            root: cwd.join(".omc").join("state").join("team").join(team_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn shutdown_sentinel(&self) -> PathBuf {
        self.root.join("shutdown.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn task(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{}.json", task_id))
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.workers_dir().join(worker)
    }

    pub fn overlay(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("AGENTS.md")
    }

    pub fn inbox(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("inbox.md")
    }

    pub fn heartbeat(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("heartbeat.json")
    }

    pub fn done_sentinel(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("done.json")
    }

    pub fn shutdown_ack(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("shutdown-ack.json")
    }

    pub fn ready_sentinel(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join(".ready")
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.root.join("mailbox")
    }

    pub fn mailbox(&self, worker: &str) -> PathBuf {
        self.mailbox_dir().join(format!("{}.jsonl", worker))
    }
}
