//! Graceful team shutdown: sentinel, bounded ack wait, guarded pane
//! kills, state cleanup.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::team::{worker_name, TeamPaths};
use crate::tmux::Multiplexer;

/// Interval between shutdown-ack polls.
const ACK_POLL: Duration = Duration::from_millis(500);

/// The shutdown sentinel written at the team root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequest {
    pub requested_at: String,
    pub team_name: String,
}

/// Write the shutdown sentinel for a team.
pub fn write_shutdown_sentinel(paths: &TeamPaths, team_name: &str) -> Result<()> {
    fs::create_dir_all(paths.root())?;
    let request = ShutdownRequest {
        requested_at: Utc::now().to_rfc3339(),
        team_name: team_name.to_string(),
    };
    fs::write(paths.shutdown_sentinel(), serde_json::to_string(&request)?)?;
    Ok(())
}

/// Number of workers expected to acknowledge shutdown, from the
/// persisted `config.json` (`workerCount`, falling back to the task
/// list length).
fn expected_ack_count(paths: &TeamPaths) -> usize {
    let Ok(contents) = fs::read_to_string(paths.config()) else {
        return 0;
    };
    let Ok(v) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return 0;
    };
    v.get("workerCount")
        .and_then(|c| c.as_u64())
        .map(|c| c as usize)
        .or_else(|| v.get("tasks").and_then(|t| t.as_array()).map(|t| t.len()))
        .unwrap_or(0)
}

/// Shut a team down.
///
/// Writes the shutdown sentinel, waits (bounded by `timeout`) for every
/// expected worker to write its `shutdown-ack.json`, kills the worker
/// panes (the leader pane is never killed) or the whole session when
/// not in split-pane mode, and finally removes the team state tree.
///
/// Subordinate errors are logged, never re-raised.
pub async fn shutdown_team(
    mux: &dyn Multiplexer,
    team_name: &str,
    session_name: &str,
    cwd: &Path,
    timeout: Duration,
    worker_pane_ids: &[String],
    leader_pane_id: Option<&str>,
) -> Result<()> {
    let paths = TeamPaths::new(cwd, team_name);
    info!(team = team_name, "shutting down team");

    if let Err(e) = write_shutdown_sentinel(&paths, team_name) {
        warn!(team = team_name, error = %e, "could not write shutdown sentinel");
    }

    let expected = expected_ack_count(&paths);
    let deadline = Instant::now() + timeout;
    loop {
        let acked = (0..expected)
            .filter(|i| paths.shutdown_ack(&worker_name(*i)).exists())
            .count();
        if acked >= expected {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                team = team_name,
                acked,
                expected,
                "shutdown ack timeout, force-killing panes"
            );
            break;
        }
        tokio::time::sleep(ACK_POLL).await;
    }

    // Split-pane mode targets worker panes only; a plain session name
    // (no window separator) means we own the whole session.
    if session_name.contains(':') {
        for pane in worker_pane_ids {
            if Some(pane.as_str()) == leader_pane_id {
                continue;
            }
            if let Err(e) = mux.kill_pane(pane).await {
                warn!(pane = pane.as_str(), error = %e, "kill-pane failed");
            }
        }
    } else if let Err(e) = mux.kill_session(session_name).await {
        warn!(session = session_name, error = %e, "kill-session failed");
    }

    if let Err(e) = fs::remove_dir_all(paths.root()) {
        if paths.root().exists() {
            warn!(team = team_name, error = %e, "could not remove team state");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_shape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = TeamPaths::new(tmp.path(), "demo");
        write_shutdown_sentinel(&paths, "demo").unwrap();

        let raw = fs::read_to_string(paths.shutdown_sentinel()).unwrap();
        // Single-line JSON.
        assert_eq!(raw.lines().count(), 1);
        let parsed: ShutdownRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.team_name, "demo");
        assert!(!parsed.requested_at.is_empty());
    }

    #[test]
    fn test_expected_ack_count_from_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = TeamPaths::new(tmp.path(), "demo");
        fs::create_dir_all(paths.root()).unwrap();

        fs::write(paths.config(), r#"{"workerCount": 3}"#).unwrap();
        assert_eq!(expected_ack_count(&paths), 3);

        fs::write(
            paths.config(),
            r#"{"tasks": [{"subject": "a"}, {"subject": "b"}]}"#,
        )
        .unwrap();
        assert_eq!(expected_ack_count(&paths), 2);
    }

    #[test]
    fn test_expected_ack_count_missing_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = TeamPaths::new(tmp.path(), "demo");
        assert_eq!(expected_ack_count(&paths), 0);
    }
}
