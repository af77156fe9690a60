//! `omc-team status <team>`: human-readable team snapshot.

use std::collections::HashMap;

use colored::Colorize;

use crate::jobs::PanesFile;
use crate::monitor;
use crate::team::validate_team_name;
use crate::tmux::TmuxAdapter;

/// Render a snapshot of the team in the current working directory.
///
/// When a supervisor panes file is available (via `OMC_JOB_ID` and
/// `OMC_JOBS_DIR`), pane liveness is included; otherwise workers are
/// reported from heartbeats alone.
pub async fn execute(team_name: &str) -> i32 {
    let team_name = match validate_team_name(team_name) {
        Ok(name) => name,
        Err(e) => {
            eprintln!("omc-team status: {}", e);
            return 1;
        }
    };
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("omc-team status: {}", e);
            return 1;
        }
    };

    let worker_panes = panes_from_env()
        .map(|panes| {
            panes
                .pane_ids
                .iter()
                .enumerate()
                .map(|(i, pane)| (crate::team::worker_name(i), pane.clone()))
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    let mux = TmuxAdapter::new();
    let snapshot = match monitor::snapshot(&team_name, &cwd, &worker_panes, &mux).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("omc-team status: {:#}", e);
            return 1;
        }
    };

    println!(
        "{} Team '{}' — phase: {}",
        "→".bright_blue(),
        snapshot.team_name.bright_cyan(),
        snapshot.phase.to_string().bold()
    );
    let counts = snapshot.task_counts;
    println!(
        "  tasks: {} pending, {} in progress, {} completed, {} failed",
        counts.pending,
        counts.in_progress,
        counts.completed.to_string().green(),
        if counts.failed > 0 {
            counts.failed.to_string().red().to_string()
        } else {
            counts.failed.to_string()
        }
    );

    for worker in &snapshot.workers {
        let liveness = if worker.alive {
            "alive".green()
        } else if worker.pane_id.is_some() {
            "dead".red()
        } else {
            "no pane".dimmed()
        };
        let stalled = if worker.stalled {
            " (stalled)".yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {} — {}{}, task {}",
            if worker.ready { "✓".green() } else { "·".dimmed() },
            worker.worker_name,
            liveness,
            stalled,
            worker.current_task_id.as_deref().unwrap_or("-")
        );
    }

    if !snapshot.dead_workers.is_empty() {
        println!(
            "  {} dead workers: {}",
            "⚠".yellow(),
            snapshot.dead_workers.join(", ")
        );
    }
    0
}

fn panes_from_env() -> Option<PanesFile> {
    let job_id = std::env::var("OMC_JOB_ID").ok()?;
    let jobs_dir = std::env::var("OMC_JOBS_DIR").ok()?;
    let path = std::path::Path::new(&jobs_dir).join(format!("{}-panes.json", job_id));
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
