//! `omc-team shutdown <team>`: manual shutdown coordinator invocation.

use std::time::Duration;

use colored::Colorize;

use crate::jobs::PanesFile;
use crate::shutdown::shutdown_team;
use crate::team::validate_team_name;
use crate::tmux::{Multiplexer, TmuxAdapter};

pub async fn execute(team_name: &str, timeout_ms: u64) -> i32 {
    let team_name = match validate_team_name(team_name) {
        Ok(name) => name,
        Err(e) => {
            eprintln!("omc-team shutdown: {}", e);
            return 1;
        }
    };
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("omc-team shutdown: {}", e);
            return 1;
        }
    };

    let mux = TmuxAdapter::new();
    let (session_name, leader_pane, worker_panes) = match mux.resolve_context().await {
        Ok(context) => {
            let panes = panes_from_env().unwrap_or_default();
            (context.session, Some(context.leader_pane), panes.pane_ids)
        }
        // Outside tmux there are no panes to kill; the sentinel and
        // state cleanup still apply.
        Err(_) => (team_name.clone(), None, Vec::new()),
    };

    let result = shutdown_team(
        &mux,
        &team_name,
        &session_name,
        &cwd,
        Duration::from_millis(timeout_ms),
        &worker_panes,
        leader_pane.as_deref(),
    )
    .await;

    match result {
        Ok(()) => {
            println!("{} Team '{}' shut down", "✓".green(), team_name.bright_cyan());
            0
        }
        Err(e) => {
            eprintln!("omc-team shutdown: {:#}", e);
            1
        }
    }
}

fn panes_from_env() -> Option<PanesFile> {
    let job_id = std::env::var("OMC_JOB_ID").ok()?;
    let jobs_dir = std::env::var("OMC_JOBS_DIR").ok()?;
    let path = std::path::Path::new(&jobs_dir).join(format!("{}-panes.json", job_id));
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
