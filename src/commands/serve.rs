//! `omc-team serve`: run the MCP stdio server.

use std::sync::Arc;

use crate::jobs::JobSupervisor;
use crate::mcp;
use crate::tmux::TmuxAdapter;

pub async fn execute() -> i32 {
    let supervisor = JobSupervisor::new(Arc::new(TmuxAdapter::new()));
    match mcp::run_server(supervisor).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("omc-team serve: {:#}", e);
            1
        }
    }
}
