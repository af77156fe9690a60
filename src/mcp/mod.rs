//! MCP (Model Context Protocol) server exposing the background job
//! supervisor.
//!
//! Serves `omc_team_start` / `omc_team_status` / `omc_team_wait` /
//! `omc_team_cleanup` over stdio JSON-RPC so a host agent can drive
//! teams without blocking on them.
//!
//! Launch via: `omc-team serve`
//! Configure in `.mcp.json` or `~/.claude/settings.json`:
//! ```json
//! { "mcpServers": { "omc-team": { "command": "omc-team", "args": ["serve"] } } }
//! ```

mod jsonrpc;
mod tools;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::jobs::JobSupervisor;

/// Run the MCP server on stdio until stdin closes.
///
/// One JSON-RPC request per line in, one response per line out. Long
/// calls (`wait`) are awaited inline; the supervisor's own child
/// monitors keep running on the executor meanwhile.
pub async fn run_server(supervisor: JobSupervisor) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<jsonrpc::Request>(&line) {
            Ok(request) => jsonrpc::handle_request(&supervisor, request).await,
            Err(e) => jsonrpc::Response::parse_error(e),
        };

        let payload = serde_json::to_string(&response)?;
        stdout.write_all(payload.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}
