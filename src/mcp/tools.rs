use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::jobs::{JobSupervisor, StartTeamRequest, WaitOptions};

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

pub fn list_tools() -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: "omc_team_start".to_string(),
            description: "Start a team of agent workers in tmux panes. Spawns the scheduler as a background job and returns its job id immediately.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "teamName": {
                        "type": "string",
                        "description": "Team name (lowercase letters, digits, dashes)"
                    },
                    "agentTypes": {
                        "type": "array",
                        "items": { "type": "string", "enum": ["claude", "codex", "gemini"] },
                        "description": "Agent families to rotate workers through"
                    },
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "subject": { "type": "string" },
                                "description": { "type": "string" }
                            },
                            "required": ["subject", "description"]
                        },
                        "description": "Tasks to distribute, one worker per task"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory for the team"
                    }
                },
                "required": ["teamName", "agentTypes", "tasks", "cwd"]
            }),
        },
        ToolInfo {
            name: "omc_team_status".to_string(),
            description: "Get the status of a team job: running/completed/failed, elapsed time, and the final result when available.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "job_id": {
                        "type": "string",
                        "description": "Job id returned by omc_team_start"
                    }
                },
                "required": ["job_id"]
            }),
        },
        ToolInfo {
            name: "omc_team_wait".to_string(),
            description: "Wait for a team job to finish, with exponential-backoff polling and idle-pane nudging. On timeout the job keeps running; wait again or call cleanup.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "job_id": { "type": "string" },
                    "timeout_ms": {
                        "type": "number",
                        "description": "Deadline in milliseconds (default 300000, max 3600000)"
                    },
                    "nudge_delay_ms": {
                        "type": "number",
                        "description": "Idle time before a pane is nudged (default 30000)"
                    },
                    "nudge_max_count": {
                        "type": "number",
                        "description": "Maximum nudges per pane (default 3)"
                    },
                    "nudge_message": {
                        "type": "string",
                        "description": "Message submitted to idle panes"
                    }
                },
                "required": ["job_id"]
            }),
        },
        ToolInfo {
            name: "omc_team_cleanup".to_string(),
            description: "Shut a team job's workers down: write the shutdown sentinel, wait a grace period, then force-kill worker panes (never the leader pane).".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "job_id": { "type": "string" },
                    "grace_ms": {
                        "type": "number",
                        "description": "Grace period before panes are killed (default 10000)"
                    }
                },
                "required": ["job_id"]
            }),
        },
    ]
}

pub async fn call_tool(supervisor: &JobSupervisor, name: &str, arguments: &Value) -> ToolResult {
    let result = match name {
        "omc_team_start" => tool_start(supervisor, arguments).await,
        "omc_team_status" => tool_status(supervisor, arguments).await,
        "omc_team_wait" => tool_wait(supervisor, arguments).await,
        "omc_team_cleanup" => tool_cleanup(supervisor, arguments).await,
        _ => Err(anyhow::anyhow!("Unknown tool: {}", name)),
    };

    match result {
        Ok(text) => ToolResult {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text,
            }],
            is_error: false,
        },
        Err(e) => ToolResult {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: format!("Error: {}", e),
            }],
            is_error: true,
        },
    }
}

fn required_job_id(args: &Value) -> Result<String> {
    args.get("job_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: job_id"))
}

async fn tool_start(supervisor: &JobSupervisor, args: &Value) -> Result<String> {
    let request: StartTeamRequest = serde_json::from_value(args.clone())
        .map_err(|e| anyhow::anyhow!("Invalid start request: {}", e))?;
    let reply = supervisor.start(request).await?;
    Ok(serde_json::to_string_pretty(&reply)?)
}

async fn tool_status(supervisor: &JobSupervisor, args: &Value) -> Result<String> {
    let job_id = required_job_id(args)?;
    let reply = supervisor.status(&job_id).await?;
    Ok(serde_json::to_string_pretty(&reply)?)
}

async fn tool_wait(supervisor: &JobSupervisor, args: &Value) -> Result<String> {
    let job_id = required_job_id(args)?;
    let options = WaitOptions {
        timeout_ms: args.get("timeout_ms").and_then(|v| v.as_u64()),
        nudge_delay_ms: args.get("nudge_delay_ms").and_then(|v| v.as_u64()),
        nudge_max_count: args
            .get("nudge_max_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        nudge_message: args
            .get("nudge_message")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };
    let reply = supervisor.wait(&job_id, options).await?;
    Ok(serde_json::to_string_pretty(&reply)?)
}

async fn tool_cleanup(supervisor: &JobSupervisor, args: &Value) -> Result<String> {
    let job_id = required_job_id(args)?;
    let grace_ms = args.get("grace_ms").and_then(|v| v.as_u64());
    supervisor.cleanup(&job_id, grace_ms).await
}
