//! Per-worker bootstrap documents: the overlay instruction file and the
//! task inbox.
//!
//! The overlay (`AGENTS.md`) is written once per worker and never
//! changes; the inbox (`inbox.md`) is rewritten every time the worker is
//! (re)dispatched. Task subjects and descriptions are sanitized before
//! they are embedded so a task cannot forge control markup.

use std::fs;

use anyhow::{Context, Result};

use crate::tasks::TaskRecord;
use crate::team::TeamPaths;

/// Upper bound applied to task subjects and descriptions.
pub const MAX_FIELD_LEN: usize = 4000;

/// Control-vocabulary tags a task description must not be able to forge.
const CONTROL_TAGS: [&str; 5] = [
    "TASK_SUBJECT",
    "TASK_DESCRIPTION",
    "INBOX_MESSAGE",
    "INSTRUCTIONS",
    "SYSTEM",
];

/// Sanitize a task-supplied string before embedding it in a worker
/// document: bound its length (cutting on a char boundary so no broken
/// sequence is left at the tail) and neutralize control-vocabulary tags
/// into bracketed forms.
pub fn sanitize_field(input: &str) -> String {
    let mut text = if input.len() > MAX_FIELD_LEN {
        let mut end = MAX_FIELD_LEN;
        while end > 0 && !input.is_char_boundary(end) {
            end -= 1;
        }
        input[..end].to_string()
    } else {
        input.to_string()
    };

    for tag in CONTROL_TAGS {
        text = text
            .replace(&format!("<{}>", tag), &format!("[{}]", tag))
            .replace(&format!("</{}>", tag), &format!("[/{}]", tag));
    }
    text
}

/// The canonical `done.json` template, with the task id filled in.
pub fn done_sentinel_template(task_id: &str) -> String {
    format!(
        "{{\"taskId\": \"{}\", \"status\": \"completed\", \"summary\": \"<one-line summary of what you did>\", \"completedAt\": \"<ISO-8601 timestamp>\"}}",
        task_id
    )
}

/// Render the overlay instruction document for one worker.
///
/// States the worker's identity, the ready-sentinel handshake, the task
/// ids it may be assigned, the claim/complete protocol, the heartbeat
/// format, and the shutdown protocol. `bootstrap_extra` is appended
/// verbatim when present.
pub fn render_overlay(
    team_name: &str,
    worker: &str,
    tasks: &[TaskRecord],
    bootstrap_extra: Option<&str>,
) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# Worker instructions — {}/{}\n\n", team_name, worker));
    doc.push_str(&format!(
        "You are `{}`, a worker in team `{}`. Your state directory is\n\
         `.omc/state/team/{}/workers/{}/` relative to the project root.\n\n",
        worker, team_name, team_name, worker
    ));
    doc.push_str(
        "## First action\n\n\
         Before anything else, create the empty file `.ready` in your state\n\
         directory to signal that you are up.\n\n",
    );

    doc.push_str("## Team tasks\n\n");
    doc.push_str(
        "The team task list (your assignment arrives separately via\n\
         `inbox.md`):\n\n",
    );
    for task in tasks {
        doc.push_str(&format!(
            "- task {} — {}\n",
            task.id,
            sanitize_field(&task.subject)
        ));
    }
    doc.push('\n');

    doc.push_str(&format!(
        "## Task protocol\n\n\
         1. Read your assignment from `inbox.md` in your state directory.\n\
         2. Update the task record `tasks/<id>.json` under the team root:\n\
            set `status` to `in_progress` and `owner` to `{}`.\n\
         3. Do the work.\n\
         4. Write `done.json` in your state directory:\n\n\
         ```json\n{}\n```\n\n\
         Use `\"status\": \"failed\"` with an explanatory summary if you\n\
         could not finish.\n\n",
        worker,
        done_sentinel_template("<id>")
    ));

    doc.push_str(&format!(
        "## Heartbeat\n\n\
         While working, refresh `heartbeat.json` in your state directory\n\
         at least once a minute:\n\n\
         ```json\n\
         {{\"workerName\": \"{}\", \"status\": \"working\", \"updatedAt\": \"<ISO-8601>\", \"currentTaskId\": \"<id or null>\"}}\n\
         ```\n\n",
        worker
    ));

    doc.push_str(&format!(
        "## Mailbox\n\n\
         Messages from other workers arrive as JSON lines in\n\
         `mailbox/{}.jsonl` under the team root.\n\n",
        worker
    ));

    doc.push_str(
        "## Shutdown\n\n\
         If `shutdown.json` appears at the team root, stop what you are\n\
         doing, write `shutdown-ack.json` (any JSON object) in your state\n\
         directory, and exit.\n",
    );

    if let Some(extra) = bootstrap_extra {
        doc.push_str("\n## Additional instructions\n\n");
        doc.push_str(&sanitize_field(extra));
        doc.push('\n');
    }

    doc
}

/// Render the initial task assignment written to a worker's inbox.
pub fn render_initial_instruction(team_name: &str, worker: &str, task: &TaskRecord) -> String {
    format!(
        "# Task {} — {}\n\n\
         Worker: {}/{}\n\
         Subject: {}\n\n\
         ## Description\n\n\
         {}\n\n\
         ## When finished\n\n\
         Write this to `done.json` in your state directory (fill in the\n\
         summary and timestamp, set status to `failed` if you could not\n\
         finish):\n\n\
         ```json\n{}\n```\n\n\
         Execute ONLY this task. Do not scan the task directory, do not\n\
         claim other tasks, and exit after writing your sentinel.\n",
        task.id,
        sanitize_field(&task.subject),
        team_name,
        worker,
        sanitize_field(&task.subject),
        sanitize_field(&task.description),
        done_sentinel_template(&task.id)
    )
}

/// Write a worker's overlay, creating its state directory.
pub fn write_overlay(
    paths: &TeamPaths,
    team_name: &str,
    worker: &str,
    tasks: &[TaskRecord],
    bootstrap_extra: Option<&str>,
) -> Result<()> {
    let dir = paths.worker_dir(worker);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let doc = render_overlay(team_name, worker, tasks, bootstrap_extra);
    fs::write(paths.overlay(worker), doc)
        .with_context(|| format!("Failed to write overlay for {}", worker))
}

/// Write (or rewrite) a worker's inbox.
pub fn write_inbox(paths: &TeamPaths, worker: &str, contents: &str) -> Result<()> {
    let dir = paths.worker_dir(worker);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(paths.inbox(worker), contents)
        .with_context(|| format!("Failed to write inbox for {}", worker))
}
