//! Inter-worker message log: `mailbox/<workerName>.jsonl` under the team
//! root, one JSON object per line, append-only.

use std::fs::{self, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::team::TeamPaths;

/// One mailbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp: String,
}

impl MailboxMessage {
    pub fn new(from: &str, to: &str, body: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Append a message to the recipient's mailbox log.
pub fn append_message(paths: &TeamPaths, message: &MailboxMessage) -> Result<()> {
    let dir = paths.mailbox_dir();
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = paths.mailbox(&message.to);
    let line = serde_json::to_string(message)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open mailbox {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read a worker's mailbox without consuming it. Malformed lines are
/// skipped.
pub fn read_messages(paths: &TeamPaths, worker: &str) -> Vec<MailboxMessage> {
    let Ok(contents) = fs::read_to_string(paths.mailbox(worker)) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let paths = TeamPaths::new(tmp.path(), "demo");

        append_message(&paths, &MailboxMessage::new("worker-1", "worker-2", "hi")).unwrap();
        append_message(&paths, &MailboxMessage::new("worker-3", "worker-2", "yo")).unwrap();

        let messages = read_messages(&paths, "worker-2");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].from, "worker-1");
        assert_eq!(messages[1].body, "yo");

        // Other mailboxes are untouched.
        assert!(read_messages(&paths, "worker-1").is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let paths = TeamPaths::new(tmp.path(), "demo");
        append_message(&paths, &MailboxMessage::new("a", "worker-1", "ok")).unwrap();

        let path = paths.mailbox("worker-1");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("not json\n");
        fs::write(&path, contents).unwrap();

        let messages = read_messages(&paths, "worker-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "ok");
    }
}
