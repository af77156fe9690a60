//! Agent family contracts: launch binaries, arguments, prompt modes, and
//! output parsers for the three supported agent CLIs.
//!
//! Adding a family is a matter of adding an `AgentKind` variant plus its
//! contract below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::TeamError;

/// Timeout for the `<binary> --version` availability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The three supported agent CLI families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Claude => write!(f, "claude"),
            AgentKind::Codex => write!(f, "codex"),
            AgentKind::Gemini => write!(f, "gemini"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            other => anyhow::bail!("Unknown agent type: '{}'", other),
        }
    }
}

/// How a family accepts a one-shot prompt without entering its REPL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Prompt is passed as a positional argument.
    Positional,
    /// Prompt is passed behind a single flag (e.g. `-p`).
    Flag(&'static str),
}

/// Static launch contract for one agent family.
#[derive(Debug, Clone, Copy)]
pub struct AgentContract {
    pub binary: &'static str,
    pub install_hint: &'static str,
    pub prompt_mode: Option<PromptMode>,
}

impl AgentKind {
    pub fn contract(&self) -> AgentContract {
        match self {
            AgentKind::Claude => AgentContract {
                binary: "claude",
                install_hint: "Install with: npm install -g @anthropic-ai/claude-code",
                prompt_mode: None,
            },
            AgentKind::Codex => AgentContract {
                binary: "codex",
                install_hint: "Install with: npm install -g @openai/codex",
                prompt_mode: Some(PromptMode::Positional),
            },
            AgentKind::Gemini => AgentContract {
                binary: "gemini",
                install_hint: "Install with: npm install -g @google/gemini-cli",
                prompt_mode: Some(PromptMode::Flag("-p")),
            },
        }
    }

    /// True when the family can take its prompt on the command line.
    pub fn supports_prompt_mode(&self) -> bool {
        self.contract().prompt_mode.is_some()
    }

    /// Default launch arguments for this family.
    pub fn launch_args(&self, model: Option<&str>, extra_flags: &[String]) -> Vec<String> {
        let mut args: Vec<String> = match self {
            AgentKind::Claude => vec!["--dangerously-skip-permissions".to_string()],
            AgentKind::Codex => vec![
                "exec".to_string(),
                "--json".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            AgentKind::Gemini => vec!["--yolo".to_string()],
        };
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.extend(extra_flags.iter().cloned());
        args
    }

    /// Arguments that deliver a one-shot prompt, for families that
    /// support prompt mode.
    pub fn prompt_args(&self, prompt: &str) -> Vec<String> {
        match self.contract().prompt_mode {
            Some(PromptMode::Positional) => vec![prompt.to_string()],
            Some(PromptMode::Flag(flag)) => vec![flag.to_string(), prompt.to_string()],
            None => Vec::new(),
        }
    }

    /// Parse captured stdout of a one-shot run into the agent's answer.
    pub fn parse_output(&self, raw: &str) -> String {
        match self {
            AgentKind::Claude | AgentKind::Gemini => raw.trim().to_string(),
            AgentKind::Codex => parse_codex_transcript(raw),
        }
    }
}

/// Scan a codex JSON-lines transcript from the end: prefer the last
/// assistant message content, then the last `result`/`output` field,
/// falling back to the trimmed raw text.
fn parse_codex_transcript(raw: &str) -> String {
    let mut last_result: Option<String> = None;
    for line in raw.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if let Some(content) = assistant_message_content(&v) {
            return content;
        }
        if last_result.is_none() {
            for key in ["result", "output"] {
                if let Some(text) = v.get(key).and_then(|x| x.as_str()) {
                    last_result = Some(text.to_string());
                    break;
                }
            }
        }
    }
    last_result.unwrap_or_else(|| raw.trim().to_string())
}

fn assistant_message_content(v: &serde_json::Value) -> Option<String> {
    let msg = v.get("msg").unwrap_or(v);
    let is_message = msg.get("type").and_then(|t| t.as_str()) == Some("agent_message")
        || v.get("role").and_then(|r| r.as_str()) == Some("assistant");
    if !is_message {
        return None;
    }
    let content = msg
        .get("message")
        .or_else(|| msg.get("content"))
        .or_else(|| v.get("content"))?;
    match content {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

/// Probe whether the family's binary is on PATH and answers `--version`
/// within five seconds.
pub async fn probe_available(kind: AgentKind) -> bool {
    let contract = kind.contract();
    let probe = Command::new(contract.binary)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

/// Probe availability, raising with the family's install hint on failure.
pub async fn ensure_available(kind: AgentKind) -> Result<(), TeamError> {
    if probe_available(kind).await {
        return Ok(());
    }
    let contract = kind.contract();
    Err(TeamError::AgentNotAvailable {
        binary: contract.binary,
        install_hint: contract.install_hint,
    })
}

/// Compose the full worker argv: `[binary, ...launch args]`.
pub fn compose_argv(kind: AgentKind, model: Option<&str>, extra_flags: &[String]) -> Vec<String> {
    let mut argv = vec![kind.contract().binary.to_string()];
    argv.extend(kind.launch_args(model, extra_flags));
    argv
}

/// Environment variables injected into every worker pane.
pub fn worker_env(team_name: &str, worker: &str, kind: AgentKind) -> Vec<(String, String)> {
    vec![
        (
            "OMC_TEAM_WORKER".to_string(),
            format!("{}/{}", team_name, worker),
        ),
        ("OMC_TEAM_NAME".to_string(), team_name.to_string()),
        ("OMC_WORKER_AGENT_TYPE".to_string(), kind.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("claude".parse::<AgentKind>().unwrap(), AgentKind::Claude);
        assert_eq!(" Codex ".parse::<AgentKind>().unwrap(), AgentKind::Codex);
        assert_eq!("gemini".parse::<AgentKind>().unwrap(), AgentKind::Gemini);
        assert!("gpt".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_claude_argv() {
        let argv = compose_argv(AgentKind::Claude, Some("opus"), &[]);
        assert_eq!(
            argv,
            vec!["claude", "--dangerously-skip-permissions", "--model", "opus"]
        );
        assert!(!AgentKind::Claude.supports_prompt_mode());
    }

    #[test]
    fn test_codex_argv_and_prompt() {
        let argv = compose_argv(AgentKind::Codex, None, &["--foo".to_string()]);
        assert_eq!(
            argv,
            vec![
                "codex",
                "exec",
                "--json",
                "--dangerously-bypass-approvals-and-sandbox",
                "--skip-git-repo-check",
                "--foo"
            ]
        );
        assert_eq!(AgentKind::Codex.prompt_args("do it"), vec!["do it"]);
    }

    #[test]
    fn test_gemini_argv_and_prompt() {
        let argv = compose_argv(AgentKind::Gemini, Some("flash"), &[]);
        assert_eq!(argv, vec!["gemini", "--yolo", "--model", "flash"]);
        assert_eq!(AgentKind::Gemini.prompt_args("hi"), vec!["-p", "hi"]);
    }

    #[test]
    fn test_worker_env() {
        let env = worker_env("demo", "worker-2", AgentKind::Codex);
        assert_eq!(
            env,
            vec![
                ("OMC_TEAM_WORKER".to_string(), "demo/worker-2".to_string()),
                ("OMC_TEAM_NAME".to_string(), "demo".to_string()),
                ("OMC_WORKER_AGENT_TYPE".to_string(), "codex".to_string()),
            ]
        );
    }

    #[test]
    fn test_trim_parsers() {
        assert_eq!(AgentKind::Claude.parse_output("  hi\n"), "hi");
        assert_eq!(AgentKind::Gemini.parse_output("\nanswer\n\n"), "answer");
    }

    #[test]
    fn test_codex_parser_prefers_last_assistant_message() {
        let raw = concat!(
            r#"{"msg":{"type":"task_started"}}"#,
            "\n",
            r#"{"msg":{"type":"agent_message","message":"first"}}"#,
            "\n",
            r#"{"msg":{"type":"agent_message","message":"final answer"}}"#,
            "\n",
            r#"{"msg":{"type":"task_complete"}}"#,
            "\n",
        );
        assert_eq!(AgentKind::Codex.parse_output(raw), "final answer");
    }

    #[test]
    fn test_codex_parser_falls_back_to_result_field() {
        let raw = concat!(
            r#"{"type":"turn"}"#,
            "\n",
            r#"{"result":"the result"}"#,
            "\n",
        );
        assert_eq!(AgentKind::Codex.parse_output(raw), "the result");
    }

    #[test]
    fn test_codex_parser_falls_back_to_raw() {
        assert_eq!(AgentKind::Codex.parse_output(" plain text \n"), "plain text");
    }

    #[test]
    fn test_codex_parser_role_content_shape() {
        let raw = r#"{"role":"assistant","content":[{"type":"text","text":"hello"}]}"#;
        assert_eq!(AgentKind::Codex.parse_output(raw), "hello");
    }
}
