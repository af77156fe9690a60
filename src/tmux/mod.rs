//! Terminal multiplexer adapter.
//!
//! The sole caller of the `tmux` binary. Everything the runtime does to a
//! pane (splitting, keystroke delivery, capture, liveness, kill) goes
//! through the [`Multiplexer`] trait so the scheduler, submitter,
//! supervisor, and shutdown coordinator can run against a scripted fake.
//!
//! Two environment quirks are handled here:
//! - arguments carrying tmux format-string syntax (`#{…}`) are routed
//!   through a shell with explicit quoting on POSIX-emulation platforms,
//!   which strip the braces on direct exec;
//! - worker launch commands are assembled per shell dialect (POSIX vs
//!   Windows CMD) with matching quoting.

pub mod submit;

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::error::TeamError;

/// Number of scrollback lines captured from a pane.
const CAPTURE_LINES: u32 = 80;

/// Pane ids as tmux reports them: `%<digits>`.
fn pane_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^%\d+$").expect("pane id pattern is valid"))
}

/// Environment variable names accepted into worker panes.
fn env_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern is valid"))
}

/// The invoker's session/window and leader pane.
#[derive(Debug, Clone)]
pub struct PaneContext {
    /// `session:window` target string.
    pub session: String,
    pub leader_pane: String,
}

/// A resolved team session: the invoker's window plus any pre-split panes.
#[derive(Debug, Clone)]
pub struct TeamSession {
    pub session_name: String,
    pub leader_pane_id: String,
    pub worker_pane_ids: Vec<String>,
}

/// Everything needed to launch an agent inside a pane.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Abstraction over every multiplexer interaction the runtime performs.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Resolve the invoker's session/window and leader pane id.
    async fn resolve_context(&self) -> Result<PaneContext>;

    /// Split a new pane off `target`, returning the new pane id.
    async fn split_pane(&self, target: &str, vertical: bool, cwd: &Path) -> Result<String>;

    /// Apply the main-vertical layout with the leader as the main pane.
    async fn apply_layout(&self, session: &str, leader_pane: &str) -> Result<()>;

    async fn focus_pane(&self, pane: &str) -> Result<()>;

    async fn enable_mouse(&self, session: &str) -> Result<()>;

    /// Send literal text (no key-name interpretation, no newline).
    async fn send_literal(&self, pane: &str, text: &str) -> Result<()>;

    /// Send a named key (`Enter`, `Tab`, `C-u`, …).
    async fn send_key(&self, pane: &str, key: &str) -> Result<()>;

    /// Last lines of pane scrollback, normalized.
    async fn capture_pane(&self, pane: &str) -> Result<String>;

    /// `#{pane_dead}`: `0` means alive. A missing pane counts as dead.
    async fn pane_dead(&self, pane: &str) -> Result<bool>;

    /// `#{pane_in_mode}`: whether the user is in copy/scrollback mode.
    async fn in_copy_mode(&self, pane: &str) -> Result<bool>;

    /// Kill a pane. Idempotent: killing a dead pane is not an error.
    async fn kill_pane(&self, pane: &str) -> Result<()>;

    /// Kill a whole session.
    async fn kill_session(&self, session: &str) -> Result<()>;

    /// Assemble and deliver the launch command for an agent so it
    /// replaces the pane's shell as the foreground process.
    async fn spawn_agent(&self, pane: &str, spec: &LaunchSpec) -> Result<()>;

    /// Width of the window holding `session`, in columns.
    async fn window_width(&self, session: &str) -> Result<u32>;
}

/// Shell dialect used inside panes for the launch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    Cmd,
}

/// Detect the pane shell dialect from the environment.
///
/// `SHELL` or an MSYS/MinGW marker means POSIX; a bare `COMSPEC` means
/// Windows CMD.
pub fn detect_shell() -> ShellKind {
    if env::var_os("SHELL").is_some()
        || env::var_os("MSYSTEM").is_some()
        || env::var_os("MINGW_PREFIX").is_some()
    {
        return ShellKind::Posix;
    }
    if env::var_os("COMSPEC").is_some() {
        return ShellKind::Cmd;
    }
    ShellKind::Posix
}

/// Quote a string for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '%'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a string for Windows CMD.
fn cmd_quote(s: &str) -> String {
    if !s.is_empty() && !s.contains([' ', '\t', '"', '&', '|', '<', '>', '^', '%']) {
        return s.to_string();
    }
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Candidate rc file for the user's POSIX shell.
fn posix_rc_file() -> &'static str {
    match env::var("SHELL") {
        Ok(shell) if shell.ends_with("zsh") => "$HOME/.zshrc",
        _ => "$HOME/.bashrc",
    }
}

/// Assemble the one-line command typed into a fresh pane to launch an
/// agent: export the worker environment, source the user's rc file when
/// POSIX, then `exec` the agent binary so it replaces the shell.
pub fn build_spawn_command(spec: &LaunchSpec, shell: ShellKind) -> Result<String> {
    for (key, _) in &spec.env {
        if !env_key_regex().is_match(key) {
            return Err(TeamError::InvalidEnvKey(key.clone()).into());
        }
    }
    if spec.argv.is_empty() {
        bail!("launch spec has an empty argv");
    }

    match shell {
        ShellKind::Posix => {
            let mut parts: Vec<String> = Vec::new();
            for (key, value) in &spec.env {
                parts.push(format!("export {}={}", key, sh_quote(value)));
            }
            let rc = posix_rc_file();
            parts.push(format!("[ -f \"{rc}\" ] && . \"{rc}\""));
            let argv: Vec<String> = spec.argv.iter().map(|a| sh_quote(a)).collect();
            parts.push(format!("exec {}", argv.join(" ")));
            Ok(parts.join("; "))
        }
        ShellKind::Cmd => {
            let mut parts: Vec<String> = spec
                .env
                .iter()
                .map(|(key, value)| format!("set {}={}", key, value))
                .collect();
            let argv: Vec<String> = spec.argv.iter().map(|a| cmd_quote(a)).collect();
            parts.push(argv.join(" "));
            Ok(parts.join(" && "))
        }
    }
}

/// Collapse carriage returns and runs of whitespace in captured pane
/// content, preserving line structure.
pub fn normalize_capture(raw: &str) -> String {
    raw.replace('\r', "")
        .lines()
        .map(|line| {
            line.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The real tmux-backed adapter.
///
/// Construction is cheap; the presence check for a multiplexer session
/// happens per operation so a supervisor without `$TMUX` can still serve
/// non-pane requests.
#[derive(Debug, Clone, Default)]
pub struct TmuxAdapter;

impl TmuxAdapter {
    pub fn new() -> Self {
        Self
    }

    fn require_session(&self) -> Result<()> {
        if env::var_os("TMUX").is_none() {
            return Err(TeamError::MultiplexerNotPresent.into());
        }
        Ok(())
    }

    /// Run tmux with the given arguments.
    ///
    /// Arguments containing tmux format-string syntax are routed through
    /// a shell with explicit quoting: some POSIX-emulation environments
    /// strip `#{…}` braces when the binary is invoked directly. All other
    /// invocations use direct exec.
    async fn exec(&self, args: &[&str]) -> Result<std::process::Output> {
        self.require_session()?;
        let needs_shell = args.iter().any(|a| a.contains("#{"))
            && (env::var_os("MSYSTEM").is_some() || env::var_os("MINGW_PREFIX").is_some());

        let output = if needs_shell {
            let quoted: Vec<String> = args.iter().map(|a| sh_quote(a)).collect();
            Command::new("sh")
                .arg("-c")
                .arg(format!("tmux {}", quoted.join(" ")))
                .stdin(Stdio::null())
                .output()
                .await
        } else {
            Command::new("tmux")
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
        };
        output.context("failed to run tmux")
    }

    async fn exec_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            bail!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn display(&self, pane: &str, format: &str) -> Result<String> {
        let out = self
            .exec_ok(&["display-message", "-p", "-t", pane, format])
            .await?;
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    async fn resolve_context(&self) -> Result<PaneContext> {
        self.require_session()?;

        // Preferred source: the environment names the invoker's pane.
        if let Ok(pane) = env::var("TMUX_PANE") {
            if pane_id_regex().is_match(&pane) {
                let session = self
                    .display(&pane, "#S:#I")
                    .await
                    .map_err(|e| TeamError::ContextResolutionFailed(e.to_string()))?;
                return Ok(PaneContext {
                    session,
                    leader_pane: pane,
                });
            }
        }

        // Fallback: ask tmux for the active pane of the current window.
        let out = self
            .exec_ok(&["display-message", "-p", "#S:#I #{pane_id}"])
            .await
            .map_err(|e| TeamError::ContextResolutionFailed(e.to_string()))?;
        let mut fields = out.split_whitespace();
        let session = fields.next().unwrap_or_default().to_string();
        let pane = fields.next().unwrap_or_default().to_string();
        if session.is_empty() || !pane_id_regex().is_match(&pane) {
            return Err(TeamError::ContextResolutionFailed(format!(
                "unexpected display-message output: '{}'",
                out.trim()
            ))
            .into());
        }
        Ok(PaneContext {
            session,
            leader_pane: pane,
        })
    }

    async fn split_pane(&self, target: &str, vertical: bool, cwd: &Path) -> Result<String> {
        let direction = if vertical { "-v" } else { "-h" };
        let cwd = cwd.to_string_lossy().to_string();
        let out = self
            .exec_ok(&[
                "split-window",
                direction,
                "-d",
                "-P",
                "-F",
                "#{pane_id}",
                "-t",
                target,
                "-c",
                cwd.as_str(),
            ])
            .await?;
        let pane = out.trim().to_string();
        if !pane_id_regex().is_match(&pane) {
            bail!("split-window returned an unexpected pane id: '{}'", pane);
        }
        Ok(pane)
    }

    async fn apply_layout(&self, session: &str, leader_pane: &str) -> Result<()> {
        if let Ok(width) = self.window_width(session).await {
            if width >= 40 {
                let half = (width / 2).to_string();
                let _ = self
                    .exec(&[
                        "set-window-option",
                        "-t",
                        session,
                        "main-pane-width",
                        half.as_str(),
                    ])
                    .await;
            }
        }
        self.exec_ok(&["select-layout", "-t", session, "main-vertical"])
            .await?;
        let _ = self.focus_pane(leader_pane).await;
        Ok(())
    }

    async fn focus_pane(&self, pane: &str) -> Result<()> {
        self.exec_ok(&["select-pane", "-t", pane]).await.map(|_| ())
    }

    async fn enable_mouse(&self, session: &str) -> Result<()> {
        // Best effort: older tmux may not know the option.
        let _ = self.exec(&["set-option", "-t", session, "mouse", "on"]).await;
        Ok(())
    }

    async fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
        // -l = literal mode; -- stops option parsing for leading dashes.
        self.exec_ok(&["send-keys", "-t", pane, "-l", "--", text])
            .await
            .map(|_| ())
    }

    async fn send_key(&self, pane: &str, key: &str) -> Result<()> {
        self.exec_ok(&["send-keys", "-t", pane, key]).await.map(|_| ())
    }

    async fn capture_pane(&self, pane: &str) -> Result<String> {
        let tail = format!("-{}", CAPTURE_LINES);
        let out = self
            .exec_ok(&["capture-pane", "-p", "-t", pane, "-S", tail.as_str()])
            .await?;
        Ok(normalize_capture(&out))
    }

    async fn pane_dead(&self, pane: &str) -> Result<bool> {
        match self.display(pane, "#{pane_dead}").await {
            Ok(value) => Ok(value != "0"),
            // The pane is gone entirely.
            Err(_) => Ok(true),
        }
    }

    async fn in_copy_mode(&self, pane: &str) -> Result<bool> {
        Ok(self.display(pane, "#{pane_in_mode}").await? == "1")
    }

    async fn kill_pane(&self, pane: &str) -> Result<()> {
        let _ = self.exec(&["kill-pane", "-t", pane]).await?;
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        let _ = self.exec(&["kill-session", "-t", session]).await?;
        Ok(())
    }

    async fn spawn_agent(&self, pane: &str, spec: &LaunchSpec) -> Result<()> {
        let command = build_spawn_command(spec, detect_shell())?;
        self.send_literal(pane, &command).await?;
        self.send_key(pane, "Enter").await
    }

    async fn window_width(&self, session: &str) -> Result<u32> {
        let out = self.display(session, "#{window_width}").await?;
        out.parse::<u32>()
            .with_context(|| format!("unexpected window width: '{}'", out))
    }
}

/// Resolve the invoker's window into a team session, pre-splitting
/// `worker_count` panes when requested.
///
/// Split-pane mode operates strictly inside the invoker's existing
/// session; no new session is ever created. The first worker pane splits
/// horizontally off the leader, the rest stack vertically, and the
/// main-vertical layout keeps the leader as the wide pane. Focus returns
/// to the leader.
pub async fn create_team_session(
    mux: &dyn Multiplexer,
    cwd: &Path,
    worker_count: usize,
) -> Result<TeamSession> {
    let context = mux.resolve_context().await?;
    mux.enable_mouse(&context.session).await?;

    let mut worker_pane_ids: Vec<String> = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let (target, vertical) = match worker_pane_ids.last() {
            None => (context.leader_pane.clone(), false),
            Some(last) => (last.clone(), true),
        };
        let pane = mux.split_pane(&target, vertical, cwd).await?;
        worker_pane_ids.push(pane);
    }
    if !worker_pane_ids.is_empty() {
        mux.apply_layout(&context.session, &context.leader_pane)
            .await?;
    }
    mux.focus_pane(&context.leader_pane).await?;

    Ok(TeamSession {
        session_name: context.session,
        leader_pane_id: context.leader_pane,
        worker_pane_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(env: Vec<(&str, &str)>, argv: Vec<&str>) -> LaunchSpec {
        LaunchSpec {
            argv: argv.into_iter().map(String::from).collect(),
            env: env
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cwd: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain-word.1"), "plain-word.1");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("don't"), r"'don'\''t'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("a;b"), "'a;b'");
    }

    #[test]
    fn test_posix_spawn_command_shape() {
        let spec = spec(
            vec![("OMC_TEAM_NAME", "demo")],
            vec!["claude", "--dangerously-skip-permissions"],
        );
        let cmd = build_spawn_command(&spec, ShellKind::Posix).unwrap();
        assert!(cmd.starts_with("export OMC_TEAM_NAME=demo; "));
        assert!(cmd.contains("&& . \"$HOME/"));
        assert!(cmd.ends_with("exec claude --dangerously-skip-permissions"));
    }

    #[test]
    fn test_posix_spawn_command_quotes_values() {
        let spec = spec(
            vec![("OMC_TEAM_WORKER", "demo/worker-1")],
            vec!["codex", "a b"],
        );
        let cmd = build_spawn_command(&spec, ShellKind::Posix).unwrap();
        assert!(cmd.contains("export OMC_TEAM_WORKER=demo/worker-1"));
        assert!(cmd.contains("exec codex 'a b'"));
    }

    #[test]
    fn test_cmd_spawn_command_shape() {
        let spec = spec(
            vec![("OMC_TEAM_NAME", "demo"), ("OMC_WORKER_AGENT_TYPE", "claude")],
            vec!["claude", "--model", "opus"],
        );
        let cmd = build_spawn_command(&spec, ShellKind::Cmd).unwrap();
        assert_eq!(
            cmd,
            "set OMC_TEAM_NAME=demo && set OMC_WORKER_AGENT_TYPE=claude && claude --model opus"
        );
    }

    #[test]
    fn test_rejects_invalid_env_key() {
        let bad = spec(vec![("BAD-KEY", "x")], vec!["claude"]);
        let err = build_spawn_command(&bad, ShellKind::Posix).unwrap_err();
        assert!(err.to_string().contains("BAD-KEY"));

        let injection = spec(vec![("A=B C", "x")], vec!["claude"]);
        assert!(build_spawn_command(&injection, ShellKind::Posix).is_err());
    }

    #[test]
    fn test_rejects_empty_argv() {
        let empty = spec(vec![], vec![]);
        assert!(build_spawn_command(&empty, ShellKind::Posix).is_err());
    }

    #[test]
    fn test_normalize_capture() {
        let raw = "line  one\r\n\ttabbed\t \tcontent\r\nlast";
        assert_eq!(normalize_capture(raw), "line one\ntabbed content\nlast");
    }

    #[test]
    fn test_pane_id_pattern() {
        assert!(pane_id_regex().is_match("%0"));
        assert!(pane_id_regex().is_match("%123"));
        assert!(!pane_id_regex().is_match("123"));
        assert!(!pane_id_regex().is_match("%12a"));
        assert!(!pane_id_regex().is_match(" %12"));
    }
}
