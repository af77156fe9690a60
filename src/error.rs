//! Error kinds shared across the orchestrator.

/// Errors raised by the team runtime and its collaborators.
///
/// Command-level plumbing uses `anyhow`; these variants exist for the
/// failures callers dispatch on.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("invalid team name: {0}")]
    InvalidTeamName(String),

    #[error("invalid environment variable name: {0}")]
    InvalidEnvKey(String),

    #[error("agent CLI '{binary}' not found on PATH. {install_hint}")]
    AgentNotAvailable {
        binary: &'static str,
        install_hint: &'static str,
    },

    #[error("not running inside a tmux session (TMUX is unset)")]
    MultiplexerNotPresent,

    #[error("could not resolve the invoking tmux pane: {0}")]
    ContextResolutionFailed(String),

    #[error("worker_notify_failed:{worker}:{phase}")]
    WorkerNotifyFailed { worker: String, phase: &'static str },

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),
}
