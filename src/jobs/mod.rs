//! Background job supervisor.
//!
//! Runs the scheduler runtime as a child process and serves four
//! RPC-facing operations (start, status, wait, cleanup) with job
//! metadata persisted both in memory and under a per-user jobs
//! directory, so a restarted supervisor can still answer for jobs it did
//! not start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agents::AgentKind;
use crate::error::TeamError;
use crate::scheduler::TaskInput;
use crate::shutdown::write_shutdown_sentinel;
use crate::team::{validate_team_name, TeamPaths};
use crate::tmux::{submit, Multiplexer};

/// Default and maximum wait deadlines.
const DEFAULT_WAIT_MS: u64 = 5 * 60 * 1000;
const MAX_WAIT_MS: u64 = 60 * 60 * 1000;

/// Exponential backoff for the wait poll loop.
const POLL_BASE_MS: f64 = 500.0;
const POLL_FACTOR: f64 = 1.5;
const POLL_CAP_MS: u64 = 2000;

/// Idle nudging defaults.
const DEFAULT_NUDGE_DELAY_MS: u64 = 30_000;
const DEFAULT_NUDGE_MAX: u32 = 3;
const DEFAULT_NUDGE_MESSAGE: &str = "Continue working on your assigned task.";

/// Default cleanup grace period.
const DEFAULT_GRACE_MS: u64 = 10_000;

/// Job ids: `omc-<base36 epoch ms>`.
fn job_id_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^omc-[a-z0-9]{1,12}$").expect("job id pattern is valid"))
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persistent job metadata: `<jobId>.json` in the jobs directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub status: JobStatus,
    pub started_at: String,
    pub pid: i32,
    pub team_name: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_up_at: Option<String>,
}

/// Companion file `<jobId>-panes.json`, written by the scheduler child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanesFile {
    #[serde(default)]
    pub pane_ids: Vec<String>,
    #[serde(default)]
    pub leader_pane_id: Option<String>,
}

/// `start` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTeamRequest {
    pub team_name: String,
    pub agent_types: Vec<AgentKind>,
    pub tasks: Vec<TaskInput>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// `start` reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReply {
    pub job_id: String,
    pub pid: i32,
    pub message: String,
}

/// `status`/`wait` reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub job_id: String,
    pub status: JobStatus,
    pub elapsed_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nudges: Option<HashMap<String, u32>>,
}

/// `wait` options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaitOptions {
    pub timeout_ms: Option<u64>,
    pub nudge_delay_ms: Option<u64>,
    pub nudge_max_count: Option<u32>,
    pub nudge_message: Option<String>,
}

/// Generate a fresh job id from the current epoch milliseconds.
pub fn new_job_id() -> String {
    format!("omc-{}", to_base36(Utc::now().timestamp_millis() as u64))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// Validate a caller-supplied job id before it touches the filesystem.
pub fn validate_job_id(job_id: &str) -> Result<(), TeamError> {
    if job_id_regex().is_match(job_id) {
        Ok(())
    } else {
        Err(TeamError::InvalidJobId(job_id.to_string()))
    }
}

/// Poll delay for iteration `k` of the wait loop:
/// `min(ceil(500 * 1.5^k), 2000)` milliseconds.
pub fn backoff_delay(k: u32) -> Duration {
    let ms = (POLL_BASE_MS * POLL_FACTOR.powi(k as i32)).ceil() as u64;
    Duration::from_millis(ms.min(POLL_CAP_MS))
}

/// Default per-user jobs directory.
pub fn default_jobs_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".omc")
        .join("team-jobs")
}

/// Is a process with this pid alive? EPERM still means "exists".
pub fn is_process_running(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Per-pane idle tracking for the wait-loop nudger.
#[derive(Default)]
struct NudgeTracker {
    panes: HashMap<String, PaneIdle>,
}

struct PaneIdle {
    last_capture: String,
    last_change: Instant,
    count: u32,
}

impl NudgeTracker {
    /// Observe every worker pane; nudge those idle past the threshold.
    /// Nudge failures never propagate.
    async fn poll(
        &mut self,
        mux: &dyn Multiplexer,
        panes: &PanesFile,
        delay: Duration,
        max_count: u32,
        message: &str,
    ) {
        for pane in &panes.pane_ids {
            if panes.leader_pane_id.as_deref() == Some(pane.as_str()) {
                continue;
            }
            let capture = match mux.capture_pane(pane).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let now = Instant::now();
            let entry = self.panes.entry(pane.clone()).or_insert_with(|| PaneIdle {
                last_capture: capture.clone(),
                last_change: now,
                count: 0,
            });
            if entry.last_capture != capture {
                entry.last_capture = capture;
                entry.last_change = now;
                continue;
            }
            if now.duration_since(entry.last_change) >= delay && entry.count < max_count {
                entry.count += 1;
                info!(pane = pane.as_str(), nudge = entry.count, "nudging idle pane");
                let _ = submit::submit_to_pane(mux, pane, message).await;
            }
        }
    }

    fn summary(&self) -> HashMap<String, u32> {
        self.panes
            .iter()
            .filter(|(_, idle)| idle.count > 0)
            .map(|(pane, idle)| (pane.clone(), idle.count))
            .collect()
    }
}

/// The supervisor: in-memory job map plus on-disk records.
pub struct JobSupervisor {
    jobs_dir: PathBuf,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    mux: Arc<dyn Multiplexer>,
}

impl JobSupervisor {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self::with_jobs_dir(mux, default_jobs_dir())
    }

    pub fn with_jobs_dir(mux: Arc<dyn Multiplexer>, jobs_dir: PathBuf) -> Self {
        Self {
            jobs_dir,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            mux,
        }
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", job_id))
    }

    fn panes_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}-panes.json", job_id))
    }

    fn persist(&self, job_id: &str, record: &JobRecord) {
        self.jobs
            .lock()
            .expect("job map lock")
            .insert(job_id.to_string(), record.clone());
        if std::fs::create_dir_all(&self.jobs_dir).is_ok() {
            if let Ok(json) = serde_json::to_string_pretty(record) {
                let _ = std::fs::write(self.record_path(job_id), json);
            }
        }
    }

    /// In-memory record, falling back to disk for jobs started by a
    /// previous supervisor instance.
    fn load(&self, job_id: &str) -> Option<JobRecord> {
        if let Some(record) = self.jobs.lock().expect("job map lock").get(job_id) {
            return Some(record.clone());
        }
        let contents = std::fs::read_to_string(self.record_path(job_id)).ok()?;
        let record: JobRecord = serde_json::from_str(&contents).ok()?;
        self.jobs
            .lock()
            .expect("job map lock")
            .insert(job_id.to_string(), record.clone());
        Some(record)
    }

    fn read_panes(&self, job_id: &str) -> PanesFile {
        std::fs::read_to_string(self.panes_path(job_id))
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    /// Start a team as a background scheduler child.
    pub async fn start(&self, request: StartTeamRequest) -> Result<StartReply> {
        let team_name = validate_team_name(&request.team_name)?;
        if request.agent_types.is_empty() {
            bail!("agentTypes must not be empty");
        }
        if request.tasks.is_empty() {
            bail!("tasks must not be empty");
        }
        if request.cwd.trim().is_empty() {
            bail!("cwd must not be empty");
        }

        let job_id = new_job_id();
        let config = crate::scheduler::TeamConfig {
            team_name: team_name.clone(),
            agent_types: request.agent_types.clone(),
            tasks: request.tasks.clone(),
            cwd: PathBuf::from(&request.cwd),
            worker_count: request.worker_count,
            poll_interval_ms: None,
            model: request.model.clone(),
            interactive: false,
        };
        let stdin_payload = serde_json::to_string(&config)?;

        let exe = std::env::current_exe().context("could not resolve own executable")?;
        let spawned = tokio::process::Command::new(exe)
            .arg("run")
            .current_dir(&request.cwd)
            .env("OMC_JOB_ID", &job_id)
            .env("OMC_JOBS_DIR", &self.jobs_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let record = JobRecord {
                    status: JobStatus::Failed,
                    started_at: Utc::now().to_rfc3339(),
                    pid: 0,
                    team_name,
                    cwd: request.cwd.clone(),
                    result: None,
                    stderr: Some(format!("spawn error: {}", e)),
                    error: Some(format!("spawn error: {}", e)),
                    cleaned_up_at: None,
                };
                self.persist(&job_id, &record);
                bail!("spawn error: {}", e);
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let record = JobRecord {
            status: JobStatus::Running,
            started_at: Utc::now().to_rfc3339(),
            pid,
            team_name: team_name.clone(),
            cwd: request.cwd.clone(),
            result: None,
            stderr: None,
            error: None,
            cleaned_up_at: None,
        };
        self.persist(&job_id, &record);

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(stdin_payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        // Reap the child and settle the job from its final stdout line.
        let jobs = self.jobs.clone();
        let jobs_dir = self.jobs_dir.clone();
        let monitor_id = job_id.clone();
        tokio::spawn(async move {
            let output = child.wait_with_output().await;
            let mut map = jobs.lock().expect("job map lock");
            let Some(record) = map.get_mut(&monitor_id) else {
                return;
            };
            match output {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let last_line = stdout.lines().rev().find(|l| !l.trim().is_empty());
                    let summary: Option<serde_json::Value> =
                        last_line.and_then(|l| serde_json::from_str(l).ok());
                    record.status = match summary
                        .as_ref()
                        .and_then(|v| v.get("status"))
                        .and_then(|s| s.as_str())
                    {
                        Some("completed") => JobStatus::Completed,
                        Some(_) => JobStatus::Failed,
                        None if output.status.success() => JobStatus::Completed,
                        None => JobStatus::Failed,
                    };
                    record.result = summary;
                    if !stderr.trim().is_empty() {
                        record.stderr = Some(stderr.trim().to_string());
                    }
                }
                Err(e) => {
                    record.status = JobStatus::Failed;
                    record.error = Some(format!("wait error: {}", e));
                }
            }
            let record = record.clone();
            drop(map);
            if std::fs::create_dir_all(&jobs_dir).is_ok() {
                if let Ok(json) = serde_json::to_string_pretty(&record) {
                    let _ = std::fs::write(
                        jobs_dir.join(format!("{}.json", monitor_id)),
                        json,
                    );
                }
            }
        });

        info!(job = job_id.as_str(), pid, team = team_name.as_str(), "team job started");
        Ok(StartReply {
            message: format!(
                "Team '{}' started as job {} (pid {})",
                team_name, job_id, pid
            ),
            job_id,
            pid,
        })
    }

    /// Current job status.
    pub async fn status(&self, job_id: &str) -> Result<StatusReply> {
        validate_job_id(job_id)?;
        let record = self
            .load(job_id)
            .ok_or_else(|| TeamError::JobNotFound(job_id.to_string()))?;
        Ok(self.reply(job_id, &record, None, None))
    }

    /// Poll until the job is terminal or the deadline passes.
    ///
    /// Poll delays back off exponentially; every poll also checks the
    /// child pid and nudges idle worker panes. On timeout the job is
    /// left running; workers are never killed here.
    pub async fn wait(&self, job_id: &str, options: WaitOptions) -> Result<StatusReply> {
        validate_job_id(job_id)?;
        if self.load(job_id).is_none() {
            bail!(TeamError::JobNotFound(job_id.to_string()));
        }

        let timeout_ms = options.timeout_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let nudge_delay =
            Duration::from_millis(options.nudge_delay_ms.unwrap_or(DEFAULT_NUDGE_DELAY_MS));
        let nudge_max = options.nudge_max_count.unwrap_or(DEFAULT_NUDGE_MAX);
        let nudge_message = options
            .nudge_message
            .clone()
            .unwrap_or_else(|| DEFAULT_NUDGE_MESSAGE.to_string());

        let mut tracker = NudgeTracker::default();
        let mut k: u32 = 0;
        loop {
            let Some(mut record) = self.load(job_id) else {
                bail!(TeamError::JobNotFound(job_id.to_string()));
            };

            if record.status.is_terminal() {
                return Ok(self.reply(job_id, &record, None, Some(tracker.summary())));
            }

            // Orphan detection: a running job whose pid is gone will
            // never settle through the monitor task.
            if record.pid > 0 && !is_process_running(record.pid) {
                warn!(job = job_id, pid = record.pid, "job process vanished");
                record.status = JobStatus::Failed;
                record.error = Some(format!(
                    "Process no longer alive (pid {})",
                    record.pid
                ));
                self.persist(job_id, &record);
                return Ok(self.reply(job_id, &record, record.error.clone(), Some(tracker.summary())));
            }

            let panes = self.read_panes(job_id);
            tracker
                .poll(
                    self.mux.as_ref(),
                    &panes,
                    nudge_delay,
                    nudge_max,
                    &nudge_message,
                )
                .await;

            let delay = backoff_delay(k);
            k += 1;
            let now = Instant::now();
            if now + delay >= deadline {
                if deadline > now {
                    tokio::time::sleep(deadline - now).await;
                }
                let record = self.load(job_id).unwrap_or(record);
                if record.status.is_terminal() {
                    return Ok(self.reply(job_id, &record, None, Some(tracker.summary())));
                }
                let error = format!(
                    "Timeout: job still running after {} ms; wait again or call cleanup",
                    timeout_ms
                );
                return Ok(self.reply(job_id, &record, Some(error), Some(tracker.summary())));
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Tear a job's workers down: shutdown sentinel, grace period, then
    /// force-kill every worker pane. The leader pane is never touched.
    pub async fn cleanup(&self, job_id: &str, grace_ms: Option<u64>) -> Result<String> {
        validate_job_id(job_id)?;
        let mut record = self
            .load(job_id)
            .ok_or_else(|| TeamError::JobNotFound(job_id.to_string()))?;

        let paths = TeamPaths::new(std::path::Path::new(&record.cwd), &record.team_name);
        if let Err(e) = write_shutdown_sentinel(&paths, &record.team_name) {
            warn!(job = job_id, error = %e, "could not write shutdown sentinel");
        }

        let grace = Duration::from_millis(grace_ms.unwrap_or(DEFAULT_GRACE_MS));
        tokio::time::sleep(grace).await;

        let panes = self.read_panes(job_id);
        let mut killed = 0usize;
        for pane in &panes.pane_ids {
            if panes.leader_pane_id.as_deref() == Some(pane.as_str()) {
                continue;
            }
            if self.mux.kill_pane(pane).await.is_ok() {
                killed += 1;
            }
        }

        record.cleaned_up_at = Some(Utc::now().to_rfc3339());
        self.persist(job_id, &record);
        Ok(format!(
            "Cleaned up job {}: killed {} worker pane(s)",
            job_id, killed
        ))
    }

    fn reply(
        &self,
        job_id: &str,
        record: &JobRecord,
        error: Option<String>,
        nudges: Option<HashMap<String, u32>>,
    ) -> StatusReply {
        let elapsed_seconds = chrono::DateTime::parse_from_rfc3339(&record.started_at)
            .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_seconds())
            .unwrap_or(0);
        StatusReply {
            job_id: job_id.to_string(),
            status: record.status,
            elapsed_seconds,
            result: record.result.clone(),
            stderr: record.stderr.clone(),
            error: error.or_else(|| record.error.clone()),
            nudges: nudges.filter(|n| !n.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::{LaunchSpec, PaneContext};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    /// Counts kills; captures always change so the nudger stays quiet
    /// unless frozen.
    #[derive(Default)]
    struct FakeMux {
        kills: Mutex<Vec<String>>,
        frozen_capture: Mutex<Option<String>>,
        submissions: Mutex<Vec<(String, String)>>,
        capture_serial: Mutex<u64>,
    }

    impl FakeMux {
        fn kills(&self) -> Vec<String> {
            self.kills.lock().unwrap().clone()
        }

        fn submissions(&self) -> Vec<(String, String)> {
            self.submissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Multiplexer for FakeMux {
        async fn resolve_context(&self) -> anyhow::Result<PaneContext> {
            Ok(PaneContext {
                session: "main:0".to_string(),
                leader_pane: "%0".to_string(),
            })
        }
        async fn split_pane(&self, _: &str, _: bool, _: &Path) -> anyhow::Result<String> {
            anyhow::bail!("not used")
        }
        async fn apply_layout(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn focus_pane(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn enable_mouse(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_literal(&self, pane: &str, text: &str) -> anyhow::Result<()> {
            self.submissions
                .lock()
                .unwrap()
                .push((pane.to_string(), text.to_string()));
            Ok(())
        }
        async fn send_key(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn capture_pane(&self, _: &str) -> anyhow::Result<String> {
            if let Some(frozen) = self.frozen_capture.lock().unwrap().clone() {
                return Ok(frozen);
            }
            let mut serial = self.capture_serial.lock().unwrap();
            *serial += 1;
            Ok(format!("output {}", serial))
        }
        async fn pane_dead(&self, _: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn in_copy_mode(&self, _: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn kill_pane(&self, pane: &str) -> anyhow::Result<()> {
            self.kills.lock().unwrap().push(pane.to_string());
            Ok(())
        }
        async fn kill_session(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn spawn_agent(&self, _: &str, _: &LaunchSpec) -> anyhow::Result<()> {
            Ok(())
        }
        async fn window_width(&self, _: &str) -> anyhow::Result<u32> {
            Ok(120)
        }
    }

    fn supervisor(tmp: &TempDir) -> (JobSupervisor, Arc<FakeMux>) {
        let mux = Arc::new(FakeMux::default());
        let sup = JobSupervisor::with_jobs_dir(mux.clone(), tmp.path().to_path_buf());
        (sup, mux)
    }

    fn running_record(pid: i32) -> JobRecord {
        JobRecord {
            status: JobStatus::Running,
            started_at: Utc::now().to_rfc3339(),
            pid,
            team_name: "demo".to_string(),
            cwd: "/tmp".to_string(),
            result: None,
            stderr: None,
            error: None,
            cleaned_up_at: None,
        }
    }

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        assert!(validate_job_id(&id).is_ok(), "generated id {:?}", id);
        assert!(validate_job_id("omc-abc123").is_ok());
        assert!(validate_job_id("omc-").is_err());
        assert!(validate_job_id("omc-UPPER").is_err());
        assert!(validate_job_id("other-abc").is_err());
        assert!(validate_job_id("omc-aaaaaaaaaaaaa").is_err());
        assert!(validate_job_id("omc-a/../b").is_err());
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1234567890), "kf12oi");
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(750));
        assert_eq!(backoff_delay(2), Duration::from_millis(1125));
        assert_eq!(backoff_delay(3), Duration::from_millis(1688));
        assert_eq!(backoff_delay(4), Duration::from_millis(2000));
        assert_eq!(backoff_delay(10), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_status_loads_from_disk() {
        let tmp = TempDir::new().unwrap();
        let record = running_record(std::process::id() as i32);
        std::fs::write(
            tmp.path().join("omc-abc123.json"),
            serde_json::to_string_pretty(&record).unwrap(),
        )
        .unwrap();

        let (sup, _) = supervisor(&tmp);
        let reply = sup.status("omc-abc123").await.unwrap();
        assert_eq!(reply.status, JobStatus::Running);
        assert_eq!(reply.job_id, "omc-abc123");
    }

    #[tokio::test]
    async fn test_status_rejects_bad_id() {
        let tmp = TempDir::new().unwrap();
        let (sup, _) = supervisor(&tmp);
        assert!(sup.status("../etc/passwd").await.is_err());
        assert!(sup.status("omc-missing1").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_detects_orphan_pid() {
        let tmp = TempDir::new().unwrap();
        let (sup, _) = supervisor(&tmp);

        // A child that has already exited gives us a dead pid.
        let dead_pid = {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let pid = child.id() as i32;
            let _ = child.wait();
            pid
        };
        sup.persist("omc-dead1", &running_record(dead_pid));

        let reply = sup
            .wait("omc-dead1", WaitOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.status, JobStatus::Failed);
        assert!(reply.error.unwrap().starts_with("Process no longer alive"));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_killing() {
        let tmp = TempDir::new().unwrap();
        let (sup, mux) = supervisor(&tmp);
        // Our own pid is definitely alive.
        sup.persist("omc-live1", &running_record(std::process::id() as i32));

        let started = std::time::Instant::now();
        let reply = sup
            .wait(
                "omc-live1",
                WaitOptions {
                    timeout_ms: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(reply.status, JobStatus::Running);
        assert!(reply.error.unwrap().contains("Timeout"));
        // Workers keep running: the deadline never kills panes.
        assert!(mux.kills().is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_returns_when_terminal() {
        let tmp = TempDir::new().unwrap();
        let (sup, _) = supervisor(&tmp);
        let mut record = running_record(std::process::id() as i32);
        record.status = JobStatus::Completed;
        record.result = Some(serde_json::json!({"status": "completed"}));
        sup.persist("omc-done11", &record);

        let reply = sup
            .wait("omc-done11", WaitOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.status, JobStatus::Completed);
        assert!(reply.result.is_some());
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_kills_workers_but_never_leader() {
        let tmp = TempDir::new().unwrap();
        let (sup, mux) = supervisor(&tmp);
        let team_dir = TempDir::new().unwrap();
        let mut record = running_record(std::process::id() as i32);
        record.cwd = team_dir.path().to_string_lossy().to_string();
        sup.persist("omc-clean1", &record);

        let panes = PanesFile {
            pane_ids: vec![
                "%1".to_string(),
                "%2".to_string(),
                "%3".to_string(),
                "%0".to_string(),
            ],
            leader_pane_id: Some("%0".to_string()),
        };
        std::fs::write(
            tmp.path().join("omc-clean1-panes.json"),
            serde_json::to_string(&panes).unwrap(),
        )
        .unwrap();

        let message = sup.cleanup("omc-clean1", Some(10)).await.unwrap();
        assert!(message.contains("3 worker pane(s)"));

        let kills = mux.kills();
        assert_eq!(kills, vec!["%1", "%2", "%3"]);
        assert!(!kills.contains(&"%0".to_string()));

        // Shutdown sentinel landed under the team root.
        let paths = TeamPaths::new(team_dir.path(), "demo");
        assert!(paths.shutdown_sentinel().exists());

        let record = sup.load("omc-clean1").unwrap();
        assert!(record.cleaned_up_at.is_some());
    }

    #[tokio::test]
    async fn test_nudger_fires_after_idle_threshold() {
        let tmp = TempDir::new().unwrap();
        let (sup, mux) = supervisor(&tmp);
        *mux.frozen_capture.lock().unwrap() = Some("stuck output".to_string());
        sup.persist("omc-idle1", &running_record(std::process::id() as i32));

        let panes = PanesFile {
            pane_ids: vec!["%1".to_string()],
            leader_pane_id: Some("%0".to_string()),
        };
        std::fs::write(
            tmp.path().join("omc-idle1-panes.json"),
            serde_json::to_string(&panes).unwrap(),
        )
        .unwrap();

        let reply = sup
            .wait(
                "omc-idle1",
                WaitOptions {
                    timeout_ms: Some(1500),
                    nudge_delay_ms: Some(200),
                    nudge_max_count: Some(1),
                    nudge_message: Some("wake up".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(reply.status, JobStatus::Running);
        let submissions = mux.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0], ("%1".to_string(), "wake up".to_string()));
        assert_eq!(reply.nudges.unwrap().get("%1"), Some(&1));
    }

    #[tokio::test]
    async fn test_start_request_validation() {
        let tmp = TempDir::new().unwrap();
        let (sup, _) = supervisor(&tmp);

        let request = StartTeamRequest {
            team_name: "Bad Name".to_string(),
            agent_types: vec![AgentKind::Claude],
            tasks: vec![TaskInput {
                subject: "a".to_string(),
                description: "b".to_string(),
            }],
            cwd: "/tmp".to_string(),
            worker_count: None,
            model: None,
        };
        let err = sup.start(request).await.unwrap_err();
        assert!(err.to_string().contains("invalid team name"));

        let empty_tasks = StartTeamRequest {
            team_name: "demo".to_string(),
            agent_types: vec![AgentKind::Claude],
            tasks: vec![],
            cwd: "/tmp".to_string(),
            worker_count: None,
            model: None,
        };
        let err = sup.start(empty_tasks).await.unwrap_err();
        assert!(err.to_string().contains("tasks"));
    }
}
