//! The team scheduler runtime.
//!
//! Owns the set of active workers, dispatches pending tasks into fresh
//! panes, and drives the 1 Hz watchdog that reconciles task state with
//! pane state. Single-threaded cooperative: every side effect is awaited
//! inline, and a single-flight guard keeps watchdog ticks from
//! overlapping.

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::{self, AgentKind};
use crate::bootstrap;
use crate::error::TeamError;
use crate::jobs::PanesFile;
use crate::shutdown::shutdown_team;
use crate::tasks::{DoneSentinel, TaskStore};
use crate::team::{validate_team_name, worker_name, worker_index, TeamPaths};
use crate::tmux::{create_team_session, submit, LaunchSpec, Multiplexer, TeamSession};

/// Ack timeout used when the runtime shuts down on a signal.
const SIGNAL_SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// One task in a team start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub subject: String,
    pub description: String,
}

/// A team start request, as consumed on stdin by `omc-team run` and
/// persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub team_name: String,
    pub agent_types: Vec<AgentKind>,
    pub tasks: Vec<TaskInput>,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Force interactive REPL mode even for families that accept a
    /// prompt argument.
    #[serde(default)]
    pub interactive: bool,
}

impl TeamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1000))
    }
}

/// Pacing knobs for the scheduler. Production defaults; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct SchedulerTuning {
    /// Probe agent CLI availability during startup.
    pub probe_agents: bool,
    /// How long an interactive REPL gets to come up before the first
    /// notification.
    pub boot_delay: Duration,
    /// Settle time after dismissing a first-run confirmation.
    pub trust_settle: Duration,
    pub notify_attempts: usize,
    pub notify_delay: Duration,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            probe_agents: true,
            boot_delay: Duration::from_secs(4),
            trust_settle: Duration::from_millis(800),
            notify_attempts: 6,
            notify_delay: Duration::from_millis(350),
        }
    }
}

/// In-memory record of a worker currently holding a task.
#[derive(Debug, Clone)]
pub struct ActiveWorker {
    pub pane_id: String,
    pub task_id: String,
    pub spawned_at: String,
}

/// Per-task outcome in the final summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// The single JSON object the runtime emits on stdout at termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRunSummary {
    pub status: String,
    pub team_name: String,
    pub task_results: Vec<TaskResult>,
    /// Wall-clock runtime in seconds.
    pub duration: f64,
    pub worker_count: usize,
}

impl TeamRunSummary {
    pub fn succeeded(&self) -> bool {
        self.status == "completed"
    }
}

/// In-flight concurrency cap: the number of distinct agent types.
pub fn concurrency_for(agent_types: &[AgentKind]) -> usize {
    let distinct: HashSet<AgentKind> = agent_types.iter().copied().collect();
    distinct.len().max(1)
}

/// Agent family for a 0-based worker slot.
pub fn agent_for_slot(agent_types: &[AgentKind], slot: usize) -> AgentKind {
    if agent_types.is_empty() {
        return AgentKind::Claude;
    }
    agent_types[slot % agent_types.len()]
}

/// Where the runtime publishes its pane set for the supervisor.
struct PanesSink {
    jobs_dir: PathBuf,
    job_id: String,
}

impl std::fmt::Debug for TeamScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamScheduler")
            .field("config", &self.config)
            .field("paths", &self.paths)
            .field("session", &self.session)
            .field("active", &self.active)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// The scheduler runtime for one team.
pub struct TeamScheduler {
    config: TeamConfig,
    paths: TeamPaths,
    store: TaskStore,
    mux: Arc<dyn Multiplexer>,
    tuning: SchedulerTuning,
    session: TeamSession,
    active: HashMap<String, ActiveWorker>,
    tick_in_flight: AtomicBool,
    shutdown_flag: Arc<AtomicBool>,
    panes_sink: Option<PanesSink>,
    started: Instant,
}

impl TeamScheduler {
    /// Run the startup sequence: validate, probe agents, materialize the
    /// team state tree, and resolve the multiplexer session.
    ///
    /// Worker panes are created on demand per dispatch, so the session
    /// starts leader-only.
    pub async fn start(
        mut config: TeamConfig,
        mux: Arc<dyn Multiplexer>,
        tuning: SchedulerTuning,
    ) -> Result<Self> {
        config.team_name = validate_team_name(&config.team_name)?;
        if config.tasks.is_empty() {
            bail!("team start request has no tasks");
        }
        if config.agent_types.is_empty() {
            bail!("team start request has no agent types");
        }

        if tuning.probe_agents {
            let distinct: HashSet<AgentKind> = config.agent_types.iter().copied().collect();
            for kind in distinct {
                agents::ensure_available(kind).await?;
            }
        }

        let paths = TeamPaths::new(&config.cwd, &config.team_name);
        std::fs::create_dir_all(paths.tasks_dir())
            .with_context(|| format!("Failed to create {}", paths.tasks_dir().display()))?;
        std::fs::create_dir_all(paths.mailbox_dir())
            .with_context(|| format!("Failed to create {}", paths.mailbox_dir().display()))?;
        std::fs::write(paths.config(), serde_json::to_string_pretty(&config)?)
            .context("Failed to write team config")?;

        let store = TaskStore::new(paths.clone());
        for (i, task) in config.tasks.iter().enumerate() {
            store.create_pending(&(i + 1).to_string(), &task.subject, &task.description)?;
        }

        // One worker identity per task; the overlay lists the whole team
        // task list, the concrete assignment arrives via the inbox.
        let records = store.list();
        for i in 0..config.tasks.len() {
            bootstrap::write_overlay(&paths, &config.team_name, &worker_name(i), &records, None)?;
        }

        let session = create_team_session(mux.as_ref(), &config.cwd, 0).await?;
        info!(
            team = config.team_name.as_str(),
            session = session.session_name.as_str(),
            leader = session.leader_pane_id.as_str(),
            "team session ready"
        );

        let panes_sink = match (env::var("OMC_JOB_ID"), env::var("OMC_JOBS_DIR")) {
            (Ok(job_id), Ok(jobs_dir)) if !job_id.is_empty() && !jobs_dir.is_empty() => {
                Some(PanesSink {
                    jobs_dir: PathBuf::from(jobs_dir),
                    job_id,
                })
            }
            _ => None,
        };

        let scheduler = Self {
            config,
            paths,
            store,
            mux,
            tuning,
            session,
            active: HashMap::new(),
            tick_in_flight: AtomicBool::new(false),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            panes_sink,
            started: Instant::now(),
        };
        scheduler.publish_panes();
        Ok(scheduler)
    }

    /// Flag checked between ticks; setting it triggers the graceful
    /// shutdown sequence.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    pub fn team_name(&self) -> &str {
        &self.config.team_name
    }

    /// Drive the team to completion: initial dispatch, then the watchdog
    /// tick until every task is terminal or shutdown is requested.
    pub async fn run(mut self) -> Result<TeamRunSummary> {
        self.dispatch_pending().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if self.shutdown_flag.load(Ordering::SeqCst) {
                info!(team = self.team_name(), "shutdown requested");
                let _ = shutdown_team(
                    self.mux.as_ref(),
                    &self.config.team_name,
                    &self.session.session_name,
                    &self.config.cwd,
                    SIGNAL_SHUTDOWN_ACK_TIMEOUT,
                    &self.session.worker_pane_ids,
                    Some(&self.session.leader_pane_id),
                )
                .await;
                break;
            }

            self.tick().await;

            if self.store.all_terminal() {
                break;
            }
        }

        Ok(self.summary())
    }

    /// One watchdog tick. Single-flight: a tick that is still running
    /// causes the next to be skipped, and no tick failure is fatal.
    pub async fn tick(&mut self) {
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.reconcile().await {
            eprintln!("[watchdog] tick error: {e:#}");
        }
        self.tick_in_flight.store(false, Ordering::SeqCst);
    }

    /// Reconcile task state with pane state for every active worker.
    ///
    /// The completion sentinel is always checked before pane liveness so
    /// a slow completion write is never mistaken for a dead pane.
    async fn reconcile(&mut self) -> Result<()> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort_by_key(|n| worker_index(n).unwrap_or(usize::MAX));

        for worker in names {
            let Some(entry) = self.active.get(&worker).cloned() else {
                continue;
            };

            let sentinel_path = self.paths.done_sentinel(&worker);
            if sentinel_path.exists() {
                // Malformed sentinels still complete the task: the
                // stored active task id is the fallback.
                let sentinel: DoneSentinel = std::fs::read_to_string(&sentinel_path)
                    .ok()
                    .and_then(|c| serde_json::from_str(&c).ok())
                    .unwrap_or(DoneSentinel {
                        task_id: None,
                        status: Some("completed".to_string()),
                        summary: None,
                        completed_at: None,
                        result: None,
                    });
                let task_id = sentinel
                    .task_id
                    .clone()
                    .unwrap_or_else(|| entry.task_id.clone());
                info!(
                    worker = worker.as_str(),
                    task = task_id.as_str(),
                    status = sentinel.status.as_deref().unwrap_or("completed"),
                    "worker finished task"
                );
                self.store.apply_done(&task_id, &sentinel)?;
                let _ = std::fs::remove_file(&sentinel_path);
                self.release_worker(&worker, &entry.pane_id).await;
                continue;
            }

            if self.mux.pane_dead(&entry.pane_id).await.unwrap_or(true) {
                warn!(
                    worker = worker.as_str(),
                    task = entry.task_id.as_str(),
                    "worker pane died"
                );
                self.store.fail_dead_pane(&entry.task_id, &worker)?;
                self.release_worker(&worker, &entry.pane_id).await;
            }
        }

        if !self.store.all_terminal() {
            self.dispatch_pending().await;
        }
        Ok(())
    }

    /// Kill a worker's pane and drop it from the active set.
    async fn release_worker(&mut self, worker: &str, pane: &str) {
        if pane != self.session.leader_pane_id {
            let _ = self.mux.kill_pane(pane).await;
        }
        self.active.remove(worker);
        self.session.worker_pane_ids.retain(|p| p != pane);
        self.publish_panes();
    }

    /// Fill free worker slots with pending tasks, lowest task id first.
    async fn dispatch_pending(&mut self) {
        while self.active.len() < concurrency_for(&self.config.agent_types) {
            let Some(task) = self.store.next_pending() else {
                break;
            };
            let Some(slot) = self.free_slot() else {
                break;
            };
            let worker = worker_name(slot);
            match self.spawn_worker_for_task(&worker, &task.id).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // Task was reset; the next tick retries.
                    warn!(worker = worker.as_str(), task = task.id.as_str(), error = %e, "dispatch failed");
                    break;
                }
            }
        }
    }

    /// Lowest worker slot with no active task.
    fn free_slot(&self) -> Option<usize> {
        (0..self.config.tasks.len()).find(|i| !self.active.contains_key(&worker_name(*i)))
    }

    /// Claim a task and spawn a worker for it: the critical section.
    ///
    /// Returns Ok(false) when the claim was lost. Any failure after the
    /// claim resets the task to pending and destroys the pane.
    async fn spawn_worker_for_task(&mut self, worker: &str, task_id: &str) -> Result<bool> {
        if !self.store.claim(task_id, worker) {
            return Ok(false);
        }

        let split_target = self
            .session
            .worker_pane_ids
            .last()
            .cloned()
            .unwrap_or_else(|| self.session.leader_pane_id.clone());
        let vertical = !self.session.worker_pane_ids.is_empty();

        let pane = match self
            .mux
            .split_pane(&split_target, vertical, &self.config.cwd)
            .await
        {
            Ok(pane) => pane,
            Err(e) => {
                let _ = self.store.reset_to_pending(task_id);
                return Err(e);
            }
        };

        let slot = worker_index(worker).unwrap_or(0);
        let kind = agent_for_slot(&self.config.agent_types, slot);
        let prompt_mode = kind.supports_prompt_mode() && !self.config.interactive;

        let task = self
            .store
            .read(task_id)
            .context("claimed task record vanished")?;
        let instruction =
            bootstrap::render_initial_instruction(&self.config.team_name, worker, &task);
        bootstrap::write_inbox(&self.paths, worker, &instruction)?;
        let inbox = self.paths.inbox(worker);
        let inbox_prompt = format!("Read and execute your task from: {}", inbox.display());

        let mut argv = agents::compose_argv(kind, self.config.model.as_deref(), &[]);
        if prompt_mode {
            argv.extend(kind.prompt_args(&inbox_prompt));
        }
        let spec = LaunchSpec {
            argv,
            env: agents::worker_env(&self.config.team_name, worker, kind),
            cwd: self.config.cwd.clone(),
        };

        if let Err(e) = self.mux.spawn_agent(&pane, &spec).await {
            let _ = self.mux.kill_pane(&pane).await;
            let _ = self.store.reset_to_pending(task_id);
            return Err(e);
        }

        info!(
            worker,
            task = task_id,
            pane = pane.as_str(),
            agent = %kind,
            "worker spawned"
        );
        self.active.insert(
            worker.to_string(),
            ActiveWorker {
                pane_id: pane.clone(),
                task_id: task_id.to_string(),
                spawned_at: Utc::now().to_rfc3339(),
            },
        );
        self.session.worker_pane_ids.push(pane.clone());
        self.publish_panes();
        let _ = self
            .mux
            .apply_layout(&self.session.session_name, &self.session.leader_pane_id)
            .await;

        if !prompt_mode {
            // Give the REPL time to come up before typing at it.
            tokio::time::sleep(self.tuning.boot_delay).await;

            if kind == AgentKind::Gemini {
                // Known first-run confirmation: answer "1" to proceed.
                let ok = submit::notify_pane_with_retry(
                    self.mux.as_ref(),
                    &pane,
                    "1",
                    self.tuning.notify_attempts,
                    self.tuning.notify_delay,
                )
                .await;
                if !ok {
                    self.abort_spawn(worker, task_id, &pane).await;
                    return Err(TeamError::WorkerNotifyFailed {
                        worker: worker.to_string(),
                        phase: "trust-confirm",
                    }
                    .into());
                }
            }

            tokio::time::sleep(self.tuning.trust_settle).await;

            let ok = submit::notify_pane_with_retry(
                self.mux.as_ref(),
                &pane,
                &inbox_prompt,
                self.tuning.notify_attempts,
                self.tuning.notify_delay,
            )
            .await;
            if !ok {
                self.abort_spawn(worker, task_id, &pane).await;
                return Err(TeamError::WorkerNotifyFailed {
                    worker: worker.to_string(),
                    phase: "initial-inbox",
                }
                .into());
            }
        }

        Ok(true)
    }

    /// Undo a spawn whose worker could not be notified.
    async fn abort_spawn(&mut self, worker: &str, task_id: &str, pane: &str) {
        let _ = self.mux.kill_pane(pane).await;
        self.active.remove(worker);
        self.session.worker_pane_ids.retain(|p| p != pane);
        self.publish_panes();
        let _ = self.store.reset_to_pending(task_id);
    }

    /// Publish the current pane set for the supervisor, when running
    /// under one. Written via write-temp-then-rename so readers never
    /// observe a torn file.
    fn publish_panes(&self) {
        let Some(sink) = &self.panes_sink else {
            return;
        };
        let panes = PanesFile {
            pane_ids: self.session.worker_pane_ids.clone(),
            leader_pane_id: Some(self.session.leader_pane_id.clone()),
        };
        let path = sink.jobs_dir.join(format!("{}-panes.json", sink.job_id));
        let tmp = sink
            .jobs_dir
            .join(format!("{}-panes.json.tmp", sink.job_id));
        let Ok(json) = serde_json::to_string_pretty(&panes) else {
            return;
        };
        if std::fs::create_dir_all(&sink.jobs_dir).is_err() {
            return;
        }
        if std::fs::write(&tmp, json).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
    }

    /// Final summary computed from the task store.
    fn summary(&self) -> TeamRunSummary {
        let records = self.store.list();
        let all_terminal = !records.is_empty() && records.iter().all(|r| r.status.is_terminal());
        TeamRunSummary {
            status: if all_terminal {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            team_name: self.config.team_name.clone(),
            task_results: records
                .into_iter()
                .map(|r| TaskResult {
                    task_id: r.id,
                    status: r.status.to_string(),
                    summary: r.summary,
                })
                .collect(),
            duration: self.started.elapsed().as_secs_f64(),
            worker_count: self.config.tasks.len(),
        }
    }

    /// Current worker panes, keyed by worker name.
    pub fn worker_panes(&self) -> HashMap<String, String> {
        self.active
            .iter()
            .map(|(w, a)| (w.clone(), a.pane_id.clone()))
            .collect()
    }
}
