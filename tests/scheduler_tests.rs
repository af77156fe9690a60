//! End-to-end scheduler scenarios against a scripted multiplexer.
//!
//! No test here shells out to tmux or to a real agent CLI: panes are
//! simulated by `ScriptedMux`, and worker behavior is simulated by a
//! stub that watches inboxes and writes completion sentinels.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use omc_lib::agents::AgentKind;
use omc_lib::scheduler::{SchedulerTuning, TaskInput, TeamConfig, TeamScheduler};
use omc_lib::tasks::{TaskStatus, TaskStore};
use omc_lib::team::TeamPaths;
use omc_lib::tmux::{LaunchSpec, Multiplexer, PaneContext};

/// A scripted multiplexer: allocates pane ids, records spawns and
/// kills, and reports liveness from a shared dead-set.
#[derive(Default)]
struct ScriptedMux {
    next_pane: AtomicU32,
    kills: Mutex<Vec<String>>,
    spawns: Mutex<Vec<(String, LaunchSpec)>>,
    /// Panes reported dead; `all_panes_dead` marks every pane at once
    /// (workers that crash instantly).
    dead: Mutex<HashSet<String>>,
    all_panes_dead: AtomicBool,
}

impl ScriptedMux {
    fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    fn spawns(&self) -> Vec<(String, LaunchSpec)> {
        self.spawns.lock().unwrap().clone()
    }
}

#[async_trait]
impl Multiplexer for ScriptedMux {
    async fn resolve_context(&self) -> Result<PaneContext> {
        Ok(PaneContext {
            session: "main:1".to_string(),
            leader_pane: "%0".to_string(),
        })
    }

    async fn split_pane(&self, _target: &str, _vertical: bool, _cwd: &Path) -> Result<String> {
        let n = self.next_pane.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("%{}", n))
    }

    async fn apply_layout(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn focus_pane(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn enable_mouse(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn send_literal(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn send_key(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn capture_pane(&self, _: &str) -> Result<String> {
        // An empty tail reads as "message consumed" to the submitter.
        Ok(String::new())
    }

    async fn pane_dead(&self, pane: &str) -> Result<bool> {
        if self.all_panes_dead.load(Ordering::SeqCst) {
            return Ok(true);
        }
        Ok(self.dead.lock().unwrap().contains(pane))
    }

    async fn in_copy_mode(&self, _: &str) -> Result<bool> {
        Ok(false)
    }

    async fn kill_pane(&self, pane: &str) -> Result<()> {
        self.kills.lock().unwrap().push(pane.to_string());
        Ok(())
    }

    async fn kill_session(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn spawn_agent(&self, pane: &str, spec: &LaunchSpec) -> Result<()> {
        self.spawns
            .lock()
            .unwrap()
            .push((pane.to_string(), spec.clone()));
        Ok(())
    }

    async fn window_width(&self, _: &str) -> Result<u32> {
        Ok(160)
    }
}

fn fast_tuning() -> SchedulerTuning {
    SchedulerTuning {
        probe_agents: false,
        boot_delay: Duration::from_millis(10),
        trust_settle: Duration::from_millis(5),
        notify_attempts: 2,
        notify_delay: Duration::from_millis(10),
    }
}

fn team_config(tmp: &TempDir, team: &str, kinds: Vec<AgentKind>, subjects: &[&str]) -> TeamConfig {
    TeamConfig {
        team_name: team.to_string(),
        agent_types: kinds,
        tasks: subjects
            .iter()
            .map(|s| TaskInput {
                subject: s.to_string(),
                description: format!("do {}", s),
            })
            .collect(),
        cwd: tmp.path().to_path_buf(),
        worker_count: None,
        poll_interval_ms: Some(25),
        model: None,
        interactive: false,
    }
}

/// Simulated workers: watch every inbox under the team root and write a
/// completion sentinel for each assignment after `delay`. Returns the
/// order in which task ids were first assigned.
fn spawn_worker_stub(
    paths: TeamPaths,
    delay: Duration,
) -> (Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let workers_dir = paths.workers_dir();
            let Ok(entries) = std::fs::read_dir(&workers_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let worker = entry.file_name().to_string_lossy().to_string();
                let inbox = paths.inbox(&worker);
                let Ok(contents) = std::fs::read_to_string(&inbox) else {
                    continue;
                };
                // First line: "# Task <id> — <subject>"
                let Some(task_id) = contents
                    .lines()
                    .next()
                    .and_then(|l| l.strip_prefix("# Task "))
                    .and_then(|l| l.split_whitespace().next())
                    .map(str::to_string)
                else {
                    continue;
                };
                {
                    let mut seen = seen_clone.lock().unwrap();
                    if seen.contains(&task_id) {
                        continue;
                    }
                    seen.push(task_id.clone());
                }
                let done_path = paths.done_sentinel(&worker);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let sentinel = serde_json::json!({
                        "taskId": task_id,
                        "status": "completed",
                        "summary": "ok",
                        "completedAt": chrono::Utc::now().to_rfc3339(),
                    });
                    let _ = std::fs::write(&done_path, sentinel.to_string());
                });
            }
        }
    });
    (seen, handle)
}

#[tokio::test]
async fn test_two_tasks_run_to_completion() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    let config = team_config(&tmp, "demo", vec![AgentKind::Claude], &["A", "B"]);
    let paths = TeamPaths::new(tmp.path(), "demo");

    let (_seen, stub) = spawn_worker_stub(paths.clone(), Duration::from_millis(50));
    let scheduler = TeamScheduler::start(config, mux.clone(), fast_tuning())
        .await
        .unwrap();
    let summary = scheduler.run().await.unwrap();
    stub.abort();

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.worker_count, 2);
    assert_eq!(summary.task_results.len(), 2);
    assert!(summary
        .task_results
        .iter()
        .all(|r| r.status == "completed"));

    let store = TaskStore::new(paths);
    let counts = store.counts();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 0);

    // Config snapshot persisted at startup.
    let config_raw =
        std::fs::read_to_string(tmp.path().join(".omc/state/team/demo/config.json")).unwrap();
    assert!(config_raw.contains("\"teamName\": \"demo\""));

    // The leader pane is never killed.
    assert!(!mux.kills().contains(&"%0".to_string()));
}

#[tokio::test]
async fn test_worker_slot_reused_for_third_task() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    // Two agent families: concurrency 2 over 3 tasks.
    let config = team_config(
        &tmp,
        "pair",
        vec![AgentKind::Claude, AgentKind::Codex],
        &["A", "B", "C"],
    );
    let paths = TeamPaths::new(tmp.path(), "pair");

    let (_seen, stub) = spawn_worker_stub(paths.clone(), Duration::from_millis(60));
    let scheduler = TeamScheduler::start(config, mux.clone(), fast_tuning())
        .await
        .unwrap();
    let summary = scheduler.run().await.unwrap();
    stub.abort();

    assert_eq!(summary.status, "completed");
    let store = TaskStore::new(paths);
    assert_eq!(store.counts().completed, 3);

    // Three spawns for three tasks: a freed slot picked up task 3.
    assert_eq!(mux.spawns().len(), 3);

    // The codex worker (slot 2) launched in prompt mode, pointing at
    // its inbox.
    let spawns = mux.spawns();
    let codex_spawn = spawns
        .iter()
        .find(|(_, spec)| spec.argv[0] == "codex")
        .expect("a codex worker was spawned");
    assert!(codex_spawn
        .1
        .argv
        .iter()
        .any(|a| a.contains("Read and execute your task from:")));
}

#[tokio::test]
async fn test_tasks_dispatched_in_id_order() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    // One family: strictly sequential dispatch.
    let config = team_config(&tmp, "seq", vec![AgentKind::Claude], &["A", "B", "C"]);
    let paths = TeamPaths::new(tmp.path(), "seq");

    let (seen, stub) = spawn_worker_stub(paths, Duration::from_millis(30));
    let scheduler = TeamScheduler::start(config, mux, fast_tuning())
        .await
        .unwrap();
    let summary = scheduler.run().await.unwrap();
    stub.abort();

    assert_eq!(summary.status, "completed");
    assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_dead_pane_fails_task() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    mux.all_panes_dead.store(true, Ordering::SeqCst);
    let config = team_config(&tmp, "doomed", vec![AgentKind::Claude], &["A"]);
    let paths = TeamPaths::new(tmp.path(), "doomed");

    // No worker stub: the pane dies before any done.json is written.
    let scheduler = TeamScheduler::start(config, mux.clone(), fast_tuning())
        .await
        .unwrap();
    let summary = scheduler.run().await.unwrap();

    // Every task is terminal, so the run itself still completes.
    assert_eq!(summary.status, "completed");
    let store = TaskStore::new(paths);
    let record = store.read("1").unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record
        .summary
        .unwrap()
        .starts_with("Worker pane died before done.json was written"));
    assert!(record.failed_at.is_some());

    // The dead pane was killed; the leader was not.
    let kills = mux.kills();
    assert!(!kills.is_empty());
    assert!(!kills.contains(&"%0".to_string()));
}

#[tokio::test]
async fn test_sentinel_wins_over_dead_pane() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    mux.all_panes_dead.store(true, Ordering::SeqCst);
    let config = team_config(&tmp, "race", vec![AgentKind::Claude], &["A"]);
    let paths = TeamPaths::new(tmp.path(), "race");

    // The worker writes its sentinel immediately, and its pane is
    // already reported dead: completion must win.
    let (_seen, stub) = spawn_worker_stub(paths.clone(), Duration::from_millis(0));
    let scheduler = TeamScheduler::start(config, mux, fast_tuning())
        .await
        .unwrap();
    let summary = scheduler.run().await.unwrap();
    stub.abort();

    let store = TaskStore::new(paths);
    let record = store.read("1").unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(summary.status, "completed");
}

#[tokio::test]
async fn test_invalid_team_name_rejected_before_any_state() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    let config = team_config(&tmp, "Bad Name", vec![AgentKind::Claude], &["A"]);

    let err = TeamScheduler::start(config, mux, fast_tuning())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid team name"));
    // Nothing touched the filesystem.
    assert!(!tmp.path().join(".omc").exists());
}

#[tokio::test]
async fn test_done_sentinel_consumed_and_deleted() {
    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    let config = team_config(&tmp, "tidy", vec![AgentKind::Claude], &["A"]);
    let paths = TeamPaths::new(tmp.path(), "tidy");

    let (_seen, stub) = spawn_worker_stub(paths.clone(), Duration::from_millis(30));
    let scheduler = TeamScheduler::start(config, mux, fast_tuning())
        .await
        .unwrap();
    scheduler.run().await.unwrap();
    stub.abort();

    // The watchdog consumed and removed the sentinel.
    assert!(!paths.done_sentinel("worker-1").exists());
}

#[tokio::test]
async fn test_panes_file_published_for_supervisor() {
    // This test owns the OMC_* variables; no other test reads them.
    let jobs_dir = TempDir::new().unwrap();
    std::env::set_var("OMC_JOB_ID", "omc-ttest1");
    std::env::set_var("OMC_JOBS_DIR", jobs_dir.path());

    let tmp = TempDir::new().unwrap();
    let mux = Arc::new(ScriptedMux::default());
    let config = team_config(&tmp, "tracked", vec![AgentKind::Claude], &["A"]);
    let paths = TeamPaths::new(tmp.path(), "tracked");

    let (_seen, stub) = spawn_worker_stub(paths, Duration::from_millis(40));
    let scheduler = TeamScheduler::start(config, mux, fast_tuning())
        .await
        .unwrap();
    scheduler.run().await.unwrap();
    stub.abort();

    std::env::remove_var("OMC_JOB_ID");
    std::env::remove_var("OMC_JOBS_DIR");

    let panes_path: PathBuf = jobs_dir.path().join("omc-ttest1-panes.json");
    assert!(panes_path.exists());
    let panes: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(panes_path).unwrap()).unwrap();
    assert_eq!(panes["leaderPaneId"], "%0");
    assert!(panes["paneIds"].is_array());
}
