//! `omc-team run`: the scheduler runtime CLI.
//!
//! Consumes a single JSON start request on stdin, drives the team to
//! completion, and emits exactly one final JSON summary object on
//! stdout. Exit code 0 means every task completed; 1 means failure or
//! early termination. All diagnostics go to stderr; stdout is the
//! protocol channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::scheduler::{SchedulerTuning, TeamConfig, TeamScheduler};
use crate::tmux::TmuxAdapter;

pub async fn execute() -> i32 {
    let mut input = String::new();
    if let Err(e) = tokio::io::stdin().read_to_string(&mut input).await {
        eprintln!("omc-team run: could not read stdin: {}", e);
        return 1;
    }

    let config: TeamConfig = match serde_json::from_str(input.trim()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("omc-team run: invalid start request: {}", e);
            return 1;
        }
    };

    let mux = Arc::new(TmuxAdapter::new());
    let scheduler =
        match TeamScheduler::start(config, mux, SchedulerTuning::default()).await {
            Ok(scheduler) => scheduler,
            Err(e) => {
                eprintln!("omc-team run: startup failed: {:#}", e);
                return 1;
            }
        };

    // SIGINT/SIGTERM trigger the graceful shutdown sequence; the run
    // loop notices the flag on its next tick.
    let shutdown_flag = scheduler.shutdown_handle();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("signal received, shutting down");
        shutdown_flag.store(true, Ordering::SeqCst);
    });

    let summary = match scheduler.run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "scheduler run failed");
            eprintln!("omc-team run: {:#}", e);
            return 1;
        }
    };

    match serde_json::to_string(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("omc-team run: could not serialize summary: {}", e);
            return 1;
        }
    }

    if summary.succeeded() {
        0
    } else {
        1
    }
}
