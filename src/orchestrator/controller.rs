//! Run lifecycle controller.
//!
//! Owns the launch engine and is the single place where engine events are
//! turned into user-visible output. The engine's exit path runs on a worker
//! thread and only ever sends `LaunchEvent`s here; all presentation state
//! changes happen on this task.

use crate::cli::OutputLine;
use crate::engine::{EngineError, LaunchEngine};
use crate::model::{LaunchEvent, Registry};
use crate::{storage, text_summary};
use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    /// Run the entry at this 1-based position.
    Launch(usize),
    /// Start the entry's program without swapping documents.
    TestRun(usize),
    List,
    Status,
    History(usize),
    Quit,
}

/// Everything the controller needs besides the engine.
pub(crate) struct ControllerCtx {
    pub registry: Registry,
    pub history_dir: Option<PathBuf>,
    pub out: UnboundedSender<OutputLine>,
}

/// What happened while the controller was running; used for the process exit code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControllerReport {
    pub errors: usize,
    pub warnings: usize,
    pub completed_runs: usize,
}

impl ControllerCtx {
    fn say(&self, msg: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stdout(msg.into()));
    }

    fn warn(&self, msg: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(msg.into()));
    }
}

/// Serve UI commands until `Quit` (or the command channel closes) and no launch cycle is in flight.
pub(crate) async fn run_controller(
    engine: LaunchEngine,
    mut event_rx: UnboundedReceiver<LaunchEvent>,
    ctx: ControllerCtx,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<ControllerReport> {
    let mut report = ControllerReport::default();
    // Quit never cancels a running program; it waits for the cycle to finish.
    let mut quit_pending = false;
    let mut commands_open = true;
    // Set from an admitted launch until its `Finished` event has been handled.
    let mut in_flight = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(UiCommand::Launch(n)) => {
                        let Some(entry) = ctx.registry.get(n).cloned() else {
                            ctx.warn(format!("No program #{n}"));
                            report.errors += 1;
                            continue;
                        };
                        match engine.launch(entry).await {
                            Ok(_) => in_flight = true,
                            Err(e) => {
                                report_engine_error(&ctx, &e);
                                report.errors += 1;
                            }
                        }
                    }
                    Some(UiCommand::TestRun(n)) => {
                        let Some(entry) = ctx.registry.get(n) else {
                            ctx.warn(format!("No program #{n}"));
                            report.errors += 1;
                            continue;
                        };
                        match engine.test_run(entry) {
                            Ok(pid) => ctx.say(format!(
                                "Test run of {} started{}",
                                entry.name,
                                pid.map(|p| format!(" (pid {p})")).unwrap_or_default()
                            )),
                            Err(e) => {
                                ctx.warn(format!("Test run failed: {e}"));
                                report.errors += 1;
                            }
                        }
                    }
                    Some(UiCommand::List) => {
                        for line in text_summary::registry_lines(&ctx.registry, engine.shared_doc_dir()) {
                            ctx.say(line);
                        }
                    }
                    Some(UiCommand::Status) => {
                        ctx.say(format!("State: {}", engine.gate().state().label()));
                    }
                    Some(UiCommand::History(limit)) => show_history(&ctx, limit),
                    Some(UiCommand::Quit) | None => {
                        commands_open = false;
                        if !in_flight {
                            break;
                        }
                        quit_pending = true;
                        ctx.say("Waiting for the running program to exit…");
                    }
                }
            }
            Some(ev) = event_rx.recv() => {
                if handle_event(&ctx, &mut report, ev) {
                    in_flight = false;
                    if quit_pending {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if !in_flight {
                    break;
                }
                ctx.warn("A program is still running; its documents will be moved back when it exits.");
            }
        }
    }

    // Events from failed launches can still be queued.
    while let Ok(ev) = event_rx.try_recv() {
        handle_event(&ctx, &mut report, ev);
    }
    Ok(report)
}

/// Print and account for one engine event. Returns true for `Finished`.
fn handle_event(ctx: &ControllerCtx, report: &mut ControllerReport, ev: LaunchEvent) -> bool {
    if let Some(msg) = ev.to_message() {
        match ev {
            LaunchEvent::Warning(_) => ctx.warn(msg),
            _ => ctx.say(msg),
        }
    }
    match ev {
        LaunchEvent::Warning(_) => report.warnings += 1,
        LaunchEvent::StateChanged(state) => {
            tracing::debug!(state = state.label(), "run state changed");
        }
        LaunchEvent::Finished { record } => {
            report.completed_runs += 1;
            if let Some(dir) = ctx.history_dir.as_deref() {
                if let Err(e) = storage::save_run(dir, &record) {
                    tracing::warn!(error = %e, "could not save run record");
                }
            }
            return true;
        }
        _ => {}
    }
    false
}

fn report_engine_error(ctx: &ControllerCtx, e: &EngineError) {
    match e {
        EngineError::AlreadyRunning => ctx.warn("Another program is already running; wait for it to exit."),
        _ => ctx.warn(format!("Error: {e}")),
    }
}

fn show_history(ctx: &ControllerCtx, limit: usize) {
    let Some(dir) = ctx.history_dir.as_deref() else {
        ctx.say("Run history is disabled.");
        return;
    };
    match storage::load_recent(dir, limit) {
        Ok(records) if records.is_empty() => ctx.say("No runs recorded yet."),
        Ok(records) => {
            for line in text_summary::history_lines(&records) {
                ctx.say(line);
            }
        }
        Err(e) => ctx.warn(format!("Could not read history: {e:#}")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::ProgramEntry;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collect(mut rx: UnboundedReceiver<OutputLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            match line {
                OutputLine::Stdout(s) | OutputLine::Stderr(s) => lines.push(s),
                OutputLine::Prompt(_) => {}
            }
        }
        lines
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quit_waits_for_the_cycle_and_records_history() {
        let tmp = tempfile::TempDir::new().unwrap();
        let shared = tmp.path().join("S");
        let private = tmp.path().join("P");
        fs::create_dir_all(&shared).unwrap();
        fs::create_dir_all(&private).unwrap();
        fs::write(private.join("f.txt"), "x").unwrap();

        let exe = tmp.path().join("nap.sh");
        fs::write(&exe, "#!/bin/sh\nsleep 0.3\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let registry = Registry {
            shared_doc_dir: None,
            programs: vec![ProgramEntry {
                name: "nap".into(),
                executable_path: exe,
                private_doc_path: private.clone(),
            }],
        };
        let history = tmp.path().join("history");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(shared.clone(), event_tx);
        let ctx = ControllerCtx {
            registry,
            history_dir: Some(history.clone()),
            out: out_tx,
        };

        cmd_tx.send(UiCommand::Launch(1)).unwrap();
        cmd_tx.send(UiCommand::Launch(1)).unwrap();
        cmd_tx.send(UiCommand::Launch(7)).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();

        let report = tokio::time::timeout(
            Duration::from_secs(20),
            run_controller(engine, event_rx, ctx, cmd_rx),
        )
        .await
        .expect("controller did not stop")
        .unwrap();

        assert_eq!(report.completed_runs, 1);
        // Second launch refused, #7 does not exist.
        assert_eq!(report.errors, 2);
        assert_eq!(report.warnings, 0);
        assert!(private.join("f.txt").exists());
        assert_eq!(storage::load_recent(&history, 10).unwrap().len(), 1);

        let lines = collect(out_rx);
        assert!(lines.iter().any(|l| l.contains("already running")));
        assert!(lines.iter().any(|l| l.contains("No program #7")));
        assert!(lines.iter().any(|l| l.starts_with("nap finished")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quit_after_the_gate_went_idle_still_reports_the_warning() {
        let tmp = tempfile::TempDir::new().unwrap();
        let shared = tmp.path().join("S");
        let private = tmp.path().join("P");
        fs::create_dir_all(&shared).unwrap();
        fs::create_dir_all(&private).unwrap();
        fs::write(private.join("f.txt"), "x").unwrap();

        // Replaces its private folder with a file, so the move back fails.
        let exe = tmp.path().join("clobber.sh");
        fs::write(
            &exe,
            format!("#!/bin/sh\nrm -rf '{p}'; echo x > '{p}'\n", p = private.display()),
        )
        .unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let registry = Registry {
            shared_doc_dir: None,
            programs: vec![ProgramEntry {
                name: "clobber".into(),
                executable_path: exe,
                private_doc_path: private.clone(),
            }],
        };
        let history = tmp.path().join("history");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(shared.clone(), event_tx);
        let gate = engine.gate().clone();
        let ctx = ControllerCtx {
            registry,
            history_dir: Some(history.clone()),
            out: out_tx,
        };
        let controller = tokio::spawn(run_controller(engine, event_rx, ctx, cmd_rx));

        cmd_tx.send(UiCommand::Launch(1)).unwrap();
        tokio::time::timeout(Duration::from_secs(20), async {
            while !(private.is_file() && gate.is_idle()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("cycle did not finish");
        cmd_tx.send(UiCommand::Quit).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(20), controller)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(report.warnings, 1);
        assert_eq!(report.completed_runs, 1);
        assert_eq!(storage::load_recent(&history, 10).unwrap().len(), 1);
        let lines = collect(out_rx);
        assert!(lines.iter().any(|l| l.starts_with("Warning:")));
    }

    #[tokio::test]
    async fn closed_command_channel_stops_an_idle_controller() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(tmp.path().to_path_buf(), event_tx);
        let ctx = ControllerCtx {
            registry: Registry::default(),
            history_dir: None,
            out: out_tx,
        };

        cmd_tx.send(UiCommand::Status).unwrap();
        cmd_tx.send(UiCommand::History(5)).unwrap();
        drop(cmd_tx);

        let report = run_controller(engine, event_rx, ctx, cmd_rx).await.unwrap();
        assert_eq!(report, ControllerReport::default());
        let lines = collect(out_rx);
        assert_eq!(lines, vec!["State: idle", "Run history is disabled."]);
    }
}
