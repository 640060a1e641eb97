//! Interactive prompt.
//!
//! The prompt reads stdin on a dedicated thread and forwards parsed commands to
//! the controller; it never touches the engine directly. The prompt text binds
//! to the run-state signal so the user can see when launching is blocked.

use crate::cli::OutputLine;
use crate::engine::LaunchEngine;
use crate::model::{LaunchEvent, RunState};
use crate::orchestrator::{self, ControllerCtx, ControllerReport, UiCommand};
use anyhow::Result;
use std::io::BufRead;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

const HELP: &[&str] = &[
    "Commands:",
    "  list            show registered programs",
    "  run <n>         run program #n with its documents swapped in",
    "  test <n>        start program #n without swapping documents",
    "  status          show whether a program is running",
    "  history [n]     show the last n runs (default 10)",
    "  help            show this help",
    "  quit            exit (waits for a running program to finish)",
];

#[derive(Debug, Clone)]
enum ShellInput {
    Command(UiCommand),
    Help,
}

/// Parse one prompt line. `Ok(None)` means a blank line.
fn parse_line(line: &str) -> Result<Option<ShellInput>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let number = |what: &str| -> Result<usize, String> {
        arg.ok_or_else(|| format!("usage: {what} <n>"))?
            .parse::<usize>()
            .map_err(|_| format!("usage: {what} <n>"))
    };

    let input = match verb.to_ascii_lowercase().as_str() {
        "list" | "ls" => ShellInput::Command(UiCommand::List),
        "run" | "r" => ShellInput::Command(UiCommand::Launch(number("run")?)),
        "test" => ShellInput::Command(UiCommand::TestRun(number("test")?)),
        "status" => ShellInput::Command(UiCommand::Status),
        "history" => {
            let limit = match arg {
                Some(a) => a.parse().map_err(|_| "usage: history [n]".to_string())?,
                None => 10,
            };
            ShellInput::Command(UiCommand::History(limit))
        }
        "help" | "?" => ShellInput::Help,
        "quit" | "exit" | "q" => ShellInput::Command(UiCommand::Quit),
        other => return Err(format!("unknown command `{other}`; try `help`")),
    };
    Ok(Some(input))
}

fn prompt_for(state: RunState) -> String {
    match state {
        RunState::Idle => "docswap> ".to_string(),
        other => format!("docswap [{}]> ", other.label()),
    }
}

/// Run the interactive prompt until the user quits and no program is running.
pub(crate) async fn run(
    engine: LaunchEngine,
    event_rx: UnboundedReceiver<LaunchEvent>,
    ctx: ControllerCtx,
) -> Result<ControllerReport> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let state_rx = engine.gate().subscribe();
    let out = ctx.out.clone();

    for line in HELP {
        let _ = out.send(OutputLine::Stdout((*line).to_string()));
    }

    // Blocking stdin reads stay off the runtime. The thread is not joined: it may
    // be parked in read_line when the controller finishes.
    std::thread::spawn(move || run_threaded(state_rx, out, cmd_tx));

    orchestrator::run_controller(engine, event_rx, ctx, cmd_rx).await
}

fn run_threaded(
    state_rx: watch::Receiver<RunState>,
    out: UnboundedSender<OutputLine>,
    cmd_tx: UnboundedSender<UiCommand>,
) {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        let state = *state_rx.borrow();
        let _ = out.send(OutputLine::Prompt(prompt_for(state)));

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "stdin read failed");
                let _ = cmd_tx.send(UiCommand::Quit);
                return;
            }
            None => {
                let _ = cmd_tx.send(UiCommand::Quit);
                return;
            }
        };

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ShellInput::Help)) => {
                for l in HELP {
                    let _ = out.send(OutputLine::Stdout((*l).to_string()));
                }
            }
            Ok(Some(ShellInput::Command(cmd))) => {
                let quitting = matches!(cmd, UiCommand::Quit);
                if cmd_tx.send(cmd).is_err() || quitting {
                    return;
                }
            }
            Err(msg) => {
                let _ = out.send(OutputLine::Stderr(msg));
            }
        }
    }
}
