use crate::engine::LaunchEngine;
use crate::model::{LaunchEvent, ProgramEntry, Registry};
use crate::orchestrator::{self, ControllerCtx, ControllerReport, UiCommand};
use crate::{storage, text_summary, validation};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Written to stdout without a trailing newline, then flushed.
    Prompt(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        // Lock per line: tracing and the confirmation prompt also write to these streams.
        let mut out = std::io::stdout();
        let mut err = std::io::stderr();

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
                OutputLine::Prompt(msg) => {
                    let _ = write!(out, "{}", msg);
                    let _ = out.flush();
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "docswap",
    version,
    about = "Launch programs with their own documents folder swapped into place"
)]
pub struct Cli {
    /// Registry file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub registry: Option<PathBuf>,

    /// Shared documents location programs read and write while running
    #[arg(long, global = true)]
    pub shared_dir: Option<PathBuf>,

    /// Directory for run history records
    #[arg(long, global = true)]
    pub history_dir: Option<PathBuf>,

    /// Do not record run history
    #[arg(long, global = true)]
    pub no_history: bool,

    /// Increase diagnostic logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List registered programs
    List,
    /// Register a program
    Add {
        /// Display name (defaults to "Program <n>")
        #[arg(long)]
        name: Option<String>,
        /// Path to the executable
        #[arg(long)]
        exe: PathBuf,
        /// Private documents folder for this program
        #[arg(long)]
        doc: PathBuf,
    },
    /// Change a registered program
    Edit {
        /// Position shown by `list`
        number: usize,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        exe: Option<PathBuf>,
        #[arg(long)]
        doc: Option<PathBuf>,
    },
    /// Remove a registered program
    Remove {
        number: usize,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Persist the shared documents location in the registry
    SetShared { path: PathBuf },
    /// Start a program without swapping documents
    TestRun { number: usize },
    /// Run a program with its documents swapped in, and wait for it to exit
    Run { number: usize },
    /// Show recent runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Interactive prompt (default)
    Shell,
}

/// Paths resolved from arguments, registry and platform defaults.
struct Resolved {
    registry_path: PathBuf,
    registry: Registry,
    shared_doc_dir: PathBuf,
    history_dir: Option<PathBuf>,
}

fn resolve(args: &Cli) -> Result<Resolved> {
    let registry_path = match args.registry.clone() {
        Some(p) => p,
        None => storage::default_registry_path()?,
    };
    let registry = storage::load_registry(&registry_path)
        .with_context(|| format!("load registry {}", registry_path.display()))?;
    let shared_doc_dir = args
        .shared_dir
        .clone()
        .or_else(|| registry.shared_doc_dir.clone())
        .or_else(dirs::document_dir)
        .context("no shared documents location; pass --shared-dir")?;
    let history_dir = if args.no_history {
        None
    } else {
        match args.history_dir.clone() {
            Some(p) => Some(p),
            None => storage::default_history_dir().ok(),
        }
    };
    tracing::debug!(
        registry = %registry_path.display(),
        shared = %shared_doc_dir.display(),
        "resolved locations"
    );
    Ok(Resolved {
        registry_path,
        registry,
        shared_doc_dir,
        history_dir,
    })
}

pub async fn run(args: Cli) -> Result<()> {
    let resolved = resolve(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();

    let command = args.command.unwrap_or(Command::Shell);
    let res = dispatch(command, resolved, &out_tx).await;

    // Flush everything queued before reporting the result.
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn dispatch(
    command: Command,
    resolved: Resolved,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    match command {
        Command::List => {
            for line in text_summary::registry_lines(&resolved.registry, &resolved.shared_doc_dir)
            {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
            Ok(())
        }
        Command::Add { name, exe, doc } => {
            let mut registry = resolved.registry;
            let entry = ProgramEntry {
                name: name.unwrap_or_else(|| registry.next_default_name()),
                executable_path: exe,
                private_doc_path: doc,
            };
            validation::validate_entry(&entry, &resolved.shared_doc_dir)?;
            let msg = format!("Added #{}: {}", registry.programs.len() + 1, entry.name);
            registry.programs.push(entry);
            storage::save_registry(&resolved.registry_path, &registry)?;
            let _ = out_tx.send(OutputLine::Stdout(msg));
            Ok(())
        }
        Command::Edit {
            number,
            name,
            exe,
            doc,
        } => {
            let mut registry = resolved.registry;
            let current = registry
                .get(number)
                .cloned()
                .with_context(|| format!("no program #{number}"))?;
            let updated = ProgramEntry {
                name: name.unwrap_or(current.name),
                executable_path: exe.unwrap_or(current.executable_path),
                private_doc_path: doc.unwrap_or(current.private_doc_path),
            };
            validation::validate_entry(&updated, &resolved.shared_doc_dir)?;
            let msg = format!("Saved #{number}: {}", updated.name);
            if let Some(slot) = registry.get_mut(number) {
                *slot = updated;
            }
            storage::save_registry(&resolved.registry_path, &registry)?;
            let _ = out_tx.send(OutputLine::Stdout(msg));
            Ok(())
        }
        Command::Remove { number, yes } => {
            let mut registry = resolved.registry;
            let name = registry
                .get(number)
                .map(|e| e.name.clone())
                .with_context(|| format!("no program #{number}"))?;
            if yes || confirm(&format!("Remove #{number} ({name})?"))? {
                registry.remove(number);
                storage::save_registry(&resolved.registry_path, &registry)?;
                let _ = out_tx.send(OutputLine::Stdout(format!("Removed {name}")));
            }
            Ok(())
        }
        Command::SetShared { path } => {
            let mut registry = resolved.registry;
            let msg = format!("Shared documents location: {}", path.display());
            registry.shared_doc_dir = Some(path);
            storage::save_registry(&resolved.registry_path, &registry)?;
            let _ = out_tx.send(OutputLine::Stdout(msg));
            Ok(())
        }
        Command::History { limit } => match resolved.history_dir.as_deref() {
            Some(dir) => {
                let records = storage::load_recent(dir, limit)?;
                for line in text_summary::history_lines(&records) {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
                Ok(())
            }
            None => Err(anyhow::anyhow!("run history is disabled")),
        },
        Command::TestRun { number } => {
            run_commands(resolved, out_tx.clone(), vec![UiCommand::TestRun(number)])
                .await
                .and_then(check_report)
        }
        Command::Run { number } => {
            run_commands(resolved, out_tx.clone(), vec![UiCommand::Launch(number)])
                .await
                .and_then(check_report)
        }
        Command::Shell => {
            let (engine, event_rx, ctx) = build_controller(resolved, out_tx.clone());
            crate::shell::run(engine, event_rx, ctx).await.map(|_| ())
        }
    }
}

fn build_controller(
    resolved: Resolved,
    out: mpsc::UnboundedSender<OutputLine>,
) -> (
    LaunchEngine,
    mpsc::UnboundedReceiver<LaunchEvent>,
    ControllerCtx,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<LaunchEvent>();
    let engine = LaunchEngine::new(resolved.shared_doc_dir, event_tx);
    let ctx = ControllerCtx {
        registry: resolved.registry,
        history_dir: resolved.history_dir,
        out,
    };
    (engine, event_rx, ctx)
}

/// Feed a fixed list of commands to the controller and wait for it to wind down.
async fn run_commands(
    resolved: Resolved,
    out: mpsc::UnboundedSender<OutputLine>,
    commands: Vec<UiCommand>,
) -> Result<ControllerReport> {
    let (engine, event_rx, ctx) = build_controller(resolved, out);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    for cmd in commands {
        let _ = cmd_tx.send(cmd);
    }
    let _ = cmd_tx.send(UiCommand::Quit);
    orchestrator::run_controller(engine, event_rx, ctx, cmd_rx).await
}

fn check_report(report: ControllerReport) -> Result<()> {
    if report.errors > 0 {
        anyhow::bail!("launch failed");
    }
    if report.warnings > 0 {
        anyhow::bail!("documents could not be moved back; see the warning above");
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{question} [y/N] ")?;
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
