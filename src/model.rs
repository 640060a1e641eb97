use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One program the user registered, with the folder that holds its documents while it is not running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEntry {
    pub name: String,
    pub executable_path: PathBuf,
    pub private_doc_path: PathBuf,
}

/// On-disk registry: ordered entries plus the persisted shared location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub shared_doc_dir: Option<PathBuf>,
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
}

impl Registry {
    /// Look up an entry by its 1-based position, as shown to the user.
    pub fn get(&self, number: usize) -> Option<&ProgramEntry> {
        number.checked_sub(1).and_then(|i| self.programs.get(i))
    }

    pub fn get_mut(&mut self, number: usize) -> Option<&mut ProgramEntry> {
        number.checked_sub(1).and_then(move |i| self.programs.get_mut(i))
    }

    /// Remove an entry by its 1-based position.
    pub fn remove(&mut self, number: usize) -> Option<ProgramEntry> {
        let idx = number.checked_sub(1)?;
        if idx < self.programs.len() {
            Some(self.programs.remove(idx))
        } else {
            None
        }
    }

    /// Default display name for a freshly added entry.
    pub fn next_default_name(&self) -> String {
        format!("Program {}", self.programs.len() + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    SwappingIn,
    Running,
    SwappingOut,
}

impl RunState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::SwappingIn => 1,
            RunState::Running => 2,
            RunState::SwappingOut => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::SwappingIn,
            2 => RunState::Running,
            3 => RunState::SwappingOut,
            _ => RunState::Idle,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::SwappingIn => "swapping in",
            RunState::Running => "running",
            RunState::SwappingOut => "swapping out",
        }
    }
}

/// How a launched process ended. Reported, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOutcome {
    Exited(i32),
    /// Abnormal termination; carries the signal number where the platform reports one.
    Terminated(Option<i32>),
    WaitFailed(String),
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {code}"),
            ExitOutcome::Terminated(Some(sig)) => write!(f, "terminated by signal {sig}"),
            ExitOutcome::Terminated(None) => write!(f, "terminated abnormally"),
            ExitOutcome::WaitFailed(msg) => write!(f, "exit status unavailable ({msg})"),
        }
    }
}

/// A completed launch cycle, as kept in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp_utc: String,
    pub name: String,
    pub executable_path: PathBuf,
    pub exit: ExitOutcome,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Set when the documents could not be moved back after the run.
    #[serde(default)]
    pub warning: Option<String>,
}

/// Events emitted by the launch engine and consumed by the controlling context.
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    StateChanged(RunState),
    Started {
        name: String,
        pid: Option<u32>,
    },
    Exited {
        name: String,
        outcome: ExitOutcome,
    },
    /// Non-fatal problem the user needs to see (documents left in the shared location).
    Warning(String),
    Finished {
        // Box to keep LaunchEvent small.
        record: Box<RunRecord>,
    },
}

impl LaunchEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> Option<String> {
        match self {
            LaunchEvent::StateChanged(_) => None,
            LaunchEvent::Started { name, pid } => Some(match pid {
                Some(pid) => format!("Started {name} (pid {pid})"),
                None => format!("Started {name}"),
            }),
            LaunchEvent::Exited { name, outcome } => Some(format!("{name} finished: {outcome}")),
            LaunchEvent::Warning(msg) => Some(format!("Warning: {msg}")),
            LaunchEvent::Finished { record } => Some(format!(
                "{} ran for {}",
                record.name,
                humantime::format_duration(round_to_secs(record.duration))
            )),
        }
    }
}

fn round_to_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
