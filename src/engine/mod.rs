mod gate;
mod process;
mod swap;

pub use gate::{RunPermit, RunStateController};
pub use process::{LaunchError, ProcessLauncher};
pub use swap::{DirectorySwapper, SwapError, SwapOutcome};

use crate::model::{LaunchEvent, ProgramEntry, RunRecord, RunState};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures surfaced to the presentation layer. None of them are retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("another program is already running")]
    AlreadyRunning,

    #[error("could not move the documents of {name} into place: {source}")]
    SwapInFailed {
        name: String,
        #[source]
        source: SwapError,
    },

    #[error("could not start {name}: {source}{}", restore_note(.restore))]
    LaunchFailed {
        name: String,
        #[source]
        source: LaunchError,
        /// Set when moving the documents back out also failed.
        restore: Option<SwapError>,
    },

    #[error("{name} finished but its documents could not be moved back: {source}")]
    SwapOutFailed {
        name: String,
        #[source]
        source: SwapError,
    },
}

fn restore_note(restore: &Option<SwapError>) -> String {
    match restore {
        Some(e) => format!(" (restoring documents also failed: {e})"),
        None => String::new(),
    }
}

/// Drives the swap-in, launch, await-exit, swap-out cycle.
pub struct LaunchEngine {
    shared_doc_dir: PathBuf,
    swapper: DirectorySwapper,
    launcher: ProcessLauncher,
    gate: RunStateController,
    event_tx: mpsc::UnboundedSender<LaunchEvent>,
}

impl LaunchEngine {
    pub fn new(shared_doc_dir: PathBuf, event_tx: mpsc::UnboundedSender<LaunchEvent>) -> Self {
        Self {
            shared_doc_dir,
            swapper: DirectorySwapper::new(),
            launcher: ProcessLauncher::new(),
            gate: RunStateController::new(),
            event_tx,
        }
    }

    pub fn gate(&self) -> &RunStateController {
        &self.gate
    }

    pub fn shared_doc_dir(&self) -> &Path {
        &self.shared_doc_dir
    }

    /// Start one launch cycle for `entry`.
    ///
    /// Returns as soon as the program is running (with its pid, where known).
    /// The rest of the cycle happens in the background and is reported through
    /// [`LaunchEvent`]s, ending with `Finished` once the gate is idle again.
    pub async fn launch(&self, entry: ProgramEntry) -> Result<Option<u32>, EngineError> {
        let permit = self
            .gate
            .try_acquire()
            .ok_or(EngineError::AlreadyRunning)?;
        self.emit(LaunchEvent::StateChanged(RunState::SwappingIn));
        tracing::info!(name = %entry.name, exe = %entry.executable_path.display(), "launch requested");

        let started_at = Instant::now();
        let timestamp_utc = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());

        let swapped_in = match self
            .swap(&entry.private_doc_path, &self.shared_doc_dir)
            .await
        {
            Ok(outcome) => outcome,
            Err(source) => {
                tracing::error!(name = %entry.name, error = %source, "swap-in failed; aborting launch");
                self.release(permit);
                return Err(EngineError::SwapInFailed {
                    name: entry.name,
                    source,
                });
            }
        };

        let handle = match self.launcher.start(&entry.executable_path) {
            Ok(handle) => handle,
            Err(source) => {
                // Only undo a move that happened; otherwise the shared location is not ours.
                let restore = if swapped_in.moved() {
                    tracing::error!(name = %entry.name, error = %source, "launch failed; restoring documents");
                    self.swap(&self.shared_doc_dir, &entry.private_doc_path)
                        .await
                        .err()
                } else {
                    tracing::error!(name = %entry.name, error = %source, "launch failed");
                    None
                };
                self.release(permit);
                return Err(EngineError::LaunchFailed {
                    name: entry.name,
                    source,
                    restore,
                });
            }
        };

        let pid = handle.pid();
        permit.advance(RunState::Running);
        self.emit(LaunchEvent::StateChanged(RunState::Running));
        self.emit(LaunchEvent::Started {
            name: entry.name.clone(),
            pid,
        });

        let swapper = self.swapper;
        let shared = self.shared_doc_dir.clone();
        let event_tx = self.event_tx.clone();
        self.launcher.on_exit(handle, move |outcome| {
            let _ = event_tx.send(LaunchEvent::Exited {
                name: entry.name.clone(),
                outcome: outcome.clone(),
            });

            permit.advance(RunState::SwappingOut);
            let _ = event_tx.send(LaunchEvent::StateChanged(RunState::SwappingOut));

            let warning = match swapper.move_tree(&shared, &entry.private_doc_path) {
                Ok(_) => None,
                Err(source) => {
                    let err = EngineError::SwapOutFailed {
                        name: entry.name.clone(),
                        source,
                    };
                    tracing::warn!(error = %err, "documents left in shared location");
                    let msg = err.to_string();
                    let _ = event_tx.send(LaunchEvent::Warning(msg.clone()));
                    Some(msg)
                }
            };

            permit.release();
            let _ = event_tx.send(LaunchEvent::StateChanged(RunState::Idle));

            let record = RunRecord {
                timestamp_utc,
                name: entry.name,
                executable_path: entry.executable_path,
                exit: outcome,
                duration: started_at.elapsed(),
                warning,
            };
            let _ = event_tx.send(LaunchEvent::Finished {
                record: Box::new(record),
            });
        });

        Ok(pid)
    }

    /// Start the program of `entry` outside a launch cycle: no swap, no tracking.
    pub fn test_run(&self, entry: &ProgramEntry) -> Result<Option<u32>, LaunchError> {
        self.launcher.start_detached(&entry.executable_path)
    }

    async fn swap(&self, from: &Path, to: &Path) -> Result<SwapOutcome, SwapError> {
        let swapper = self.swapper;
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        tokio::task::spawn_blocking(move || swapper.move_tree(&from, &to))
            .await
            .unwrap_or_else(|e| Err(SwapError::Aborted(e.to_string())))
    }

    fn release(&self, permit: RunPermit) {
        permit.release();
        self.emit(LaunchEvent::StateChanged(RunState::Idle));
    }

    fn emit(&self, ev: LaunchEvent) {
        let _ = self.event_tx.send(ev);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::ExitOutcome;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        private: PathBuf,
        shared: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let private = tmp.path().join("P");
            let shared = tmp.path().join("S");
            fs::create_dir_all(&shared).unwrap();
            Self {
                tmp,
                private,
                shared,
            }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.tmp.path().join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// A program that keeps running until `release()` is called.
        fn blocking_program(&self) -> PathBuf {
            let flag = self.tmp.path().join("release");
            self.script(
                "wait.sh",
                &format!(
                    "while [ ! -e '{}' ]; do sleep 0.05; done",
                    flag.display()
                ),
            )
        }

        fn release(&self) {
            fs::write(self.tmp.path().join("release"), "").unwrap();
        }

        fn entry(&self, exe: PathBuf) -> ProgramEntry {
            ProgramEntry {
                name: "notepad".into(),
                executable_path: exe,
                private_doc_path: self.private.clone(),
            }
        }
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut v: Vec<String> = fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        v.sort();
        v
    }

    async fn wait_finished(
        rx: &mut mpsc::UnboundedReceiver<LaunchEvent>,
    ) -> (Vec<LaunchEvent>, RunRecord) {
        let mut seen = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                .await
                .expect("launch cycle did not finish in time")
                .expect("engine dropped event channel");
            if let LaunchEvent::Finished { record } = ev {
                return (seen, *record);
            }
            seen.push(ev);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn documents_are_swapped_in_for_the_run_and_back_out_after() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.private).unwrap();
        fs::write(fx.private.join("f.txt"), "notes").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        assert!(engine.gate().is_idle());

        let exe = fx.blocking_program();
        engine.launch(fx.entry(exe)).await.unwrap();

        assert_eq!(engine.gate().state(), RunState::Running);
        assert_eq!(names(&fx.shared), vec!["f.txt"]);
        assert!(names(&fx.private).is_empty());

        fx.release();
        let (events, record) = wait_finished(&mut rx).await;

        assert!(engine.gate().is_idle());
        assert_eq!(names(&fx.private), vec!["f.txt"]);
        assert!(names(&fx.shared).is_empty());
        assert_eq!(fs::read_to_string(fx.private.join("f.txt")).unwrap(), "notes");
        assert_eq!(record.exit, ExitOutcome::Exited(0));
        assert!(record.warning.is_none());
        assert!(events
            .iter()
            .any(|e| matches!(e, LaunchEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(LaunchEvent::StateChanged(RunState::Idle))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_launch_while_running_is_refused_without_touching_files() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.private).unwrap();
        fs::write(fx.private.join("f.txt"), "notes").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let exe = fx.blocking_program();
        engine.launch(fx.entry(exe.clone())).await.unwrap();

        let other_private = fx.tmp.path().join("Q");
        fs::create_dir_all(&other_private).unwrap();
        fs::write(other_private.join("other.txt"), "other").unwrap();
        let other = ProgramEntry {
            name: "other".into(),
            executable_path: exe,
            private_doc_path: other_private.clone(),
        };

        let err = engine.launch(other).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
        assert_eq!(names(&fx.shared), vec!["f.txt"]);
        assert_eq!(names(&other_private), vec!["other.txt"]);
        assert_eq!(engine.gate().state(), RunState::Running);

        fx.release();
        wait_finished(&mut rx).await;
        assert!(engine.gate().is_idle());
        assert_eq!(names(&fx.private), vec!["f.txt"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_executable_restores_layout() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.private).unwrap();
        fs::write(fx.private.join("f.txt"), "notes").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let err = engine
            .launch(fx.entry(fx.tmp.path().join("missing.exe")))
            .await
            .unwrap_err();

        match err {
            EngineError::LaunchFailed {
                source, restore, ..
            } => {
                assert!(matches!(source, LaunchError::ExecutableNotFound(_)));
                assert!(restore.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(engine.gate().is_idle());
        assert_eq!(names(&fx.private), vec!["f.txt"]);
        assert!(names(&fx.shared).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_executable_leaves_unmoved_shared_data_alone() {
        let fx = Fixture::new();
        fs::write(fx.shared.join("existing.txt"), "shared").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let err = engine
            .launch(fx.entry(fx.tmp.path().join("missing.exe")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::LaunchFailed { restore: None, .. }
        ));
        assert!(engine.gate().is_idle());
        assert_eq!(names(&fx.shared), vec!["existing.txt"]);
        assert!(!fx.private.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_executable_with_empty_private_folder_keeps_shared_data() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.private).unwrap();
        fs::write(fx.shared.join("existing.txt"), "shared").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        engine
            .launch(fx.entry(fx.tmp.path().join("missing.exe")))
            .await
            .unwrap_err();

        assert_eq!(names(&fx.shared), vec!["existing.txt"]);
        assert!(names(&fx.private).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_private_folder_is_created_on_swap_out() {
        let fx = Fixture::new();
        fs::write(fx.shared.join("existing.txt"), "shared").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let exe = fx.script("quick.sh", "exit 0");
        engine.launch(fx.entry(exe)).await.unwrap();

        wait_finished(&mut rx).await;
        assert!(engine.gate().is_idle());
        assert_eq!(names(&fx.private), vec!["existing.txt"]);
        assert!(names(&fx.shared).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn swap_in_failure_never_starts_the_program() {
        let fx = Fixture::new();
        fs::write(&fx.private, "a file, not a folder").unwrap();
        let marker = fx.tmp.path().join("ran");
        let exe = fx.script("mark.sh", &format!("touch '{}'", marker.display()));

        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let err = engine.launch(fx.entry(exe)).await.unwrap_err();

        assert!(matches!(err, EngineError::SwapInFailed { .. }));
        assert!(engine.gate().is_idle());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn swap_out_failure_is_a_warning_and_still_releases() {
        let fx = Fixture::new();
        fs::create_dir_all(&fx.private).unwrap();
        fs::write(fx.private.join("f.txt"), "notes").unwrap();
        // The program replaces its private folder with a file, so the move back cannot happen.
        let exe = fx.script(
            "clobber.sh",
            &format!(
                "rm -rf '{p}'; echo x > '{p}'; exit 3",
                p = fx.private.display()
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        engine.launch(fx.entry(exe)).await.unwrap();

        let (events, record) = wait_finished(&mut rx).await;
        assert!(engine.gate().is_idle());
        assert_eq!(record.exit, ExitOutcome::Exited(3));
        assert!(record.warning.is_some());
        assert!(events.iter().any(|e| matches!(e, LaunchEvent::Warning(_))));
        // Data stays in the shared location for manual recovery.
        assert_eq!(names(&fx.shared), vec!["f.txt"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gate_is_reusable_after_a_completed_cycle() {
        let fx = Fixture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LaunchEngine::new(fx.shared.clone(), tx);
        let exe = fx.script("quick.sh", "exit 0");

        for _ in 0..2 {
            engine.launch(fx.entry(exe.clone())).await.unwrap();
            wait_finished(&mut rx).await;
            assert!(engine.gate().is_idle());
        }
    }
}
