//! Directory relocation used to bracket a launch.
//!
//! A move is a plain rename whenever source and destination live on the same
//! filesystem. Crossing a device boundary (or merging into a destination that
//! already holds data) falls back to copy-then-delete, and the source is only
//! deleted after every entry has been copied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// What a successful move actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Source missing or empty, destination holds nothing either.
    NothingToMove,
    /// Source missing or empty and destination already holds the data.
    AlreadySwapped,
    Renamed,
    Copied { files: usize },
}

impl SwapOutcome {
    /// Whether data actually changed location.
    pub fn moved(self) -> bool {
        matches!(self, SwapOutcome::Renamed | SwapOutcome::Copied { .. })
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("cannot inspect {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} exists but is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("cannot move {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "copy interrupted at {}; last copied: {}; everything is still in {}: {source}",
        .failed_at.display(),
        display_last(.last_copied),
        .remaining.display()
    )]
    PartialCopy {
        failed_at: PathBuf,
        last_copied: Option<PathBuf>,
        remaining: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "copied {} to {} but could not remove the source copy: {source}",
        .from.display(),
        .to.display()
    )]
    RemoveSource {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("directory move did not complete: {0}")]
    Aborted(String),
}

fn display_last(last: &Option<PathBuf>) -> String {
    match last {
        Some(p) => p.display().to_string(),
        None => "nothing".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Missing,
    Empty,
    HasData,
}

fn dir_state(path: &Path) -> Result<DirState, SwapError> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DirState::Missing),
        Err(source) => {
            return Err(SwapError::Inspect {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !meta.is_dir() {
        return Err(SwapError::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    let mut entries = fs::read_dir(path).map_err(|source| SwapError::Inspect {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(if entries.next().is_some() {
        DirState::HasData
    } else {
        DirState::Empty
    })
}

fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

/// Relocates a directory tree between a private folder and the shared location.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectorySwapper;

impl DirectorySwapper {
    pub fn new() -> Self {
        Self
    }

    /// Move the contents of `source` into `destination`.
    ///
    /// A missing or empty source is not an error: there is simply nothing to
    /// move. After a real move an empty directory is left at `source`.
    pub fn move_tree(&self, source: &Path, destination: &Path) -> Result<SwapOutcome, SwapError> {
        let src = dir_state(source)?;
        let dst = dir_state(destination)?;

        let outcome = match (src, dst) {
            (DirState::Missing | DirState::Empty, DirState::HasData) => {
                tracing::debug!(
                    source = %source.display(),
                    destination = %destination.display(),
                    "destination already populated; nothing to move"
                );
                return Ok(SwapOutcome::AlreadySwapped);
            }
            (DirState::Missing | DirState::Empty, _) => {
                tracing::debug!(source = %source.display(), "source empty; nothing to move");
                return Ok(SwapOutcome::NothingToMove);
            }
            (DirState::HasData, DirState::HasData) => {
                // Rename cannot replace a populated directory; merge with overwrite.
                let files = copy_then_delete(source, destination)?;
                SwapOutcome::Copied { files }
            }
            (DirState::HasData, dst) => rename_or_copy(source, destination, dst)?,
        };

        if let Err(e) = fs::create_dir_all(source) {
            tracing::warn!(path = %source.display(), error = %e, "could not recreate empty directory after move");
        }
        tracing::info!(
            source = %source.display(),
            destination = %destination.display(),
            ?outcome,
            "moved directory tree"
        );
        Ok(outcome)
    }
}

fn rename_or_copy(
    source: &Path,
    destination: &Path,
    dst: DirState,
) -> Result<SwapOutcome, SwapError> {
    if dst == DirState::Empty {
        fs::remove_dir(destination).map_err(|e| SwapError::Rename {
            from: source.to_path_buf(),
            to: destination.to_path_buf(),
            source: e,
        })?;
    } else if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| SwapError::Rename {
            from: source.to_path_buf(),
            to: destination.to_path_buf(),
            source: e,
        })?;
    }

    match fs::rename(source, destination) {
        Ok(()) => Ok(SwapOutcome::Renamed),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!(
                source = %source.display(),
                destination = %destination.display(),
                "rename crosses devices; falling back to copy"
            );
            let files = copy_then_delete(source, destination)?;
            Ok(SwapOutcome::Copied { files })
        }
        Err(e) => {
            if dst == DirState::Empty {
                if let Err(e) = fs::create_dir(destination) {
                    tracing::warn!(path = %destination.display(), error = %e, "could not recreate empty destination after failed rename");
                }
            }
            Err(SwapError::Rename {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
                source: e,
            })
        }
    }
}

/// Copy every entry of `source` into `destination` (overwriting files), then delete `source`.
/// Returns the number of files copied.
pub(crate) fn copy_then_delete(source: &Path, destination: &Path) -> Result<usize, SwapError> {
    let mut last_copied: Option<PathBuf> = None;
    let mut files = 0usize;

    let partial = |failed_at: &Path, last: &Option<PathBuf>, e: io::Error| SwapError::PartialCopy {
        failed_at: failed_at.to_path_buf(),
        last_copied: last.clone(),
        remaining: source.to_path_buf(),
        source: e,
    };

    fs::create_dir_all(destination).map_err(|e| partial(destination, &last_copied, e))?;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e.path().unwrap_or(source).to_path_buf();
                return Err(partial(&at, &last_copied, e.into()));
            }
        };
        let rel = match entry.path().strip_prefix(source) {
            Ok(rel) => rel,
            Err(e) => return Err(partial(entry.path(), &last_copied, io::Error::other(e))),
        };
        let target = destination.join(rel);
        let file_type = entry.file_type();

        let res = if file_type.is_dir() {
            fs::create_dir_all(&target)
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        if let Err(e) = res {
            return Err(partial(entry.path(), &last_copied, e));
        }
        if !file_type.is_dir() {
            files += 1;
        }
        last_copied = Some(target);
    }

    fs::remove_dir_all(source).map_err(|e| SwapError::RemoveSource {
        from: source.to_path_buf(),
        to: destination.to_path_buf(),
        source: e,
    })?;
    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let points_to = fs::read_link(link)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(points_to, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}
