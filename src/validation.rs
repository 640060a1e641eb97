//! Field checks applied before an entry is written to the registry.
//!
//! The launch engine trusts whatever entry it receives; these checks run only
//! on the editing path.

use crate::model::ProgramEntry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Name,
    ExecutablePath,
    PrivateDocPath,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Name => "name",
            Field::ExecutablePath => "executable",
            Field::PrivateDocPath => "documents folder",
        })
    }
}

/// Errors per field; only the first problem found for a field is kept.
#[derive(Debug, Default, Error)]
#[error("{}", render(.errors))]
pub struct ValidationErrors {
    errors: BTreeMap<Field, String>,
}

fn render(errors: &BTreeMap<Field, String>) -> String {
    errors
        .iter()
        .map(|(field, msg)| format!("{field}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    fn add(&mut self, field: Field, msg: impl Into<String>) {
        self.errors.entry(field).or_insert_with(|| msg.into());
    }

    fn has(&self, field: Field) -> bool {
        self.errors.contains_key(&field)
    }

    #[cfg(test)]
    pub fn get(&self, field: Field) -> Option<&str> {
        self.errors.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check every field of `entry`. `shared_doc_dir` lets a not-yet-created
/// private folder pass when the documents currently sit in the shared location.
pub fn validate_entry(entry: &ProgramEntry, shared_doc_dir: &Path) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::default();

    if entry.name.trim().is_empty() {
        errs.add(Field::Name, "required");
    }

    require_path(&mut errs, Field::ExecutablePath, &entry.executable_path);
    if !errs.has(Field::ExecutablePath) {
        check_executable(&mut errs, &entry.executable_path);
    }

    require_path(&mut errs, Field::PrivateDocPath, &entry.private_doc_path);
    if !errs.has(Field::PrivateDocPath)
        && !entry.private_doc_path.is_dir()
        && !shared_doc_dir.is_dir()
    {
        errs.add(Field::PrivateDocPath, "folder does not exist");
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

fn require_path(errs: &mut ValidationErrors, field: Field, path: &Path) {
    if path.as_os_str().is_empty() {
        errs.add(field, "required");
    }
}

fn check_executable(errs: &mut ValidationErrors, path: &Path) {
    if !path.is_file() {
        errs.add(Field::ExecutablePath, "file does not exist");
        return;
    }
    #[cfg(windows)]
    {
        let is_exe = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));
        if !is_exe {
            errs.add(Field::ExecutablePath, "not an .exe file");
        }
    }
}
