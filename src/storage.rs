//! Registry and run-history persistence.

use crate::model::{Registry, RunRecord};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "docswap";
const REGISTRY_FILE: &str = "registry.json";

/// Default location of the registry file.
pub fn default_registry_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no config directory on this platform")?;
    Ok(base.join(APP_DIR).join(REGISTRY_FILE))
}

/// Default directory holding one JSON file per completed run.
pub fn default_history_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("no local data directory on this platform")?;
    Ok(base.join(APP_DIR).join("history"))
}

/// Load the registry; a missing file is an empty registry.
pub fn load_registry(path: &Path) -> Result<Registry> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no registry yet; starting empty");
            return Ok(Registry::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

/// Save the registry via a temp file and rename so a crash never leaves half a file.
pub fn save_registry(path: &Path, registry: &Registry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(registry)?;
    fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    tracing::debug!(path = %path.display(), entries = registry.programs.len(), "registry saved");
    Ok(())
}

/// Persist one run record and return the file it was written to.
pub fn save_run(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let stem = format!(
        "run-{}-{}",
        record.timestamp_utc.replace(':', "-").replace('T', "_"),
        sanitize(&record.name)
    );
    let mut path = dir.join(format!("{stem}.json"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}-{n}.json"));
        n += 1;
    }
    let data = serde_json::to_vec_pretty(record)?;
    fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Load up to `limit` run records, newest first. Unreadable files are skipped.
pub fn load_recent(dir: &Path, limit: usize) -> Result<Vec<RunRecord>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };
    let mut files: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files.reverse();

    let mut out = Vec::new();
    for p in files.into_iter() {
        if out.len() >= limit {
            break;
        }
        match fs::read(&p)
            .map_err(anyhow::Error::from)
            .and_then(|d| serde_json::from_slice::<RunRecord>(&d).map_err(anyhow::Error::from))
        {
            Ok(r) => out.push(r),
            Err(e) => tracing::warn!(path = %p.display(), error = %e, "skipping unreadable run record"),
        }
    }
    Ok(out)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExitOutcome, ProgramEntry};
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(ts: &str, name: &str) -> RunRecord {
        RunRecord {
            timestamp_utc: ts.into(),
            name: name.into(),
            executable_path: PathBuf::from("/bin/true"),
            exit: ExitOutcome::Exited(0),
            duration: Duration::from_secs(5),
            warning: None,
        }
    }

    #[test]
    fn missing_registry_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let reg = load_registry(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(reg, Registry::default());
    }

    #[test]
    fn registry_survives_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg/registry.json");
        let reg = Registry {
            shared_doc_dir: Some(PathBuf::from("/home/u/Documents")),
            programs: vec![ProgramEntry {
                name: "Editor".into(),
                executable_path: PathBuf::from("/opt/editor"),
                private_doc_path: PathBuf::from("/home/u/.editor-docs"),
            }],
        };
        save_registry(&path, &reg).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_registry(&path).unwrap(), reg);
    }

    #[test]
    fn corrupt_registry_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load_registry(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[test]
    fn recent_runs_are_newest_first_and_limited() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("history");
        save_run(&dir, &record("2024-01-01T10:00:00Z", "a")).unwrap();
        save_run(&dir, &record("2024-01-03T10:00:00Z", "c")).unwrap();
        save_run(&dir, &record("2024-01-02T10:00:00Z", "b / weird")).unwrap();
        fs::write(dir.join("garbage.json"), "nope").unwrap();

        let recent = load_recent(&dir, 2).unwrap();
        let names: Vec<_> = recent.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b / weird"]);
    }

    #[test]
    fn same_timestamp_does_not_overwrite() {
        let tmp = TempDir::new().unwrap();
        let a = save_run(tmp.path(), &record("2024-01-01T10:00:00Z", "x")).unwrap();
        let b = save_run(tmp.path(), &record("2024-01-01T10:00:00Z", "x")).unwrap();
        assert_ne!(a, b);
        assert_eq!(load_recent(tmp.path(), 10).unwrap().len(), 2);
    }
}
