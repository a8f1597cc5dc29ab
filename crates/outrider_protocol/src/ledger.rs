//! The on-disk job ledger: one JSON file per running job under
//! `<cachedir>/proc/<jid>`.
//!
//! The ledger is a weakly-consistent hint, not a source of truth.
//! Records are written before execution and deleted after; readers
//! treat a missing file as "no such job" and never fail on races.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Crash-recovery marker for one running job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub jid: String,
    pub pid: u32,
    pub fun: Value,
    /// Name of the schedule entry that spawned this job, if any.
    /// The scheduler counts live records by this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Unix timestamp of the spawn.
    pub start: f64,
    /// Full envelope echo for inspection.
    #[serde(default)]
    pub envelope: Value,
}

impl JobRecord {
    pub fn path_in(&self, proc_dir: &Path) -> PathBuf {
        proc_dir.join(&self.jid)
    }
}

/// Directory ownership/mode options for the proc directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcDirOptions {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Return the proc directory under the cache directory, creating it
/// with the requested mode and ownership if needed.
pub fn ensure_proc_dir(cachedir: &Path, opts: ProcDirOptions) -> io::Result<PathBuf> {
    let dir = cachedir.join("proc");
    if !dir.is_dir() {
        fs::create_dir_all(&dir)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = opts.mode {
            let perms = fs::Permissions::from_mode(mode);
            fs::set_permissions(&dir, perms)?;
        }
        if opts.uid.is_some() || opts.gid.is_some() {
            if let Err(err) = std::os::unix::fs::chown(&dir, opts.uid, opts.gid) {
                warn!("Could not set ownership on {}: {}", dir.display(), err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = opts;
    }

    Ok(dir)
}

/// Write a record (write-ahead: called before the function is invoked).
pub fn write(proc_dir: &Path, record: &JobRecord) -> io::Result<()> {
    let data = serde_json::to_vec(record)?;
    fs::write(record.path_in(proc_dir), data)
}

/// Read one record; corrupt files yield None.
pub fn read(path: &Path) -> Option<JobRecord> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Delete a record. A file that is already gone is fine.
pub fn delete(proc_dir: &Path, jid: &str) {
    let path = proc_dir.join(jid);
    match fs::remove_file(&path) {
        Ok(()) => debug!("Removed job record {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to delete job record {}: {}", path.display(), err),
    }
}

/// All readable records in the ledger. Corrupt files are removed.
pub fn scan(proc_dir: &Path) -> Vec<JobRecord> {
    let mut records = Vec::new();
    let entries = match fs::read_dir(proc_dir) {
        Ok(entries) => entries,
        Err(_) => return records,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match read(&path) {
            Some(record) => records.push(record),
            None => {
                info!("Invalid job record found, removing: {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
    }
    records
}

/// Count the live records belonging to a schedule entry.
pub fn count_running(proc_dir: &Path, schedule_name: &str) -> usize {
    scan(proc_dir)
        .into_iter()
        .filter(|record| record.schedule.as_deref() == Some(schedule_name))
        .filter(|record| pid_alive(record.pid))
        .count()
}

/// Remove records whose pid no longer refers to a live process.
pub fn clean_proc_dir(proc_dir: &Path) {
    for record in scan(proc_dir) {
        if !pid_alive(record.pid) {
            info!(
                "Removing stale job record for jid {} (pid {} is gone)",
                record.jid, record.pid
            );
            delete(proc_dir, &record.jid);
        }
    }
}

/// Best-effort process liveness. Our own pid is always alive; other
/// pids are checked through /proc where available and otherwise
/// assumed dead (a record from a previous process generation).
pub fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(jid: &str, pid: u32, schedule: Option<&str>) -> JobRecord {
        JobRecord {
            jid: jid.to_string(),
            pid,
            fun: json!("test.ping"),
            schedule: schedule.map(|s| s.to_string()),
            start: 1_735_689_600.0,
            envelope: json!({"fun": "test.ping"}),
        }
    }

    #[test]
    fn record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = ensure_proc_dir(dir.path(), ProcDirOptions::default()).unwrap();

        let rec = record("20250101000001000000", std::process::id(), Some("ping"));
        write(&proc_dir, &rec).unwrap();

        let back = read(&proc_dir.join("20250101000001000000")).unwrap();
        assert_eq!(rec, back);

        delete(&proc_dir, "20250101000001000000");
        assert!(read(&proc_dir.join("20250101000001000000")).is_none());
        // deleting again is benign
        delete(&proc_dir, "20250101000001000000");
    }

    #[test]
    fn count_running_filters_by_schedule_and_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = ensure_proc_dir(dir.path(), ProcDirOptions::default()).unwrap();

        let me = std::process::id();
        write(&proc_dir, &record("20250101000001000001", me, Some("ping"))).unwrap();
        write(&proc_dir, &record("20250101000001000002", me, Some("ping"))).unwrap();
        write(&proc_dir, &record("20250101000001000003", me, Some("other"))).unwrap();
        // dead pid: never counted
        write(&proc_dir, &record("20250101000001000004", u32::MAX - 1, Some("ping"))).unwrap();

        assert_eq!(count_running(&proc_dir, "ping"), 2);
        assert_eq!(count_running(&proc_dir, "other"), 1);
        assert_eq!(count_running(&proc_dir, "absent"), 0);
    }

    #[test]
    fn clean_removes_dead_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = ensure_proc_dir(dir.path(), ProcDirOptions::default()).unwrap();

        write(&proc_dir, &record("20250101000001000001", std::process::id(), None)).unwrap();
        write(&proc_dir, &record("20250101000001000002", u32::MAX - 1, None)).unwrap();
        fs::write(proc_dir.join("20250101000001000003"), b"not json").unwrap();

        clean_proc_dir(&proc_dir);

        let left = scan(&proc_dir);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].jid, "20250101000001000001");
    }
}
