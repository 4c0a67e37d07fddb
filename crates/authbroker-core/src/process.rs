//! Process confinement lookups
//!
//! The kernel exposes the security label of every task under procfs. With
//! AppArmor stacking the label lives in `attr/apparmor/current`; older
//! kernels only provide the generic `attr/current`.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label reported for processes running without a confinement profile
pub const UNCONFINED: &str = "unconfined";

/// Errors resolving the confinement label of a process
#[derive(Error, Debug)]
pub enum ConfinementError {
    #[error("Process {0} not found")]
    NoSuchProcess(u32),

    #[error("Process {0} has an empty security label")]
    EmptyLabel(u32),

    #[error("Failed to read security label of process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Strip the enforcement mode from a raw label.
///
/// `"com.example.app_app_1.0 (enforce)"` becomes `"com.example.app_app_1.0"`;
/// `"unconfined"` is returned unchanged.
pub fn parse_label(raw: &str) -> &str {
    let label = raw.trim_end_matches(|c| c == '\n' || c == '\0').trim();
    match label.rfind(" (") {
        Some(idx) if label.ends_with(')') => &label[..idx],
        _ => label,
    }
}

/// Read the confinement label of a process from procfs
pub fn profile_for_pid(pid: u32) -> Result<String, ConfinementError> {
    profile_for_pid_in(Path::new("/proc"), pid)
}

/// Same as [`profile_for_pid`], rooted at an alternative procfs mount
pub fn profile_for_pid_in(proc_root: &Path, pid: u32) -> Result<String, ConfinementError> {
    let task_dir = proc_root.join(pid.to_string());
    if !task_dir.exists() {
        return Err(ConfinementError::NoSuchProcess(pid));
    }

    let candidates: [PathBuf; 2] = [
        task_dir.join("attr").join("apparmor").join("current"),
        task_dir.join("attr").join("current"),
    ];

    let mut last_error = None;
    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let label = parse_label(&raw);
                if label.is_empty() {
                    return Err(ConfinementError::EmptyLabel(pid));
                }
                return Ok(label.to_string());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => last_error = Some(e),
        }
    }

    Err(ConfinementError::Io {
        pid,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no security label")),
    })
}
