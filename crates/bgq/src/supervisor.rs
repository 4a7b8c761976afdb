//! Spawning and signaling the worker process.
//!
//! The worker is a separate executable that receives the segment name on
//! its command line. Dropping a [`WorkerProcess`] reaps an exited child
//! but never kills a running one: a detached worker keeps going.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};
use crate::{debug_log, DEFAULT_WORKER_BIN, ENV_WORKER_BIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Stopped,
    /// The child's state cannot be queried; treated as gone.
    Unavailable,
}

#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: u32,
    exited: bool,
}

impl WorkerProcess {
    /// Starts a worker attached to `segment_name`. Stdin and stdout are
    /// null; stderr is inherited so worker logs land with the caller's.
    pub fn spawn(bin: &Path, segment_name: &str) -> Result<WorkerProcess> {
        let child = Command::new(bin)
            .arg(segment_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::ResourceExhausted(format!(
                    "could not start worker {}: {e}",
                    bin.display()
                ))
            })?;
        let pid = child.id();
        Ok(WorkerProcess {
            child,
            pid,
            exited: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&mut self) -> ProcessStatus {
        if self.exited {
            return ProcessStatus::Stopped;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.exited = true;
                ProcessStatus::Stopped
            }
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                // ECHILD: someone else reaped it. Anything else leaves the
                // child unqueryable either way.
                if e.raw_os_error() == Some(libc::ECHILD) {
                    self.exited = true;
                    ProcessStatus::Stopped
                } else {
                    debug_log(&format!("try_wait on pid {} failed: {e}", self.pid));
                    ProcessStatus::Unavailable
                }
            }
        }
    }

    /// Asks the worker to stop at its next cancel check.
    pub fn signal_cooperative(&self) {
        self.send_signal(libc::SIGTERM);
    }

    /// Stops the worker unconditionally.
    pub fn signal_forceful(&self) {
        self.send_signal(libc::SIGKILL);
    }

    fn send_signal(&self, sig: libc::c_int) {
        if self.exited {
            return;
        }
        if unsafe { libc::kill(self.pid as libc::pid_t, sig) } != 0 {
            debug_log(&format!(
                "kill({}, {sig}) failed: {}",
                self.pid,
                std::io::Error::last_os_error()
            ));
        }
    }

    /// Blocks until the child exits and reaps it.
    pub fn reap(&mut self) {
        if self.exited {
            return;
        }
        let _ = self.child.wait();
        self.exited = true;
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Reap if already exited so no zombie lingers, but never kill: a
        // worker dropped from the registry may be deliberately detached.
        if !self.exited {
            if let Ok(Some(_)) = self.child.try_wait() {
                self.exited = true;
            }
        }
    }
}

/// Picks the worker executable: an explicit path wins, then the
/// `BGQ_WORKER_BIN` environment variable, then a sibling of the current
/// executable, then `PATH`.
pub fn resolve_worker_bin(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(env) = std::env::var_os(ENV_WORKER_BIN) {
        return Ok(PathBuf::from(env));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(DEFAULT_WORKER_BIN);
            if is_executable(&sibling) {
                return Ok(sibling);
            }
        }
    }
    resolve_in_path(DEFAULT_WORKER_BIN).ok_or_else(|| {
        Error::ResourceExhausted(format!(
            "worker binary {DEFAULT_WORKER_BIN} not found; set {ENV_WORKER_BIN}"
        ))
    })
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

pub(crate) fn resolve_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn spawn_and_status_of_a_short_child() {
        let sleep = resolve_in_path("sleep").unwrap();
        let mut p = WorkerProcess::spawn(&sleep, "0").unwrap();
        p.reap();
        assert_eq!(p.status(), ProcessStatus::Stopped);
        // Signaling a reaped child is a no-op.
        p.signal_forceful();
    }

    #[test]
    #[cfg(unix)]
    fn forceful_signal_stops_a_running_child() {
        let sleep = resolve_in_path("sleep").unwrap();
        let mut p = WorkerProcess::spawn(&sleep, "60").unwrap();
        assert_eq!(p.status(), ProcessStatus::Running);
        p.signal_forceful();
        p.reap();
        assert_eq!(p.status(), ProcessStatus::Stopped);
    }

    #[test]
    fn spawn_failure_is_resource_exhaustion() {
        let err = WorkerProcess::spawn(Path::new("/nonexistent/bgq-worker"), "x").unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn explicit_path_wins_resolution() {
        let p = resolve_worker_bin(Some(Path::new("/opt/custom-worker"))).unwrap();
        assert_eq!(p, PathBuf::from("/opt/custom-worker"));
    }

    #[test]
    #[cfg(unix)]
    fn path_resolution_finds_standard_tools() {
        assert!(resolve_in_path("sh").is_some());
        assert!(resolve_in_path("definitely-not-a-real-binary-name").is_none());
    }
}
