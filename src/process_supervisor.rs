//! Lifecycle management for the external service processes.
//!
//! Every daemon the harness launches is registered here, and the registry is
//! the single owner of the spawned children. Termination is a SIGTERM per
//! process, fire-and-forget: the harness's own lifetime bounds the test run,
//! and the daemons are expected to honor the signal promptly. Exit statuses
//! are never awaited.

use std::ffi::OsStr;
use std::fs::File;
use std::process::Stdio;

use eyre::{eyre, WrapErr};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A spawned external service tracked by the supervisor.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: Pid,
    signalled: bool,
    // Held so the OS handle stays valid for signalling; never waited on.
    _child: Child,
}

impl ManagedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn signal(&mut self, signal: Signal) {
        self.signalled = true;
        match kill(self.pid, signal) {
            Ok(()) => debug!("sent {signal:?} to {} (pid {})", self.name, self.pid),
            // Already gone; nothing left to stop.
            Err(nix::Error::ESRCH) => {}
            Err(err) => warn!("failed to signal {} (pid {}): {err}", self.name, self.pid),
        }
    }
}

/// Owns every child process spawned by the harness.
///
/// The registry is mutated only by [`spawn`](Self::spawn) and
/// [`terminate_all`](Self::terminate_all); no other component touches the
/// children directly.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    processes: Vec<ManagedProcess>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches `command` with both stdout and stderr redirected to `sink`
    /// and registers the child for teardown. Returns the new process id.
    pub fn spawn<S: AsRef<OsStr>>(
        &mut self,
        name: &str,
        command: &str,
        args: &[S],
        sink: File,
    ) -> eyre::Result<Pid> {
        info!("spawning {name}: {command}");

        let stderr_sink = sink
            .try_clone()
            .wrap_err_with(|| format!("cloning output sink for {name}"))?;

        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::from(stderr_sink))
            .spawn()
            .wrap_err_with(|| format!("spawning {name} ({command})"))?;

        let pid = match child.id() {
            Some(id) => Pid::from_raw(id.try_into()?),
            None => return Err(eyre!("{name} exited before a pid could be read")),
        };

        info!("{name} running with pid {pid}");
        self.processes.push(ManagedProcess {
            name: name.to_string(),
            pid,
            signalled: false,
            _child: child,
        });

        Ok(pid)
    }

    /// Sends SIGTERM to every registered process and drops them from the
    /// registry. Safe to call repeatedly; processes registered after an
    /// earlier call are signalled by the next one. Returns how many signals
    /// were issued.
    pub fn terminate_all(&mut self) -> usize {
        let mut signalled = 0;
        for mut process in self.processes.drain(..) {
            if !process.signalled {
                process.signal(Signal::SIGTERM);
                signalled += 1;
            }
        }
        signalled
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Emergency path: a panic or early unwind skipped the explicit
        // teardown call. Signal whatever is still registered.
        if !self.processes.is_empty() {
            eprintln!(
                "ProcessSupervisor dropped with {} live children, signalling them",
                self.processes.len()
            );
            self.terminate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn sink(dir: &Path, name: &str) -> File {
        File::create(dir.join(name)).unwrap()
    }

    /// True once the process is gone or left as a zombie awaiting reaping;
    /// either way it no longer runs.
    fn terminated(pid: Pid) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat.split_whitespace().nth(2) == Some("Z"),
        }
    }

    async fn assert_terminates(pid: Pid) {
        for _ in 0..50 {
            if terminated(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pid {pid} still running");
    }

    #[tokio::test]
    async fn terminate_all_signals_every_registered_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = ProcessSupervisor::new();

        let first = supervisor
            .spawn("first", "sleep", &["30"], sink(dir.path(), "first.log"))
            .unwrap();
        let second = supervisor
            .spawn("second", "sleep", &["30"], sink(dir.path(), "second.log"))
            .unwrap();

        assert_eq!(supervisor.terminate_all(), 2);
        assert!(supervisor.is_empty());

        assert_terminates(first).await;
        assert_terminates(second).await;
    }

    #[tokio::test]
    async fn processes_registered_after_a_teardown_are_still_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = ProcessSupervisor::new();

        supervisor
            .spawn("early", "sleep", &["30"], sink(dir.path(), "early.log"))
            .unwrap();
        assert_eq!(supervisor.terminate_all(), 1);

        let late = supervisor
            .spawn("late", "sleep", &["30"], sink(dir.path(), "late.log"))
            .unwrap();
        assert_eq!(supervisor.terminate_all(), 1);
        assert_terminates(late).await;

        // Nothing left to signal.
        assert_eq!(supervisor.terminate_all(), 0);
    }

    #[tokio::test]
    async fn drop_signals_remaining_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid = {
            let mut supervisor = ProcessSupervisor::new();
            supervisor
                .spawn("orphan", "sleep", &["30"], sink(dir.path(), "orphan.log"))
                .unwrap()
        };
        assert_terminates(pid).await;
    }

    #[tokio::test]
    async fn spawn_redirects_output_to_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = ProcessSupervisor::new();

        supervisor
            .spawn("echo", "sh", &["-c", "echo out; echo err >&2"], sink(dir.path(), "echo.log"))
            .unwrap();

        for _ in 0..50 {
            let contents = std::fs::read_to_string(dir.path().join("echo.log")).unwrap();
            if contents.contains("out") && contents.contains("err") {
                supervisor.terminate_all();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sink never received the child's output");
    }
}
