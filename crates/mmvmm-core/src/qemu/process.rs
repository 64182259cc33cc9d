use crate::error::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// A spawned QEMU child process.
///
/// Placed in its own process group on spawn so a SIGINT/SIGTERM delivered to
/// the daemon's controlling terminal does not forward to the guest (spec.md
/// §4.4.1, §9 "Process-group isolation").
#[derive(Debug)]
pub struct QemuProcess {
    pid: i32,
}

impl QemuProcess {
    /// Spawn `qemu_path argv[0..]` in a fresh process group.
    pub fn spawn(qemu_path: &str, argv: &[String]) -> Result<Self> {
        let mut cmd = Command::new(qemu_path);
        cmd.args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Safety: process_group(0) just sets a libc call made after fork and
        // before exec; it touches only the child's own process state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .try_into()
            .map_err(|_| Error::Internal("QEMU pid did not fit in i32".into()))?;

        // We don't keep the `std::process::Child` around: the daemon can
        // outlive any single supervisor loop iteration, so liveness and
        // reaping are both driven off the raw PID via `waitpid` instead of
        // `Child::wait`/`try_wait`, matching the original implementation's
        // detached-process model. Dropping `child` here does not reap it —
        // `is_alive` is what does that.
        drop(child);

        Ok(Self { pid })
    }

    /// Wrap an already-running QEMU process, e.g. reattaching after a
    /// supervisor respawn.
    pub fn from_pid(pid: i32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Whether this process is still running. Reaps it with a non-blocking
    /// `waitpid` as a side effect: QEMU is spawned without `-daemonize` as a
    /// direct child of this process (spec.md §6), and nothing else ever
    /// calls `wait` on it, so without this an exited child would sit as a
    /// zombie forever — `kill(pid, 0)` succeeds against an unreaped zombie,
    /// which would make a crashed VM look alive indefinitely.
    ///
    /// `ECHILD` (not our child — e.g. a stale PID from a previous daemon
    /// run, or already reaped) is treated as dead rather than propagated.
    pub fn is_alive(&self) -> bool {
        match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => false,
            Err(nix::errno::Errno::ECHILD) => kill(Pid::from_raw(self.pid), None).is_ok(),
            Err(_) => false,
        }
    }

    pub fn sigterm(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid), Signal::SIGTERM)
            .map_err(|e| Error::Internal(format!("SIGTERM failed for pid {}: {e}", self.pid)))
    }

    pub fn sigkill(&self) -> Result<()> {
        kill(Pid::from_raw(self.pid), Signal::SIGKILL)
            .map_err(|e| Error::Internal(format!("SIGKILL failed for pid {}: {e}", self.pid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_rejects_missing_binary() {
        let result = QemuProcess::spawn("/nonexistent/qemu-system-x86_64", &[]);
        assert!(result.is_err());
    }

    #[test]
    fn from_pid_reports_current_process_alive() {
        let p = QemuProcess::from_pid(std::process::id() as i32);
        assert!(p.is_alive());
    }

    #[test]
    fn is_alive_false_for_implausible_pid() {
        let p = QemuProcess::from_pid(i32::MAX - 1);
        assert!(!p.is_alive());
    }

    #[test]
    fn is_alive_reaps_exited_child_instead_of_reporting_it_alive() {
        let p = QemuProcess::spawn("/bin/true", &[]).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while p.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!p.is_alive(), "exited child must be reaped and reported dead");
    }
}
