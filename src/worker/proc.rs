//! Handles to the execution units hosting workers.
//!
//! A worker is either a forked child process or a thread in the parent.
//! Both are observed the same way: poll for liveness, wait with a
//! deadline, then force the issue.

use super::signals::{TerminationReason, analyze_wait_status};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a worker to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

enum Unit {
    Process(Pid),
    Thread(Option<JoinHandle<i32>>),
}

/// Handle to one worker's execution unit.
pub struct WorkerHandle {
    process_id: usize,
    unit: Unit,
    /// Set once the unit has been reaped, joined or detached.
    exit: Option<TerminationReason>,
}

impl WorkerHandle {
    pub(crate) fn process(process_id: usize, pid: Pid) -> Self {
        Self {
            process_id,
            unit: Unit::Process(pid),
            exit: None,
        }
    }

    pub(crate) fn thread(process_id: usize, handle: JoinHandle<i32>) -> Self {
        Self {
            process_id,
            unit: Unit::Thread(Some(handle)),
            exit: None,
        }
    }

    pub fn process_id(&self) -> usize {
        self.process_id
    }

    /// OS process id, for process workers.
    pub fn pid(&self) -> Option<Pid> {
        match self.unit {
            Unit::Process(pid) => Some(pid),
            Unit::Thread(_) => None,
        }
    }

    /// Check if the unit is still running (non-blocking).
    ///
    /// Reaps the unit as a side effect once it has exited.
    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        let reason = match &mut self.unit {
            Unit::Process(pid) => match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => analyze_wait_status(status),
                Err(_) => Some(TerminationReason::Unknown),
            },
            Unit::Thread(handle) => match handle.take_if(|h| h.is_finished()) {
                Some(finished) => Some(match finished.join() {
                    Ok(code) => TerminationReason::Exited(code),
                    Err(_) => TerminationReason::Panicked,
                }),
                None => None,
            },
        };
        self.exit = reason;
        self.exit.is_none()
    }

    /// Why the unit stopped, or `None` while it is still running.
    pub fn exit_reason(&mut self) -> Option<TerminationReason> {
        if self.is_running() {
            return None;
        }
        self.exit.clone()
    }

    /// Wait up to `timeout` for the unit to exit on its own.
    ///
    /// Returns `true` if it exited.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Force the unit to stop.
    ///
    /// Processes get SIGTERM, then SIGKILL if they outlive a short grace
    /// period. Threads cannot be killed and are detached instead.
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        match &mut self.unit {
            Unit::Process(pid) => {
                let pid = *pid;
                let _ = signal::kill(pid, Signal::SIGTERM);
                if self.wait_timeout(TERM_GRACE) {
                    return;
                }
                let _ = signal::kill(pid, Signal::SIGKILL);
                self.exit = Some(match waitpid(pid, None) {
                    Ok(status) => {
                        analyze_wait_status(status).unwrap_or(TerminationReason::Unknown)
                    }
                    Err(_) => TerminationReason::Unknown,
                });
            }
            Unit::Thread(handle) => {
                tracing::warn!(
                    process_id = self.process_id,
                    "Thread worker did not stop; detaching it"
                );
                drop(handle.take());
                self.exit = Some(TerminationReason::Detached);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Unit::Process(pid) = self.unit
            && self.is_running()
        {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}
