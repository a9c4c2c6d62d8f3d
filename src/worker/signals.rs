//! Exit analysis for worker execution units.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Worker exited after a shutdown request or end of input.
pub const EXIT_CLEAN: i32 = 0;
/// Worker lost its pipes while reading or writing.
pub const EXIT_IO: i32 = 1;
/// Kernel setup failed; the failure was reported before exit.
pub const EXIT_SETUP_FAILED: i32 = 3;
/// Dispatch loop panicked outside of kernel code.
pub const EXIT_PANIC: i32 = 101;

/// Why a worker stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Thread worker unwound past the dispatch loop.
    Panicked,
    /// Thread worker left running after the shutdown timeout.
    Detached,
    /// Exit status could not be collected.
    Unknown,
}

impl TerminationReason {
    /// Check if the worker went away the way a shutdown asks it to.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(EXIT_CLEAN))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_CLEAN) => "exited cleanly".to_string(),
            Self::Exited(EXIT_SETUP_FAILED) => "exited after setup failure".to_string(),
            Self::Exited(EXIT_PANIC) => "exited after a panic".to_string(),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => "killed by SIGKILL".to_string(),
            Self::Signaled(Signal::SIGSEGV) => "crashed (SIGSEGV)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Panicked => "panicked".to_string(),
            Self::Detached => "detached while still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Map a `WaitStatus` to a termination reason.
///
/// Returns `None` while the process is still alive.
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::StillAlive => None,
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(TerminationReason::Signaled(signal)),
        _ => Some(TerminationReason::Unknown),
    }
}
