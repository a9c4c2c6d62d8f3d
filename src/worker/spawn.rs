//! Starting workers.
//!
//! Process workers are plain `fork()` children. The child keeps the
//! kernel and shard it inherited, runs the dispatch loop and leaves with
//! `_exit`, so no parent-owned state is ever torn down twice. Thread
//! workers run the same loop over the same pipes inside the parent.

use super::channel::Channel;
use super::dispatch;
use super::ipc::{MessageReader, MessageWriter, PipeFd, pipe};
use super::proc::WorkerHandle;
use super::signals::{EXIT_IO, EXIT_PANIC};
use crate::config::{Backend, Mode};
use crate::error::Result;
use crate::kernel::Kernel;
use nix::unistd::{ForkResult, fork};
use std::collections::BTreeSet;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Start one worker and return the parent's channel to it.
///
/// `inherited` lists descriptors the parent holds for workers spawned
/// earlier; a forked child closes them so those workers still see EOF
/// when the parent lets go.
pub(crate) fn spawn_worker<K: Kernel>(
    kernel: K,
    process_id: usize,
    mode: Mode,
    backend: Backend,
    inherited: &[RawFd],
) -> Result<(Channel, WorkerHandle)> {
    let (request_read, request_write) = pipe()?;
    let (response_read, response_write) = pipe()?;

    let handle = match backend {
        Backend::Fork => {
            // SAFETY: the child only runs the dispatch loop and ends in `_exit`.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    drop(request_write);
                    drop(response_read);
                    let keep = [request_read.as_raw_fd(), response_write.as_raw_fd()];
                    close_inherited(inherited, keep);
                    ignore_sigpipe();
                    let code = run(kernel, process_id, mode, request_read, response_write);
                    // SAFETY: terminates the child without running parent-owned destructors.
                    unsafe { nix::libc::_exit(code) }
                }
                Ok(ForkResult::Parent { child }) => {
                    tracing::debug!(process_id, pid = child.as_raw(), "Forked worker");
                    WorkerHandle::process(process_id, child)
                }
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32).into()),
            }
        }
        Backend::Thread => {
            let thread = std::thread::Builder::new()
                .name(format!("pwa-worker-{}", process_id))
                .spawn(move || run(kernel, process_id, mode, request_read, response_write))?;
            tracing::debug!(process_id, "Started worker thread");
            WorkerHandle::thread(process_id, thread)
        }
    };

    let channel = Channel::new(
        process_id,
        mode,
        MessageWriter::new(request_write),
        MessageReader::new(response_read),
    );
    Ok((channel, handle))
}

/// Worker body shared by both backends. Returns the exit code.
fn run<K: Kernel>(
    kernel: K,
    process_id: usize,
    mode: Mode,
    requests: PipeFd,
    responses: PipeFd,
) -> i32 {
    let mut reader = MessageReader::new(requests);
    let mut writer = MessageWriter::new(responses);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        dispatch::serve(kernel, process_id, mode, &mut reader, &mut writer)
    }));
    match outcome {
        Ok(Ok(exit)) => exit.code(),
        Ok(Err(_)) => EXIT_IO,
        Err(_) => EXIT_PANIC,
    }
}

/// Close pipe descriptors this child has no business holding.
///
/// Besides the pool's own descriptors, on Linux every other FIFO is closed
/// too, which covers pipes created concurrently by other pools in the same
/// parent.
fn close_inherited(inherited: &[RawFd], keep: [RawFd; 2]) {
    let mut doomed: BTreeSet<RawFd> = inherited.iter().copied().collect();
    doomed.extend(foreign_fifos());
    for fd in doomed {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        // SAFETY: the descriptor was inherited across fork and nothing in
        // the child uses it.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

#[cfg(target_os = "linux")]
fn foreign_fifos() -> Vec<RawFd> {
    use std::os::unix::fs::FileTypeExt;

    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return Vec::new();
    };
    let fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    fds.into_iter()
        .filter(|fd| {
            std::fs::metadata(format!("/proc/self/fd/{}", fd))
                .map(|meta| meta.file_type().is_fifo())
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn foreign_fifos() -> Vec<RawFd> {
    Vec::new()
}

fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no handler code to race with.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }
}
