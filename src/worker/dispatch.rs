//! Worker-side dispatch loop.
//!
//! Runs inside each worker, whatever hosts it. The loop owns the kernel and
//! the worker ends of both pipes, and only ever leaves through a shutdown
//! request, end of input, or a broken pipe.

use super::ipc::{MessageReader, MessageWriter};
use super::protocol::{Failure, FailureKind, Request, Response};
use super::signals::{EXIT_CLEAN, EXIT_SETUP_FAILED};
use crate::config::Mode;
use crate::kernel::Kernel;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// How the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Parent sent a shutdown request.
    Shutdown,
    /// Parent closed its end of the request pipe.
    Disconnected,
    /// Kernel setup failed and was reported.
    SetupFailed,
}

impl WorkerExit {
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Shutdown | Self::Disconnected => EXIT_CLEAN,
            Self::SetupFailed => EXIT_SETUP_FAILED,
        }
    }
}

/// Run one worker until it is told to stop.
pub(crate) fn serve<K: Kernel>(
    mut kernel: K,
    process_id: usize,
    mode: Mode,
    reader: &mut MessageReader,
    writer: &mut MessageWriter,
) -> io::Result<WorkerExit> {
    let setup = catch_unwind(AssertUnwindSafe(|| kernel.setup()));
    let setup_failure = match setup {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(Failure::from_error(process_id, FailureKind::Setup, &e)),
        Err(payload) => Some(Failure::from_panic(
            process_id,
            FailureKind::Setup,
            payload.as_ref(),
        )),
    };
    if let Some(failure) = setup_failure {
        debug!(process_id, failure = %failure, "Kernel setup failed");
        reply(writer, Err(failure))?;
        return Ok(WorkerExit::SetupFailed);
    }

    writer.write(&Response::Ready)?;

    match mode {
        Mode::Simplex => {
            reply(writer, invoke(&mut kernel, process_id, None))?;
            idle(reader, process_id)
        }
        Mode::Duplex => serve_requests(&mut kernel, process_id, reader, writer),
    }
}

fn serve_requests<K: Kernel>(
    kernel: &mut K,
    process_id: usize,
    reader: &mut MessageReader,
    writer: &mut MessageWriter,
) -> io::Result<WorkerExit> {
    loop {
        let request = match reader.read::<Request>() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(WorkerExit::Disconnected),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let failure = Failure::protocol(process_id, format!("invalid request: {}", e));
                reply(writer, Err(failure))?;
                continue;
            }
            Err(e) => return Err(e),
        };

        match request {
            Request::Shutdown => return Ok(WorkerExit::Shutdown),
            Request::Args { payload } => {
                let started = Instant::now();
                let outcome = serde_json::from_value::<K::Request>(payload)
                    .map_err(|e| {
                        Failure::protocol(process_id, format!("cannot decode arguments: {}", e))
                    })
                    .and_then(|args| invoke(kernel, process_id, Some(args)));
                trace!(
                    process_id,
                    ok = outcome.is_ok(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "Processed request"
                );
                reply(writer, outcome)?;
            }
        }
    }
}

/// Simplex workers have answered already; wait for the shutdown request.
fn idle(reader: &mut MessageReader, process_id: usize) -> io::Result<WorkerExit> {
    loop {
        match reader.read::<Request>() {
            Ok(Some(Request::Shutdown)) => return Ok(WorkerExit::Shutdown),
            Ok(Some(Request::Args { .. })) => {
                warn!(process_id, "Simplex worker ignoring arguments");
            }
            Ok(None) => return Ok(WorkerExit::Disconnected),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(process_id, error = %e, "Simplex worker ignoring invalid request");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Call `process` and encode its answer, catching errors and panics.
fn invoke<K: Kernel>(
    kernel: &mut K,
    process_id: usize,
    args: Option<K::Request>,
) -> Result<serde_json::Value, Failure> {
    match catch_unwind(AssertUnwindSafe(|| kernel.process(args))) {
        Ok(Ok(response)) => serde_json::to_value(&response).map_err(|e| {
            Failure::protocol(process_id, format!("cannot encode result: {}", e))
        }),
        Ok(Err(e)) => Err(Failure::from_error(process_id, FailureKind::Compute, &e)),
        Err(payload) => Err(Failure::from_panic(
            process_id,
            FailureKind::Panic,
            payload.as_ref(),
        )),
    }
}

fn reply(writer: &mut MessageWriter, outcome: Result<serde_json::Value, Failure>) -> io::Result<()> {
    match outcome {
        Ok(value) => writer.write(&Response::Result { value }),
        Err(failure) => {
            writer.write(&Response::Error)?;
            writer.write(&Response::Failure(failure))
        }
    }
}
