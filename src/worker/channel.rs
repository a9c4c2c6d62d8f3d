//! Parent-side end of a worker connection.

use super::ipc::{MessageReader, MessageWriter};
use super::protocol::{ErrorSentinel, Failure, Reply, Request, Response};
use crate::config::Mode;
use crate::error::{ForemanError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::os::unix::io::RawFd;

/// Bidirectional message channel to one worker.
///
/// Interfaces drive channels directly: they `send` arguments and `recv`
/// replies in whatever order suits them. An error reply must be followed
/// by `recv_failure` to consume the failure record that comes with it; a
/// `recv` issued instead skips the record.
pub struct Channel {
    process_id: usize,
    mode: Mode,
    writer: MessageWriter,
    reader: MessageReader,
    /// A failure record is waiting behind an error marker.
    failure_pending: bool,
    /// Failure raised on this side for a result that could not be decoded.
    local_failure: Option<Failure>,
    /// Simplex workers answer exactly once.
    answered: bool,
}

impl Channel {
    pub(crate) fn new(
        process_id: usize,
        mode: Mode,
        writer: MessageWriter,
        reader: MessageReader,
    ) -> Self {
        Self {
            process_id,
            mode,
            writer,
            reader,
            failure_pending: false,
            local_failure: None,
            answered: false,
        }
    }

    /// Zero-based id of the worker behind this channel.
    pub fn process_id(&self) -> usize {
        self.process_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_duplex(&self) -> bool {
        self.mode == Mode::Duplex
    }

    /// Send one argument payload to the worker.
    pub fn send<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.send_value(payload)
    }

    /// Send an already encoded payload to the worker.
    pub fn send_value(&mut self, payload: serde_json::Value) -> Result<()> {
        if !self.is_duplex() {
            return Err(ForemanError::SimplexSend {
                process_id: self.process_id,
            });
        }
        self.write(&Request::Args { payload })
    }

    /// Receive the worker's next reply.
    ///
    /// Blocks until the worker answers. An error reply comes back as
    /// `Reply::Error(ErrorSentinel)`; the failure itself is read with
    /// `recv_failure`. A result that does not decode as `T` is reported
    /// the same way, with a protocol failure; the channel stays in step.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Reply<T>> {
        if self.failure_pending {
            let skipped = self.recv_failure()?;
            tracing::debug!(
                process_id = self.process_id,
                failure = %skipped,
                "Skipping unread failure record"
            );
        }
        if !self.is_duplex() && self.answered {
            return Err(ForemanError::SimplexExhausted {
                process_id: self.process_id,
            });
        }

        match self.read()? {
            Response::Result { value } => {
                self.answered = true;
                match serde_json::from_value(value) {
                    Ok(value) => Ok(Reply::Value(value)),
                    Err(e) => {
                        let failure =
                            Failure::protocol(self.process_id, format!("undecodable result: {}", e));
                        tracing::debug!(failure = %failure, "Result did not decode");
                        self.local_failure = Some(failure);
                        self.failure_pending = true;
                        Ok(Reply::Error(ErrorSentinel))
                    }
                }
            }
            Response::Error => {
                self.answered = true;
                self.failure_pending = true;
                Ok(Reply::Error(ErrorSentinel))
            }
            other => Err(self.protocol_error(format!("expected a result, got {:?}", other))),
        }
    }

    /// Read the failure record that follows an error reply.
    pub fn recv_failure(&mut self) -> Result<Failure> {
        if let Some(failure) = self.local_failure.take() {
            self.failure_pending = false;
            return Ok(failure);
        }
        match self.read()? {
            Response::Failure(failure) => {
                self.failure_pending = false;
                Ok(failure)
            }
            other => Err(self.protocol_error(format!(
                "expected a failure record, got {:?}",
                other
            ))),
        }
    }

    /// Receive a reply with its failure record already resolved.
    pub fn recv_outcome<T: DeserializeOwned>(
        &mut self,
    ) -> Result<std::result::Result<T, Failure>> {
        match self.recv()? {
            Reply::Value(value) => Ok(Ok(value)),
            Reply::Error(_) => Ok(Err(self.recv_failure()?)),
        }
    }

    /// Wait for the worker's setup handshake.
    pub(crate) fn await_ready(&mut self) -> Result<()> {
        match self.read()? {
            Response::Ready => Ok(()),
            Response::Error => Err(ForemanError::Setup(self.recv_failure()?)),
            other => Err(self.protocol_error(format!("expected ready, got {:?}", other))),
        }
    }

    /// Ask the worker to leave its dispatch loop.
    pub(crate) fn send_shutdown(&mut self) -> Result<()> {
        self.write(&Request::Shutdown)
    }

    /// Both parent-side descriptors, for closing in later children.
    pub(crate) fn raw_fds(&self) -> [RawFd; 2] {
        [self.writer.as_raw_fd(), self.reader.as_raw_fd()]
    }

    fn write(&mut self, request: &Request) -> Result<()> {
        self.writer
            .write(request)
            .map_err(|e| self.lost(format!("send failed: {}", e)))
    }

    fn read(&mut self) -> Result<Response> {
        match self.reader.read() {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(self.lost("channel closed".to_string())),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(self.protocol_error(format!("malformed message: {}", e)))
            }
            Err(e) => Err(self.lost(format!("receive failed: {}", e))),
        }
    }

    fn lost(&self, reason: String) -> ForemanError {
        ForemanError::WorkerLost {
            process_id: self.process_id,
            reason,
        }
    }

    fn protocol_error(&self, message: String) -> ForemanError {
        ForemanError::Protocol {
            process_id: self.process_id,
            message,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("process_id", &self.process_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
