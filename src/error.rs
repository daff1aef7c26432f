//! Error taxonomy for the server and client engines.
//!
//! Lifecycle misuse, start-up resource failures and send outcomes are all
//! returned synchronously as [`IpcError`]. Per-connection read failures are
//! never returned: they surface as disconnect notifications instead.

use std::io;

use thiserror::Error;

use crate::events::ConnectionId;

/// Result alias used across the crate.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;

/// Everything a public sockbus operation can fail with.
#[derive(Debug, Error)]
pub enum IpcError {
    /// `IpcServer::start` while the server is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `IpcServer::stop` while the server is not running.
    #[error("server is not running")]
    NotRunning,

    /// `IpcClient::start` while the client is already started.
    #[error("client is already started")]
    AlreadyStarted,

    /// `IpcClient::stop` while the client is not started.
    #[error("client is not started")]
    NotStarted,

    /// Endpoint names must be non-empty and free of `/` and NUL.
    #[error("invalid endpoint name {0:?}")]
    InvalidName(String),

    /// The derived socket path does not fit in `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        /// Offending path.
        path: String,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// A resource could not be acquired during `start`.
    ///
    /// Everything acquired before the failing step has already been released.
    #[error("{step} failed: {source}")]
    Setup {
        /// The step that failed, e.g. `"bind"`.
        step: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The background loop thread could not be spawned.
    #[error("failed to spawn loop thread: {0}")]
    Spawn(#[source] io::Error),

    /// `stop` was called from the engine's own loop thread (for example from
    /// an inline event sink), which would join itself.
    #[error("stop called from the engine's loop thread")]
    StopFromLoopThread,

    /// `IpcServer::send` to an id that is not an open connection.
    #[error("no open connection {0}")]
    UnknownConnection(ConnectionId),

    /// `IpcClient::send` while the client is not connected.
    #[error("client is not connected")]
    NotConnected,

    /// The socket send buffer is full; nothing was written.
    #[error("send would block")]
    WouldBlock,

    /// Only part of the payload fit in the socket send buffer.
    #[error("partial write: {written} of {total} bytes sent")]
    PartialWrite {
        /// Bytes accepted by the kernel.
        written: usize,
        /// Bytes requested.
        total: usize,
    },

    /// The write failed outright.
    #[error("write failed: {0}")]
    Io(#[source] io::Error),
}

impl IpcError {
    pub(crate) fn setup(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Setup { step, source }
    }

    /// True for the recoverable lifecycle-misuse kinds.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::NotRunning | Self::AlreadyStarted | Self::NotStarted
        )
    }
}

/// Classify the result of a single non-blocking write of `total` bytes.
pub(crate) fn write_outcome(result: io::Result<usize>, total: usize) -> Result<usize> {
    match result {
        Ok(n) if n == total => Ok(n),
        Ok(written) => Err(IpcError::PartialWrite { written, total }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(IpcError::WouldBlock),
        Err(e) => Err(IpcError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_outcome_full_write_is_ok() {
        assert_eq!(write_outcome(Ok(5), 5).unwrap(), 5);
    }

    #[test]
    fn test_write_outcome_short_write_reports_partial() {
        match write_outcome(Ok(2), 5) {
            Err(IpcError::PartialWrite { written, total }) => {
                assert_eq!(written, 2);
                assert_eq!(total, 5);
            }
            other => panic!("Expected PartialWrite, got: {other:?}"),
        }
    }

    #[test]
    fn test_write_outcome_would_block() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(write_outcome(Err(err), 5), Err(IpcError::WouldBlock)));
    }

    #[test]
    fn test_write_outcome_broken_pipe_is_io() {
        let err = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(matches!(write_outcome(Err(err), 5), Err(IpcError::Io(_))));
    }

    #[test]
    fn test_lifecycle_kinds() {
        assert!(IpcError::AlreadyRunning.is_lifecycle());
        assert!(IpcError::NotStarted.is_lifecycle());
        assert!(!IpcError::WouldBlock.is_lifecycle());
    }

    #[test]
    fn test_setup_error_names_step() {
        let err = IpcError::setup("bind")(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.to_string().starts_with("bind failed"), "got: {err}");
    }
}
