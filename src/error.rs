use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Errors produced by this crate.
///
/// Variants map onto the error kinds a caller needs to distinguish: connection
/// failures are fatal to a session, message-parse and JSON-decode failures let
/// the conversation continue, and control-protocol failures are reported to
/// whichever caller is waiting on the affected request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("claude binary not found")]
    CliNotFound,
    #[error("failed to spawn claude process (binary={binary:?}): {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("claude process timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("failed waiting for claude process: {0}")]
    Wait(std::io::Error),
    #[error("failed reading stdout: {0}")]
    StdoutRead(std::io::Error),
    #[error("failed reading stderr: {0}")]
    StderrRead(std::io::Error),
    #[error("failed writing stdin: {0}")]
    StdinWrite(std::io::Error),
    #[error("internal error: missing stdout pipe")]
    MissingStdout,
    #[error("internal error: missing stderr pipe")]
    MissingStderr,
    #[error("internal error: missing stdin pipe")]
    MissingStdin,
    #[error("internal error: join failure: {0}")]
    Join(String),
    #[error("request is invalid: {0}")]
    InvalidRequest(String),
    #[error("claude returned non-zero exit status: {status}")]
    NonZeroExit { status: ExitStatus },
    #[error("claude process exited unexpectedly: {0}")]
    ProcessExited(String),
    #[error("failed to parse JSON output: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("buffer exceeded {limit} bytes without completing a JSON value")]
    JsonDecode { limit: usize },
    #[error("failed to parse message: {0}")]
    MessageParse(String),
    #[error("control protocol error: {0}")]
    ControlProtocol(String),
    #[error("control protocol timed out after {timeout:?} (request_id={request_id})")]
    ControlTimeout {
        request_id: String,
        timeout: Duration,
    },
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("command line exceeds platform limit and has no --agents payload to externalize")]
    CommandTooLong,
    #[error("interrupt is not supported on this platform")]
    UnsupportedPlatform,
    #[error("working directory does not exist: {0:?}")]
    InvalidWorkingDirectory(PathBuf),
    #[error("no more messages")]
    NoMoreMessages,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
