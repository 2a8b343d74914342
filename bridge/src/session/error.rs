// Error taxonomy shared by the daemon and the client command.
// Every error carries a machine-readable code that maps to a distinct exit code.

use crate::session::protocol::Reply;
use crate::session::terminal::TerminalError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Machine-readable error status exchanged over the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,
    InvalidRequest,
    LockContention,
    DaemonUnreachable,
    BackendPaneMissing,
    Timeout,
    Interrupted,
    MalformedReply,
    RecursiveDispatch,
    VersionMismatch,
    DaemonStopping,
}

impl ErrorCode {
    /// Process exit code for the client command
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Internal => 1,
            ErrorCode::InvalidRequest => 2,
            ErrorCode::LockContention => 10,
            ErrorCode::DaemonUnreachable => 11,
            ErrorCode::BackendPaneMissing => 12,
            ErrorCode::Timeout => 13,
            ErrorCode::Interrupted => 14,
            ErrorCode::MalformedReply => 15,
            ErrorCode::RecursiveDispatch => 16,
            ErrorCode::VersionMismatch => 17,
            ErrorCode::DaemonStopping => 18,
        }
    }

    /// Conditions the client retries on its own.
    ///
    /// `DaemonStopping` is included because a daemon that is exiting on idle
    /// expiry is replaced by a fresh one on the next attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::LockContention | ErrorCode::DaemonUnreachable | ErrorCode::DaemonStopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::LockContention => "lock_contention",
            ErrorCode::DaemonUnreachable => "daemon_unreachable",
            ErrorCode::BackendPaneMissing => "backend_pane_missing",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Interrupted => "interrupted",
            ErrorCode::MalformedReply => "malformed_reply",
            ErrorCode::RecursiveDispatch => "recursive_dispatch",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::DaemonStopping => "daemon_stopping",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("another process (pid {holder}) is spawning the daemon for {key}")]
    LockContention { key: String, holder: u32 },

    #[error("daemon for {key} is unreachable: {reason}")]
    DaemonUnreachable { key: String, reason: String },

    #[error("terminal pane {pane} is gone; re-establish the session before retrying")]
    BackendPaneMissing { pane: String },

    #[error("no reply for round {round} within {waited:?}; the request keeps running in the daemon")]
    Timeout { round: u64, waited: Duration },

    #[error("round {} was interrupted by the backend", .reply.round)]
    Interrupted { reply: Box<Reply> },

    #[error("round {} did not settle before the wait budget ran out", .reply.round)]
    MalformedReply { reply: Box<Reply> },

    #[error("request from pane {pane} targets the session it is running in")]
    RecursiveDispatch { pane: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("daemon is stopping")]
    DaemonStopping,

    #[error("internal error: {0}")]
    Internal(String),

    /// Error reported by the daemon, passed through with its original code
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::LockContention { .. } => ErrorCode::LockContention,
            BridgeError::DaemonUnreachable { .. } => ErrorCode::DaemonUnreachable,
            BridgeError::BackendPaneMissing { .. } => ErrorCode::BackendPaneMissing,
            BridgeError::Timeout { .. } => ErrorCode::Timeout,
            BridgeError::Interrupted { .. } => ErrorCode::Interrupted,
            BridgeError::MalformedReply { .. } => ErrorCode::MalformedReply,
            BridgeError::RecursiveDispatch { .. } => ErrorCode::RecursiveDispatch,
            BridgeError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            BridgeError::VersionMismatch(_) => ErrorCode::VersionMismatch,
            BridgeError::DaemonStopping => ErrorCode::DaemonStopping,
            BridgeError::Internal(_) => ErrorCode::Internal,
            BridgeError::Remote { code, .. } => *code,
            BridgeError::Terminal(e) if e.is_pane_missing() => ErrorCode::BackendPaneMissing,
            BridgeError::Terminal(_) => ErrorCode::Internal,
            BridgeError::Io(_) => ErrorCode::Internal,
            BridgeError::Protocol(_) => ErrorCode::InvalidRequest,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    /// Rebuild an error from a daemon `Error` response
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::DaemonStopping => BridgeError::DaemonStopping,
            ErrorCode::InvalidRequest => BridgeError::InvalidRequest(message),
            ErrorCode::VersionMismatch => BridgeError::VersionMismatch(message),
            code => BridgeError::Remote { code, message },
        }
    }

    /// Pass a complete reply through; other finalized replies become errors
    /// that still carry the reply and its partial text
    pub fn from_reply(reply: Reply) -> Result<Reply, BridgeError> {
        match reply.status.error_code() {
            None => Ok(reply),
            Some(ErrorCode::Interrupted) => Err(BridgeError::Interrupted {
                reply: Box::new(reply),
            }),
            Some(_) => Err(BridgeError::MalformedReply {
                reply: Box::new(reply),
            }),
        }
    }

    /// The finalized reply behind an unsuccessful round
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            BridgeError::Interrupted { reply } | BridgeError::MalformedReply { reply } => Some(reply.as_ref()),
            _ => None,
        }
    }
}
