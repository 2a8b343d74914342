// Bridge protocol - shared structs for daemon <-> client communication
// Uses framed JSON messages over the per-key Unix socket

use crate::session::backend::Backend;
use crate::session::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Bumped whenever a request or response changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single request frame (1MB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum size of a single response frame (10MB)
pub const MAX_RESPONSE_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Identity of one conversation: a backend bound to a working directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub backend: Backend,
    pub work_dir: PathBuf,
}

impl SessionKey {
    pub fn new(backend: Backend, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            work_dir: work_dir.into(),
        }
    }

    /// Build a key from a possibly relative directory, canonicalizing it so
    /// that `.` and `/abs/path` name the same daemon.
    pub fn resolve(backend: Backend, work_dir: &Path) -> std::io::Result<Self> {
        let canonical = std::fs::canonicalize(work_dir)?;
        Ok(Self::new(backend, canonical))
    }

    /// Short stable digest of the working directory
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.work_dir.to_string_lossy().as_bytes());
        let full = hex::encode(hasher.finalize());
        full[..16].to_string()
    }

    /// Name of the per-key runtime directory (`codex-1f2e3d4c5b6a7988`)
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.backend.name(), self.digest())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend, self.work_dir.display())
    }
}

/// How the caller waits for its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Enqueue and return the round handle immediately
    Background,
    /// Enqueue and block until the reply or a client-side timeout
    Foreground,
}

/// Caller-submitted unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request id
    pub id: String,
    /// Text typed into the pane
    pub payload: String,
    pub submitted_at: DateTime<Utc>,
    pub mode: RequestMode,
    /// Best-effort caller identity, for diagnostics only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// Terminal pane the caller runs in, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_pane: Option<String>,
}

impl Request {
    pub fn new(payload: impl Into<String>, mode: RequestMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
            submitted_at: Utc::now(),
            mode,
            caller: None,
            origin_pane: None,
        }
    }

    pub fn with_caller(mut self, caller: Option<String>, origin_pane: Option<String>) -> Self {
        self.caller = caller;
        self.origin_pane = origin_pane;
        self
    }
}

/// Final state of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Complete,
    Interrupted,
    TimedOut,
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyStatus::Complete => write!(f, "complete"),
            ReplyStatus::Interrupted => write!(f, "interrupted"),
            ReplyStatus::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// Finalized reply for one round. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub round: u64,
    pub request_id: String,
    pub status: ReplyStatus,
    /// Captured text; partial for interrupted and timed-out replies
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReplyStatus {
    /// Error class the client reports for a reply that did not complete
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            ReplyStatus::Complete => None,
            ReplyStatus::Interrupted => Some(ErrorCode::Interrupted),
            ReplyStatus::TimedOut => Some(ErrorCode::MalformedReply),
        }
    }
}

/// Daemon lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    Starting,
    Idle,
    Dispatching,
    Stopped,
}

/// Liveness report returned by `Ping`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub key: SessionKey,
    pub phase: DaemonPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane: Option<String>,
    pub pane_alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_error: Option<String>,
    pub resume: bool,
    pub last_round: u64,
    pub queue_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_deadline: Option<DateTime<Utc>>,
}

// ============================================================================
// Client -> Daemon requests
// ============================================================================

/// Request message from the client command to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// First frame on every connection
    Handshake { client_version: u32 },
    /// Append a request to the FIFO queue
    Enqueue {
        request: Request,
        /// Caller-supplied resume-context flag
        #[serde(default)]
        resume: bool,
    },
    /// Block until the reply for `round` is recorded
    Wait { round: u64, timeout_ms: u64 },
    /// Read the last `count` replies without enqueuing
    Pending { count: usize },
    /// Liveness check
    Ping,
    /// Request daemon to shut down gracefully
    Shutdown,
}

// ============================================================================
// Daemon -> Client responses
// ============================================================================

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Handshake {
        protocol_version: u32,
    },
    /// Request accepted; `round` is the handle to wait on
    Queued {
        round: u64,
        request_id: String,
        /// Entries ahead of this one, including an in-flight dispatch
        ahead: usize,
    },
    Reply {
        reply: Reply,
    },
    /// The daemon-side wait elapsed; the round is still pending
    WaitTimedOut {
        round: u64,
    },
    History {
        replies: Vec<Reply>,
    },
    Pong {
        status: DaemonStatus,
    },
    ShuttingDown,
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u64>,
    },
}

impl DaemonResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        DaemonResponse::Error {
            code,
            message: message.into(),
            round: None,
        }
    }
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
