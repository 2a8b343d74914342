//! Terminal Backend: addressing one pane in a terminal multiplexer.
//!
//! Two families are supported behind [`TerminalBackend`]: tmux and WezTerm.
//! The daemon only ever talks to the trait, so tests drive it with
//! [`memory::MemoryTerminal`].

pub mod memory;
pub mod tmux;
pub mod wezterm;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryTerminal;
pub use tmux::TmuxTerminal;
pub use wezterm::WeztermTerminal;

/// Default upper bound for a single multiplexer CLI invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// CSI and OSC escape sequences, plus stray single-character escapes
static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI regex is valid")
});

/// Multiplexer family hosting a pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    Tmux,
    Wezterm,
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalKind::Tmux => write!(f, "tmux"),
            TerminalKind::Wezterm => write!(f, "wezterm"),
        }
    }
}

impl std::str::FromStr for TerminalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmux" => Ok(TerminalKind::Tmux),
            "wezterm" => Ok(TerminalKind::Wezterm),
            other => Err(format!(
                "Unknown terminal: {} (expected tmux or wezterm)",
                other
            )),
        }
    }
}

/// How to find the pane for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneTarget {
    /// Explicit pane id (`%3` for tmux, `12` for WezTerm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    /// Prefix of the pane title to look for when no id is known
    pub title_marker: String,
}

impl PaneTarget {
    pub fn by_id(pane_id: impl Into<String>, title_marker: impl Into<String>) -> Self {
        Self {
            pane_id: Some(pane_id.into()),
            title_marker: title_marker.into(),
        }
    }

    pub fn by_title(title_marker: impl Into<String>) -> Self {
        Self {
            pane_id: None,
            title_marker: title_marker.into(),
        }
    }
}

/// A resolved, addressable pane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneHandle {
    pub terminal: TerminalKind,
    pub pane_id: String,
}

impl std::fmt::Display for PaneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.terminal, self.pane_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("pane {0} no longer exists")]
    PaneMissing(String),

    #[error("no pane matches {0}")]
    NotFound(String),

    #[error("{program} {action} failed: {stderr}")]
    CommandFailed {
        program: String,
        action: String,
        stderr: String,
    },

    #[error("{program} {action} timed out after {after:?}")]
    Timeout {
        program: String,
        action: String,
        after: Duration,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected {program} output: {detail}")]
    Parse { program: String, detail: String },
}

impl TerminalError {
    /// Whether the session's pane is gone (or never existed)
    pub fn is_pane_missing(&self) -> bool {
        matches!(self, TerminalError::PaneMissing(_) | TerminalError::NotFound(_))
    }
}

/// Capability interface over one multiplexer family.
///
/// `send` delivers text as if typed and then submits it as a separate step.
/// `capture` returns only the visible tail of the buffer (`lines` deep).
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    fn kind(&self) -> TerminalKind;

    /// Resolve a target to a live pane
    async fn open(&self, target: &PaneTarget) -> Result<PaneHandle, TerminalError>;

    async fn send(&self, pane: &PaneHandle, text: &str, submit: bool) -> Result<(), TerminalError>;

    async fn capture(&self, pane: &PaneHandle, lines: usize) -> Result<String, TerminalError>;

    async fn exists(&self, pane: &PaneHandle) -> Result<bool, TerminalError>;
}

/// Binaries and timings for the real multiplexers, read from the environment
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub tmux_bin: PathBuf,
    /// tmux `-L` socket name
    pub tmux_socket: Option<String>,
    /// Pause between paste and Enter
    pub tmux_enter_delay: Duration,
    pub wezterm_bin: PathBuf,
    /// WezTerm `--class` for selecting a GUI instance
    pub wezterm_class: Option<String>,
    /// Pause after a multiline paste before submitting
    pub wezterm_paste_delay: Duration,
    /// Limit for one CLI call; slower calls fail without marking the pane gone
    pub command_timeout: Duration,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            tmux_bin: PathBuf::from("tmux"),
            tmux_socket: None,
            tmux_enter_delay: Duration::from_millis(100),
            wezterm_bin: PathBuf::from("wezterm"),
            wezterm_class: None,
            wezterm_paste_delay: Duration::from_millis(200),
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl TerminalSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::default();
        if let Some(bin) = var("BRIDGE_TMUX_BIN") {
            settings.tmux_bin = PathBuf::from(bin);
        }
        settings.tmux_socket = var("BRIDGE_TMUX_SOCKET");
        if let Some(raw) = var("BRIDGE_TMUX_ENTER_DELAY_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => settings.tmux_enter_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %raw, "ignoring malformed BRIDGE_TMUX_ENTER_DELAY_MS"),
            }
        }
        if let Some(bin) = var("BRIDGE_WEZTERM_BIN") {
            settings.wezterm_bin = PathBuf::from(bin);
        }
        settings.wezterm_class = var("BRIDGE_WEZTERM_CLASS");
        if let Some(raw) = var("BRIDGE_TERMINAL_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => settings.command_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(value = %raw, "ignoring malformed BRIDGE_TERMINAL_TIMEOUT_MS"),
            }
        }
        settings
    }
}

/// Build the backend for a multiplexer family
pub fn backend_for(kind: TerminalKind, settings: &TerminalSettings) -> Arc<dyn TerminalBackend> {
    match kind {
        TerminalKind::Tmux => Arc::new(TmuxTerminal::new(settings)),
        TerminalKind::Wezterm => Arc::new(WeztermTerminal::new(settings)),
    }
}

/// Normalize a payload before it is typed: drop carriage returns, trim edges
pub fn sanitize_payload(text: &str) -> String {
    text.replace('\r', "").trim().to_string()
}

/// Remove terminal escape sequences from captured text
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Keep the last `lines` lines of `text`
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Stdout of a finished multiplexer command
pub(crate) struct CommandOutput {
    pub stdout: String,
}

/// Run a multiplexer CLI command, failing on a non-zero exit or after
/// `timeout`.
///
/// `input` is written to the child's stdin when present.
pub(crate) async fn run_command<I, S>(
    program: &std::path::Path,
    args: I,
    input: Option<&str>,
    action: &str,
    timeout: Duration,
) -> Result<CommandOutput, TerminalError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    use tokio::io::AsyncWriteExt;

    let program_name = program.display().to_string();
    let spawn_error = |source| TerminalError::Spawn {
        program: program_name.clone(),
        source,
    };
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        })
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let run = async {
        let mut child = command.spawn()?;
        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(result) => result.map_err(spawn_error)?,
        Err(_) => {
            return Err(TerminalError::Timeout {
                program: program_name,
                action: action.to_string(),
                after: timeout,
            })
        }
    };

    if !output.status.success() {
        return Err(TerminalError::CommandFailed {
            program: program_name,
            action: action.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}
