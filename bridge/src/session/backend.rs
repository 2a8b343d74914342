//! Backend catalogue: the AI assistants a bridge can drive.
//!
//! Each backend carries the terminal markers that tell the completion
//! detector whether the assistant is still working or cancelled its own
//! reply, plus default timers. Everything here can be overridden per backend
//! through `BRIDGE_<BACKEND>_*` environment variables (see [`BackendProfile`]).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default poll interval between screen captures
const DEFAULT_POLL_MS: u64 = 500;

/// Default number of identical consecutive captures that mark a reply finished
const DEFAULT_STABLE_POLLS: u32 = 3;

/// Default wait budget for one reply (5 minutes)
const DEFAULT_MAX_WAIT_SECS: u64 = 5 * 60;

/// Default idle period before a daemon exits (10 minutes)
const DEFAULT_IDLE_SECS: u64 = 10 * 60;

/// Default number of visible lines captured per poll
const DEFAULT_CAPTURE_LINES: usize = 80;

/// Supported AI command-line assistants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Codex,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
    Claude,
}

impl Backend {
    pub const ALL: [Backend; 4] = [
        Backend::Codex,
        Backend::Gemini,
        Backend::OpenCode,
        Backend::Claude,
    ];

    /// Lowercase name used in file names and on the command line
    pub fn name(self) -> &'static str {
        match self {
            Backend::Codex => "codex",
            Backend::Gemini => "gemini",
            Backend::OpenCode => "opencode",
            Backend::Claude => "claude",
        }
    }

    /// Segment used in environment variable names (`BRIDGE_CODEX_POLL_MS`)
    pub fn env_segment(self) -> String {
        self.name().to_ascii_uppercase()
    }

    /// Text shown while the assistant is still producing a reply
    pub fn default_busy_markers(self) -> &'static [&'static str] {
        match self {
            Backend::Codex => &["esc to interrupt"],
            Backend::Gemini => &["esc to cancel"],
            Backend::OpenCode => &["esc interrupt"],
            Backend::Claude => &["esc to interrupt"],
        }
    }

    /// Text the assistant prints when its own reply was cancelled
    pub fn default_interrupt_markers(self) -> &'static [&'static str] {
        match self {
            Backend::Codex => &["■ Conversation interrupted"],
            Backend::Gemini => &["Request cancelled"],
            Backend::OpenCode => &["Session interrupted"],
            Backend::Claude => &["Interrupted by user"],
        }
    }

    /// Gemini redraws its spinner less often, so it needs one more stable poll
    fn default_stable_polls(self) -> u32 {
        match self {
            Backend::Gemini => DEFAULT_STABLE_POLLS + 1,
            _ => DEFAULT_STABLE_POLLS,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "codex" => Ok(Backend::Codex),
            "gemini" => Ok(Backend::Gemini),
            "opencode" | "open-code" => Ok(Backend::OpenCode),
            "claude" => Ok(Backend::Claude),
            other => Err(format!(
                "Unknown backend: {} (expected one of: codex, gemini, opencode, claude)",
                other
            )),
        }
    }
}

/// A set of literal, case-insensitive markers compiled to regexes
#[derive(Debug, Clone)]
pub struct MarkerSet {
    patterns: Vec<(String, Regex)>,
}

impl MarkerSet {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = markers
            .into_iter()
            .map(|m| m.as_ref().trim().to_string())
            .filter(|m| !m.is_empty())
            .filter_map(|m| {
                // Escaped literals always compile; a failure here means the
                // pattern exceeded the regex size limit, so skip it.
                Regex::new(&format!("(?i){}", regex::escape(&m)))
                    .ok()
                    .map(|re| (m, re))
            })
            .collect();
        Self { patterns }
    }

    /// Parse a comma separated override (`BRIDGE_CODEX_BUSY_MARKERS=a,b`)
    pub fn parse_list(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn literals(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(m, _)| m.as_str())
    }

    /// Byte offset of the earliest marker match in `text`
    pub fn find(&self, text: &str) -> Option<usize> {
        self.patterns
            .iter()
            .filter_map(|(_, re)| re.find(text).map(|m| m.start()))
            .min()
    }

    /// Byte offset of the latest marker match in `text`
    pub fn find_last(&self, text: &str) -> Option<usize> {
        self.patterns
            .iter()
            .filter_map(|(_, re)| re.find_iter(text).last().map(|m| m.start()))
            .max()
    }

    /// Total number of marker occurrences in `text`
    pub fn count(&self, text: &str) -> usize {
        self.patterns
            .iter()
            .map(|(_, re)| re.find_iter(text).count())
            .sum()
    }
}

/// Per-backend tuning used by the completion detector and the daemon
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub backend: Backend,
    /// `P`: interval between captures
    pub poll_interval: Duration,
    /// `K`: identical consecutive captures required for completion
    pub stable_polls: u32,
    /// `T_max`: wait budget for a single reply
    pub max_wait: Duration,
    /// Empty-queue period after which the daemon exits
    pub idle_timeout: Duration,
    /// Visible lines captured per poll
    pub capture_lines: usize,
    pub busy_markers: MarkerSet,
    pub interrupt_markers: MarkerSet,
}

impl BackendProfile {
    /// Built-in defaults for a backend, ignoring the environment
    pub fn defaults(backend: Backend) -> Self {
        Self {
            backend,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            stable_polls: backend.default_stable_polls(),
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_SECS),
            capture_lines: DEFAULT_CAPTURE_LINES,
            busy_markers: MarkerSet::new(backend.default_busy_markers()),
            interrupt_markers: MarkerSet::new(backend.default_interrupt_markers()),
        }
    }

    /// Defaults overridden from the process environment
    pub fn from_env(backend: Backend) -> Self {
        Self::from_lookup(backend, |name| std::env::var(name).ok())
    }

    /// Defaults overridden through `lookup`, which resolves variable names.
    ///
    /// For every setting the backend-specific name (`BRIDGE_CODEX_POLL_MS`)
    /// wins over the global one (`BRIDGE_POLL_MS`).
    pub fn from_lookup<F>(backend: Backend, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let segment = backend.env_segment();
        let get = |suffix: &str| -> Option<String> {
            lookup(&format!("BRIDGE_{}_{}", segment, suffix))
                .or_else(|| lookup(&format!("BRIDGE_{}", suffix)))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |suffix: &str| -> Option<u64> {
            let raw = get(suffix)?;
            match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(
                        backend = %backend,
                        setting = suffix,
                        value = %raw,
                        "ignoring malformed numeric override"
                    );
                    None
                }
            }
        };

        let mut profile = Self::defaults(backend);
        if let Some(ms) = number("POLL_MS").filter(|v| *v > 0) {
            profile.poll_interval = Duration::from_millis(ms);
        }
        if let Some(k) = number("STABLE_POLLS").filter(|v| *v > 0) {
            profile.stable_polls = u32::try_from(k).unwrap_or(u32::MAX);
        }
        if let Some(secs) = number("MAX_WAIT_SECS").filter(|v| *v > 0) {
            profile.max_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = number("IDLE_SECS").filter(|v| *v > 0) {
            profile.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(lines) = number("CAPTURE_LINES").filter(|v| *v > 0) {
            profile.capture_lines = usize::try_from(lines).unwrap_or(DEFAULT_CAPTURE_LINES);
        }
        if let Some(raw) = get("BUSY_MARKERS") {
            profile.busy_markers = MarkerSet::parse_list(&raw);
        }
        if let Some(raw) = get("INTERRUPT_MARKERS") {
            profile.interrupt_markers = MarkerSet::parse_list(&raw);
        }
        profile
    }
}
