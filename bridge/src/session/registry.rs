// Session Registry: which pane hosts each (backend, directory) conversation
// Replies and the round counter are persisted to history.json with atomic writes

use crate::session::backend::Backend;
use crate::session::protocol::{Reply, ReplyStatus, SessionKey};
use crate::session::terminal::{PaneHandle, PaneTarget, TerminalKind};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory, relative to a project, holding per-backend session files
pub const PROJECT_SESSION_DIR: &str = ".pane-bridge";

/// Round counters still legible in a damaged history file
static ROUND_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(round|last_round|next_round)"\s*:\s*(\d+)"#).expect("round regex is valid")
});

/// Title prefix used to find a backend's pane when no id is configured
pub fn title_marker(backend: Backend) -> String {
    format!("BRIDGE:{}", backend)
}

/// Project file describing where a backend's pane lives
/// (`.pane-bridge/codex-session.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSessionFile {
    #[serde(default)]
    pub terminal: Option<TerminalKind>,
    #[serde(default)]
    pub pane_id: Option<String>,
    #[serde(default)]
    pub title_marker: Option<String>,
    #[serde(default)]
    pub resume: Option<bool>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ProjectSessionFile {
    pub fn file_name(backend: Backend) -> String {
        format!("{}-session.json", backend)
    }

    /// Walk up from `work_dir` to the first active session file for `backend`
    pub fn find(work_dir: &Path, backend: Backend) -> Option<(PathBuf, Self)> {
        let name = Self::file_name(backend);
        for dir in work_dir.ancestors() {
            let candidate = dir.join(PROJECT_SESSION_DIR).join(&name);
            if !candidate.is_file() {
                continue;
            }
            match fs::read_to_string(&candidate)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<Self>(&raw).map_err(anyhow::Error::from))
            {
                Ok(file) if file.active => return Some((candidate, file)),
                Ok(_) => {
                    tracing::debug!(path = %candidate.display(), "skipping inactive session file");
                }
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "ignoring unreadable session file");
                }
            }
        }
        None
    }
}

/// Where a session's pane comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Environment,
    ProjectFile,
    TitleMarker,
}

/// Resolved description of how to reach a backend's pane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub terminal: TerminalKind,
    pub pane: PaneTarget,
    pub resume: bool,
    pub source: TargetSource,
}

impl SessionTarget {
    /// Discover the pane for `key` from the process environment
    pub fn discover(key: &SessionKey) -> Self {
        Self::discover_with(key, |name| std::env::var(name).ok())
    }

    /// Discovery order: `BRIDGE_<BACKEND>_PANE`, then the project session
    /// file, then the title marker. The terminal family comes from the file,
    /// then `BRIDGE_<BACKEND>_TERMINAL`, then `WEZTERM_PANE` / `TMUX`.
    pub fn discover_with<F>(key: &SessionKey, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let segment = key.backend.env_segment();
        let var = |name: String| lookup(&name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let file = ProjectSessionFile::find(&key.work_dir, key.backend).map(|(_, f)| f);

        let env_pane = var(format!("BRIDGE_{}_PANE", segment));
        let file_pane = file.as_ref().and_then(|f| f.pane_id.clone());
        let (pane_id, source) = match (env_pane, file_pane) {
            (Some(id), _) => (Some(id), TargetSource::Environment),
            (None, Some(id)) => (Some(id), TargetSource::ProjectFile),
            (None, None) => (None, TargetSource::TitleMarker),
        };

        let marker = file
            .as_ref()
            .and_then(|f| f.title_marker.clone())
            .unwrap_or_else(|| title_marker(key.backend));

        let env_terminal = var(format!("BRIDGE_{}_TERMINAL", segment)).and_then(|raw| {
            raw.parse::<TerminalKind>()
                .map_err(|e| tracing::warn!(error = %e, "ignoring terminal override"))
                .ok()
        });
        let detected = if lookup("WEZTERM_PANE").is_some() {
            Some(TerminalKind::Wezterm)
        } else if lookup("TMUX").is_some() {
            Some(TerminalKind::Tmux)
        } else {
            None
        };
        let terminal = file
            .as_ref()
            .and_then(|f| f.terminal)
            .or(env_terminal)
            .or(detected)
            .unwrap_or(TerminalKind::Tmux);

        Self {
            terminal,
            pane: PaneTarget {
                pane_id,
                title_marker: marker,
            },
            resume: file.and_then(|f| f.resume).unwrap_or(false),
            source,
        }
    }
}

/// Live record of one conversation, owned by its daemon
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub target: SessionTarget,
    /// Pane resolved by the last successful `open`
    pub pane: Option<PaneHandle>,
    /// Caller-supplied resume-context flag
    pub resume: bool,
    pub last_round: u64,
    /// The last finalized reply was interrupted
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

/// On-disk form of a session's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryFile {
    #[serde(default)]
    pub daemon_pid: Option<u32>,
    /// Next round number to hand out
    pub next_round: u64,
    pub last_round: u64,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub replies: VecDeque<Reply>,
    pub updated_at: DateTime<Utc>,
}

impl Default for HistoryFile {
    fn default() -> Self {
        Self {
            daemon_pid: None,
            next_round: 1,
            last_round: 0,
            resume: false,
            replies: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }
}

impl HistoryFile {
    /// Read a history file; a missing or empty file yields `None`
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file: {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let file = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse history file: {}", path.display()))?;
        Ok(Some(file))
    }

    /// Last `n` replies, oldest first
    pub fn last(&self, n: usize) -> Vec<Reply> {
        let skip = self.replies.len().saturating_sub(n);
        self.replies.iter().skip(skip).cloned().collect()
    }
}

/// Bounded reply history for one key, optionally backed by a file
#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    limit: usize,
    state: HistoryFile,
}

impl HistoryStore {
    pub fn in_memory(limit: usize) -> Self {
        Self {
            path: None,
            limit: limit.max(1),
            state: HistoryFile::default(),
        }
    }

    /// Open a file-backed store. A corrupt file is moved aside and the new
    /// history continues after the highest round still legible in it.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> Self {
        let path = path.into();
        let state = match HistoryFile::read(&path) {
            Ok(Some(state)) => state,
            Ok(None) => HistoryFile::default(),
            Err(e) => recover_corrupt(&path, &e),
        };
        let mut store = Self {
            path: Some(path),
            limit: limit.max(1),
            state,
        };
        store.state.next_round = store.state.next_round.max(store.state.last_round + 1);
        store.trim();
        store
    }

    pub fn state(&self) -> &HistoryFile {
        &self.state
    }

    pub fn next_round(&self) -> u64 {
        self.state.next_round
    }

    pub fn last_round(&self) -> u64 {
        self.state.last_round
    }

    /// Hand out the next round number and persist the counter
    pub fn reserve_round(&mut self) -> Result<u64> {
        let round = self.state.next_round;
        self.state.next_round += 1;
        self.save()?;
        Ok(round)
    }

    pub fn record(&mut self, reply: Reply) -> Result<()> {
        if reply.round <= self.state.last_round {
            bail!(
                "round {} is not after last recorded round {}",
                reply.round,
                self.state.last_round
            );
        }
        self.state.last_round = reply.round;
        self.state.next_round = self.state.next_round.max(reply.round + 1);
        self.state.replies.push_back(reply);
        self.trim();
        self.save()
    }

    pub fn find(&self, round: u64) -> Option<&Reply> {
        self.state.replies.iter().find(|r| r.round == round)
    }

    pub fn set_owner(&mut self, pid: Option<u32>, resume: bool) -> Result<()> {
        self.state.daemon_pid = pid;
        self.state.resume = resume;
        self.save()
    }

    fn trim(&mut self) {
        while self.state.replies.len() > self.limit {
            self.state.replies.pop_front();
        }
    }

    fn save(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(&self.state)
            .with_context(|| "Failed to serialize history")?;
        atomic_write(path, &contents)
    }
}

/// Fresh history for a file that failed to parse, without reusing its rounds
fn recover_corrupt(path: &Path, error: &anyhow::Error) -> HistoryFile {
    let floor = fs::read_to_string(path)
        .map(|raw| salvage_round_floor(&raw))
        .unwrap_or(1);
    let aside = path.with_extension(format!("json.corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    match fs::rename(path, &aside) {
        Ok(()) => tracing::error!(
            path = %path.display(),
            kept = %aside.display(),
            next_round = floor,
            error = %error,
            "history file is corrupt, starting a new one"
        ),
        Err(e) => tracing::error!(
            path = %path.display(),
            next_round = floor,
            error = %error,
            rename_error = %e,
            "history file is corrupt and could not be moved aside"
        ),
    }
    HistoryFile {
        next_round: floor,
        last_round: floor - 1,
        ..HistoryFile::default()
    }
}

/// First round number above every counter found in `raw`
fn salvage_round_floor(raw: &str) -> u64 {
    ROUND_FIELD_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let value: u64 = caps[2].parse().ok()?;
            // next_round is already the floor; other counters name used rounds
            Some(if &caps[1] == "next_round" { value } else { value.saturating_add(1) })
        })
        .fold(1, u64::max)
}

struct Entry {
    session: Session,
    history: HistoryStore,
}

impl Entry {
    fn new(key: SessionKey, target: SessionTarget, history: HistoryStore) -> Self {
        let session = Session {
            key,
            resume: target.resume || history.state().resume,
            target,
            pane: None,
            last_round: history.last_round(),
            interrupted: history
                .state()
                .replies
                .back()
                .map(|r| r.status == ReplyStatus::Interrupted)
                .unwrap_or(false),
            created_at: Utc::now(),
        };
        Self { session, history }
    }
}

/// Sessions known to this process, keyed by (backend, directory)
pub struct SessionRegistry {
    limit: usize,
    entries: HashMap<SessionKey, Entry>,
}

impl SessionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: HashMap::new(),
        }
    }

    /// Register `key` with an explicit target and history store
    pub fn attach(&mut self, key: SessionKey, target: SessionTarget, history: HistoryStore) -> &mut Session {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(key, target, history));
        &mut entry.session
    }

    /// Session for `key`, discovering its pane from the environment and
    /// keeping history in memory when the key is new
    pub fn get_or_create(&mut self, key: &SessionKey) -> &mut Session {
        let limit = self.limit;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            Entry::new(
                key.clone(),
                SessionTarget::discover(key),
                HistoryStore::in_memory(limit),
            )
        });
        &mut entry.session
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        self.entries.get(key).map(|e| &e.session)
    }

    pub fn session_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.entries.get_mut(key).map(|e| &mut e.session)
    }

    pub fn reserve_round(&mut self, key: &SessionKey) -> Result<u64> {
        self.entry_mut(key)?.history.reserve_round()
    }

    /// Finalize a round: append the reply and advance the session
    pub fn record_dispatch(&mut self, key: &SessionKey, reply: Reply) -> Result<()> {
        let entry = self.entry_mut(key)?;
        let round = reply.round;
        let interrupted = reply.status == ReplyStatus::Interrupted;
        entry.history.record(reply)?;
        entry.session.last_round = round;
        entry.session.interrupted = interrupted;
        Ok(())
    }

    /// Last `n` replies for `key`, oldest first
    pub fn history(&self, key: &SessionKey, n: usize) -> Vec<Reply> {
        self.entries
            .get(key)
            .map(|e| e.history.state().last(n))
            .unwrap_or_default()
    }

    pub fn find_reply(&self, key: &SessionKey, round: u64) -> Option<Reply> {
        self.entries.get(key)?.history.find(round).cloned()
    }

    pub fn next_round(&self, key: &SessionKey) -> u64 {
        self.entries
            .get(key)
            .map(|e| e.history.next_round())
            .unwrap_or(1)
    }

    pub fn last_round(&self, key: &SessionKey) -> u64 {
        self.entries
            .get(key)
            .map(|e| e.history.last_round())
            .unwrap_or(0)
    }

    pub fn set_resume(&mut self, key: &SessionKey, resume: bool) -> Result<()> {
        let entry = self.entry_mut(key)?;
        if entry.session.resume == resume {
            return Ok(());
        }
        entry.session.resume = resume;
        let pid = entry.history.state().daemon_pid;
        entry.history.set_owner(pid, resume)
    }

    pub fn set_owner(&mut self, key: &SessionKey, pid: Option<u32>) -> Result<()> {
        let entry = self.entry_mut(key)?;
        let resume = entry.session.resume;
        entry.history.set_owner(pid, resume)
    }

    /// Drop the in-memory session; persisted history stays on disk
    pub fn forget(&mut self, key: &SessionKey) -> Option<Session> {
        self.entries.remove(key).map(|e| e.session)
    }

    fn entry_mut(&mut self, key: &SessionKey) -> Result<&mut Entry> {
        match self.entries.get_mut(key) {
            Some(entry) => Ok(entry),
            None => bail!("no session registered for {}", key),
        }
    }
}

/// Atomically save data to a file using write-to-temp + rename
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    // Temp file in the same directory keeps the rename on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use tempfile::TempDir;

    fn reply(round: u64, status: ReplyStatus) -> Reply {
        let now = Utc::now();
        Reply {
            round,
            request_id: format!("req-{}", round),
            status,
            text: format!("answer {}", round),
            started_at: now,
            finished_at: now,
        }
    }

    fn target() -> SessionTarget {
        SessionTarget {
            terminal: TerminalKind::Tmux,
            pane: PaneTarget::by_id("%1", "BRIDGE:codex"),
            resume: false,
            source: TargetSource::Environment,
        }
    }

    #[test]
    fn test_rounds_strictly_increase_and_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        let key = SessionKey::new(Backend::Codex, "/work");

        let mut registry = SessionRegistry::new(10);
        registry.attach(key.clone(), target(), HistoryStore::open(&path, 10));
        assert_eq!(registry.reserve_round(&key).unwrap(), 1);
        assert_eq!(registry.reserve_round(&key).unwrap(), 2);
        registry.record_dispatch(&key, reply(1, ReplyStatus::Complete)).unwrap();
        registry.record_dispatch(&key, reply(2, ReplyStatus::Interrupted)).unwrap();
        assert!(registry.record_dispatch(&key, reply(2, ReplyStatus::Complete)).is_err());
        assert!(registry.session(&key).unwrap().interrupted);

        // A fresh store continues after the persisted counter
        let mut reopened = HistoryStore::open(&path, 10);
        assert_eq!(reopened.last_round(), 2);
        assert_eq!(reopened.reserve_round().unwrap(), 3);
        assert_eq!(reopened.find(1).unwrap().text, "answer 1");
    }

    #[test]
    fn test_reserved_rounds_are_not_reused_after_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        let mut store = HistoryStore::open(&path, 10);
        assert_eq!(store.reserve_round().unwrap(), 1);
        assert_eq!(store.reserve_round().unwrap(), 2);
        // Daemon died before dispatching either round
        let mut reopened = HistoryStore::open(&path, 10);
        assert_eq!(reopened.reserve_round().unwrap(), 3);
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let mut store = HistoryStore::in_memory(3);
        for round in 1..=5 {
            store.reserve_round().unwrap();
            store.record(reply(round, ReplyStatus::Complete)).unwrap();
        }
        let rounds: Vec<u64> = store.state().last(10).iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![3, 4, 5]);
        let last_two: Vec<u64> = store.state().last(2).iter().map(|r| r.round).collect();
        assert_eq!(last_two, vec![4, 5]);
        assert!(store.find(1).is_none());
    }

    #[test]
    fn test_corrupt_history_starts_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        fs::write(&path, "{not json").unwrap();
        let store = HistoryStore::open(&path, 10);
        assert_eq!(store.next_round(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_history_keeps_round_floor() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        // Truncated mid-write
        fs::write(
            &path,
            r#"{"daemon_pid":null,"next_round":8,"last_round":6,"replies":[{"round":5,"request_id":"a"},{"round":6,"req"#,
        )
        .unwrap();

        let mut store = HistoryStore::open(&path, 10);
        assert_eq!(store.next_round(), 8);
        assert_eq!(store.last_round(), 7);
        assert_eq!(store.reserve_round().unwrap(), 8);

        // The damaged file is kept next to the new one
        let kept: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("history.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(HistoryFile::read(&path).unwrap().unwrap().next_round, 9);
    }

    #[test]
    fn test_salvage_round_floor() {
        assert_eq!(salvage_round_floor(""), 1);
        assert_eq!(salvage_round_floor(r#"{"round": 12, "round":3"#), 13);
        assert_eq!(salvage_round_floor(r#""next_round":4,"last_round":9"#), 10);
    }

    #[test]
    fn test_forget_keeps_disk_history() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        let key = SessionKey::new(Backend::Gemini, "/work");
        let mut registry = SessionRegistry::new(10);
        registry.attach(key.clone(), target(), HistoryStore::open(&path, 10));
        registry.reserve_round(&key).unwrap();
        registry.record_dispatch(&key, reply(1, ReplyStatus::Complete)).unwrap();

        assert!(registry.forget(&key).is_some());
        assert!(registry.history(&key, 5).is_empty());
        let file = HistoryFile::read(&path).unwrap().unwrap();
        assert_eq!(file.last(5).len(), 1);
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: Map<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_discovery_prefers_env_pane() {
        let temp = TempDir::new().unwrap();
        let key = SessionKey::new(Backend::Codex, temp.path());
        let found = SessionTarget::discover_with(&key, lookup(&[("BRIDGE_CODEX_PANE", "%9"), ("TMUX", "/tmp/tmux")]));
        assert_eq!(found.pane.pane_id.as_deref(), Some("%9"));
        assert_eq!(found.pane.title_marker, "BRIDGE:codex");
        assert_eq!(found.source, TargetSource::Environment);
        assert_eq!(found.terminal, TerminalKind::Tmux);
    }

    #[test]
    fn test_discovery_walks_up_to_project_file() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(temp.path().join(PROJECT_SESSION_DIR)).unwrap();
        fs::write(
            temp.path().join(PROJECT_SESSION_DIR).join("gemini-session.json"),
            r#"{"terminal":"wezterm","pane_id":"7","resume":true}"#,
        )
        .unwrap();

        let key = SessionKey::new(Backend::Gemini, &nested);
        let found = SessionTarget::discover_with(&key, lookup(&[("TMUX", "/tmp/tmux")]));
        assert_eq!(found.terminal, TerminalKind::Wezterm);
        assert_eq!(found.pane.pane_id.as_deref(), Some("7"));
        assert_eq!(found.source, TargetSource::ProjectFile);
        assert!(found.resume);
    }

    #[test]
    fn test_discovery_skips_inactive_file_and_falls_back_to_title() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(PROJECT_SESSION_DIR)).unwrap();
        fs::write(
            temp.path().join(PROJECT_SESSION_DIR).join("claude-session.json"),
            r#"{"pane_id":"%2","active":false}"#,
        )
        .unwrap();

        let key = SessionKey::new(Backend::Claude, temp.path());
        let found = SessionTarget::discover_with(
            &key,
            lookup(&[("BRIDGE_CLAUDE_TERMINAL", "wezterm")]),
        );
        assert_eq!(found.pane.pane_id, None);
        assert_eq!(found.source, TargetSource::TitleMarker);
        assert_eq!(found.terminal, TerminalKind::Wezterm);
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("history.json");

        atomic_write(&path, "{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }
}
