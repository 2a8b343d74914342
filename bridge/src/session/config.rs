// Environment configuration helpers for the bridge
// Handles platform-specific runtime paths for sockets, PID files, and history

use crate::session::protocol::SessionKey;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of replies kept in the history file
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default number of client attempts for transient failures
pub const DEFAULT_CLIENT_RETRIES: u32 = 3;

/// Default age after which a spawn lease is stale even if its holder lives
pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Paths for one (backend, directory) daemon
#[derive(Debug, Clone)]
pub struct Config {
    /// Root shared by every key (`$XDG_RUNTIME_DIR/pane-bridge`)
    pub runtime_root: PathBuf,
    /// Per-key directory holding the files below
    pub key_dir: PathBuf,
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    /// Spawn lease
    pub lock_file: PathBuf,
    /// Bounded reply history with the round counter
    pub history_file: PathBuf,
    pub log_file: PathBuf,
}

impl Config {
    /// Paths for `key` under the default runtime root
    pub fn for_key(key: &SessionKey) -> Self {
        Self::with_root(Self::default_runtime_dir(), key)
    }

    /// Paths for `key` under an explicit runtime root
    pub fn with_root(root: impl Into<PathBuf>, key: &SessionKey) -> Self {
        let runtime_root = root.into();
        let key_dir = runtime_root.join(key.dir_name());
        Self {
            socket_path: key_dir.join("daemon.sock"),
            pid_file: key_dir.join("daemon.pid"),
            lock_file: key_dir.join("spawn.lock"),
            history_file: key_dir.join("history.json"),
            log_file: key_dir.join("daemon.log"),
            key_dir,
            runtime_root,
        }
    }

    /// Get the default runtime root
    ///
    /// `BRIDGE_RUNTIME_DIR` wins; Linux then prefers `XDG_RUNTIME_DIR`; every
    /// platform falls back to `~/.pane-bridge/run`.
    pub fn default_runtime_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("BRIDGE_RUNTIME_DIR").filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
                return PathBuf::from(runtime_dir).join("pane-bridge");
            }
        }

        Self::home_runtime_dir()
    }

    fn home_runtime_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".pane-bridge").join("run"))
            .unwrap_or_else(|| std::env::temp_dir().join("pane-bridge"))
    }

    /// Ensure the runtime root and key directory exist with 0700 permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.key_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&self.runtime_root, &self.key_dir] {
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        Ok(())
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        remove_if_exists(&self.pid_file)
    }

    /// Remove the PID file only while it still names this process
    pub fn remove_own_pid(&self) -> std::io::Result<()> {
        if self.read_pid() == Some(std::process::id()) {
            self.remove_pid()
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        remove_if_exists(&self.socket_path)
    }

    /// Check if the daemon socket exists (indicating daemon may be running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if a process with the stored PID is still running
    pub fn is_daemon_running(&self) -> bool {
        self.read_pid().map(process_alive).unwrap_or(false)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check whether `pid` names a live process
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only probes; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// TODO(windows): Implement Windows process check
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Knobs shared by the client and the daemon, read from `BRIDGE_*` variables
#[derive(Debug, Clone)]
pub struct Settings {
    pub history_limit: usize,
    pub client_retries: u32,
    pub lease_ttl: Duration,
    /// Explicit daemon binary
    pub daemon_bin: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            client_retries: DEFAULT_CLIENT_RETRIES,
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            daemon_bin: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |name: &str| -> Option<u64> {
            let raw = get(name)?;
            raw.parse::<u64>()
                .map_err(|_| tracing::warn!(setting = name, value = %raw, "ignoring malformed setting"))
                .ok()
        };

        let mut settings = Self::default();
        if let Some(limit) = number("BRIDGE_HISTORY_LIMIT").filter(|v| *v > 0) {
            settings.history_limit = usize::try_from(limit).unwrap_or(DEFAULT_HISTORY_LIMIT);
        }
        if let Some(retries) = number("BRIDGE_CLIENT_RETRIES") {
            settings.client_retries = u32::try_from(retries).unwrap_or(DEFAULT_CLIENT_RETRIES);
        }
        if let Some(secs) = number("BRIDGE_LEASE_TTL_SECS").filter(|v| *v > 0) {
            settings.lease_ttl = Duration::from_secs(secs);
        }
        settings.daemon_bin = get("BRIDGE_DAEMON_BIN").map(PathBuf::from);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::Backend;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn key() -> SessionKey {
        SessionKey::new(Backend::Codex, "/work/app")
    }

    #[test]
    fn test_paths_live_in_key_dir() {
        let config = Config::with_root("/run/bridge", &key());
        assert_eq!(config.runtime_root, PathBuf::from("/run/bridge"));
        assert_eq!(config.key_dir, PathBuf::from("/run/bridge").join(key().dir_name()));
        for path in [
            &config.socket_path,
            &config.pid_file,
            &config.lock_file,
            &config.history_file,
            &config.log_file,
        ] {
            assert!(path.starts_with(&config.key_dir), "{:?}", path);
        }
        assert!(config.socket_path.ends_with("daemon.sock"));
        assert!(config.history_file.ends_with("history.json"));
    }

    #[test]
    fn test_keys_do_not_share_directories() {
        let gemini = SessionKey::new(Backend::Gemini, "/work/app");
        let a = Config::with_root("/r", &key());
        let b = Config::with_root("/r", &gemini);
        assert_ne!(a.key_dir, b.key_dir);
    }

    #[test]
    fn test_pid_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_root(temp_dir.path(), &key());

        config.write_pid().unwrap();
        let pid = config.read_pid().unwrap();
        assert_eq!(pid, std::process::id());
        assert!(config.is_daemon_running());

        config.remove_own_pid().unwrap();
        assert!(config.read_pid().is_none());
        // Removing twice is fine
        config.remove_pid().unwrap();
    }

    #[test]
    fn test_remove_own_pid_keeps_foreign_pid() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_root(temp_dir.path(), &key());
        config.ensure_dirs().unwrap();
        std::fs::write(&config.pid_file, "1").unwrap();
        config.remove_own_pid().unwrap();
        assert_eq!(config.read_pid(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dirs_creates_dirs_with_0700() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_root(temp_dir.path().join("runtime"), &key());
        config.ensure_dirs().unwrap();

        for dir in [&config.runtime_root, &config.key_dir] {
            let mode = std::fs::metadata(dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700, "{:?} should have 0700 permissions", dir);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_settings_from_lookup() {
        let map: HashMap<&str, &str> = [
            ("BRIDGE_HISTORY_LIMIT", "5"),
            ("BRIDGE_CLIENT_RETRIES", "0"),
            ("BRIDGE_LEASE_TTL_SECS", "soon"),
            ("BRIDGE_DAEMON_BIN", "/opt/bridged"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|name| map.get(name).map(|v| v.to_string()));
        assert_eq!(settings.history_limit, 5);
        assert_eq!(settings.client_retries, 0);
        assert_eq!(settings.lease_ttl, Duration::from_secs(DEFAULT_LEASE_TTL_SECS));
        assert_eq!(settings.daemon_bin, Some(PathBuf::from("/opt/bridged")));
    }
}
