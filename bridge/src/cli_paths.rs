// Locating the `bridged` daemon binary for the client command

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// File name of the daemon executable
pub fn daemon_binary_name() -> &'static str {
    if cfg!(windows) {
        "bridged.exe"
    } else {
        "bridged"
    }
}

/// Platform fallback locations searched after `PATH`
pub fn fallback_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".local/bin"));
        locations.push(home.join(".cargo/bin"));
    }
    locations.push(PathBuf::from("/usr/local/bin"));
    locations.push(PathBuf::from("/usr/bin"));
    locations
}

/// Resolve the `bridged` binary path.
///
/// Resolution order:
/// 1) `explicit` (from `BRIDGE_DAEMON_BIN`) when it names a file
/// 2) Next to `current_exe()`, or one level up when running from `deps/`
/// 3) `PATH`
/// 4) Platform fallback locations
pub fn resolve_daemon_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured daemon binary does not exist");
    }

    if let Some(path) = beside_current_exe() {
        return Some(path);
    }

    if let Some(path) = std::env::var_os("PATH").and_then(|p| find_in_path(daemon_binary_name(), &p)) {
        return Some(path);
    }

    fallback_locations()
        .into_iter()
        .map(|dir| dir.join(daemon_binary_name()))
        .find(|candidate| candidate.is_file())
}

fn beside_current_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join(daemon_binary_name());
    if candidate.is_file() {
        return Some(candidate);
    }
    // Test binaries live in target/<profile>/deps
    if dir.file_name() == Some(OsStr::new("deps")) {
        let candidate = dir.parent()?.join(daemon_binary_name());
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Find `name` in a `PATH`-style list of directories
pub fn find_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_wins_when_present() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("my-bridged");
        std::fs::write(&bin, "").unwrap();
        assert_eq!(resolve_daemon_path(Some(&bin)), Some(bin));
    }

    #[test]
    fn test_find_in_path_checks_each_entry() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("bridged"), "").unwrap();

        let path_var = std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(
            find_in_path("bridged", &path_var),
            Some(second.path().join("bridged"))
        );
        assert_eq!(find_in_path("nope", &path_var), None);
    }

    #[test]
    fn test_directories_are_not_binaries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("bridged")).unwrap();
        let path_var = std::env::join_paths([dir.path()]).unwrap();
        assert_eq!(find_in_path("bridged", &path_var), None);
    }
}
