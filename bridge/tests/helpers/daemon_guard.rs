use super::polling::{wait_for_removal, WaitError};
use pane_bridge::session::backend::Backend;
use pane_bridge::session::config::{process_alive, Config};
use pane_bridge::session::protocol::SessionKey;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in for `tmux`: one pane `%1` titled `BRIDGE:claude` that answers
/// every submitted prompt with an echo and `done.`
const FAKE_TMUX: &str = r#"#!/bin/sh
state="$(dirname "$0")"
case "$*" in
  *'#{pane_dead}'*|*'#{pane_in_mode}'*) echo 0 ;;
  *list-panes*) printf '%%1\tBRIDGE:claude\n' ;;
  *load-buffer*) cat > "$state/buffer" ;;
  *send-keys*Enter*)
    cat "$state/buffer" >> "$state/sent"
    echo >> "$state/sent"
    cp "$state/buffer" "$state/last"
    ;;
  *capture-pane*)
    echo "claude ready"
    if [ -f "$state/last" ]; then
      printf '> %s\n' "$(cat "$state/last")"
      echo "done."
    fi
    ;;
esac
exit 0
"#;

/// Isolated runtime, work directory and fake terminal for driving the real
/// `bridge` and `bridged` binaries. Any daemon left behind is killed on drop.
pub struct BridgeEnv {
    root: TempDir,
    work_dir: PathBuf,
    runtime_dir: PathBuf,
    tmux_dir: PathBuf,
    idle_secs: u64,
}

impl BridgeEnv {
    pub fn new() -> Self {
        Self::with_idle(30)
    }

    pub fn with_idle(idle_secs: u64) -> Self {
        let root = TempDir::new().expect("create temp dir");
        let work_dir = root.path().join("project");
        let runtime_dir = root.path().join("run");
        let tmux_dir = root.path().join("tmux");
        fs::create_dir_all(&work_dir).expect("create work dir");
        fs::create_dir_all(&tmux_dir).expect("create tmux dir");

        let script = tmux_dir.join("tmux");
        fs::write(&script, FAKE_TMUX).expect("write fake tmux");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod fake tmux");

        Self {
            root,
            work_dir,
            runtime_dir,
            tmux_dir,
            idle_secs,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::resolve(Backend::Claude, &self.work_dir).expect("resolve key")
    }

    pub fn config(&self) -> Config {
        Config::with_root(&self.runtime_dir, &self.key())
    }

    /// Prompts the fake pane has received, one per line
    pub fn sent(&self) -> Vec<String> {
        fs::read_to_string(self.tmux_dir.join("sent"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bridge"));
        cmd.arg("-C")
            .arg(&self.work_dir)
            .args(args)
            .env("BRIDGE_RUNTIME_DIR", &self.runtime_dir)
            .env("BRIDGE_DAEMON_BIN", env!("CARGO_BIN_EXE_bridged"))
            .env("BRIDGE_TMUX_BIN", self.tmux_dir.join("tmux"))
            .env("BRIDGE_TMUX_ENTER_DELAY_MS", "0")
            .env("BRIDGE_CLAUDE_TERMINAL", "tmux")
            .env("BRIDGE_CLAUDE_POLL_MS", "20")
            .env("BRIDGE_CLAUDE_STABLE_POLLS", "2")
            .env("BRIDGE_CLAUDE_MAX_WAIT_SECS", "10")
            .env("BRIDGE_CLAUDE_IDLE_SECS", self.idle_secs.to_string())
            .env("RUST_LOG", "warn")
            .env_remove("BRIDGE_CLAUDE_PANE")
            .env_remove("TMUX")
            .env_remove("TMUX_PANE")
            .env_remove("WEZTERM_PANE")
            .env_remove("BRIDGE_CALLER")
            .stdin(Stdio::null());
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("run bridge")
    }

    pub fn daemon_pid(&self) -> Option<u32> {
        self.config().read_pid()
    }

    pub fn wait_for_daemon_exit(&self, timeout: Duration) -> Result<(), WaitError> {
        wait_for_removal(&self.config().pid_file, timeout)
    }
}

impl Drop for BridgeEnv {
    fn drop(&mut self) {
        let Some(pid) = self.daemon_pid() else {
            return;
        };
        if !process_alive(pid) {
            return;
        }
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if self.wait_for_daemon_exit(Duration::from_secs(3)).is_err() {
            eprintln!("bridged pid {} ignored SIGTERM in {}", pid, self.root.path().display());
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
