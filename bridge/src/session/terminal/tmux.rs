// tmux implementation of the Terminal Backend
// Text goes through a named paste buffer so multiline payloads arrive intact

use super::{
    run_command, sanitize_payload, strip_ansi, PaneHandle, PaneTarget, TerminalBackend,
    TerminalError, TerminalKind, TerminalSettings,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-process counter keeping buffer names unique across concurrent sends
static BUFFER_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct TmuxTerminal {
    bin: PathBuf,
    socket: Option<String>,
    enter_delay: Duration,
    timeout: Duration,
}

impl TmuxTerminal {
    pub fn new(settings: &TerminalSettings) -> Self {
        Self {
            bin: settings.tmux_bin.clone(),
            socket: settings.tmux_socket.clone(),
            enter_delay: settings.tmux_enter_delay,
            timeout: settings.command_timeout,
        }
    }

    /// Full argv for a tmux subcommand, including the `-L` socket
    fn args(&self, rest: &[&str]) -> Vec<String> {
        build_args(self.socket.as_deref(), rest)
    }

    async fn tmux(&self, rest: &[&str], input: Option<&str>) -> Result<String, TerminalError> {
        let action = rest.first().copied().unwrap_or("tmux");
        let output = run_command(&self.bin, self.args(rest), input, action, self.timeout).await?;
        Ok(output.stdout)
    }

    async fn display(&self, pane_id: &str, format: &str) -> Result<String, TerminalError> {
        let out = self
            .tmux(&["display-message", "-p", "-t", pane_id, format], None)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn leave_copy_mode(&self, pane_id: &str) {
        match self.display(pane_id, "#{pane_in_mode}").await {
            Ok(mode) if matches!(mode.as_str(), "1" | "on" | "yes") => {
                if let Err(e) = self.tmux(&["send-keys", "-t", pane_id, "-X", "cancel"], None).await {
                    tracing::debug!(pane = pane_id, error = %e, "failed to leave copy mode");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(pane = pane_id, error = %e, "failed to read pane mode"),
        }
    }

    async fn paste(&self, pane_id: &str, text: &str, buffer: &str) -> Result<(), TerminalError> {
        self.tmux(&["load-buffer", "-b", buffer, "-"], Some(text)).await?;
        self.tmux(&["paste-buffer", "-p", "-t", pane_id, "-b", buffer], None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TerminalBackend for TmuxTerminal {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Tmux
    }

    async fn open(&self, target: &PaneTarget) -> Result<PaneHandle, TerminalError> {
        if let Some(pane_id) = &target.pane_id {
            let handle = PaneHandle {
                terminal: TerminalKind::Tmux,
                pane_id: pane_id.clone(),
            };
            if self.exists(&handle).await? {
                return Ok(handle);
            }
            tracing::debug!(pane = %pane_id, "configured pane is gone, trying title marker");
        }

        let listing = self
            .tmux(&["list-panes", "-a", "-F", "#{pane_id}\t#{pane_title}"], None)
            .await?;
        match find_by_title(&listing, &target.title_marker) {
            Some(pane_id) => Ok(PaneHandle {
                terminal: TerminalKind::Tmux,
                pane_id,
            }),
            None => Err(TerminalError::NotFound(
                target
                    .pane_id
                    .clone()
                    .unwrap_or_else(|| target.title_marker.clone()),
            )),
        }
    }

    async fn send(&self, pane: &PaneHandle, text: &str, submit: bool) -> Result<(), TerminalError> {
        let text = sanitize_payload(text);
        if text.is_empty() {
            return Ok(());
        }

        self.leave_copy_mode(&pane.pane_id).await;
        let buffer = format!(
            "bridge-{}-{}",
            std::process::id(),
            BUFFER_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let result = async {
            self.paste(&pane.pane_id, &text, &buffer).await?;
            if submit {
                if !self.enter_delay.is_zero() {
                    tokio::time::sleep(self.enter_delay).await;
                }
                self.tmux(&["send-keys", "-t", &pane.pane_id, "Enter"], None)
                    .await?;
            }
            Ok::<(), TerminalError>(())
        }
        .await;

        // The buffer may never have been created; a failed delete is harmless
        let _ = self.tmux(&["delete-buffer", "-b", &buffer], None).await;
        result
    }

    async fn capture(&self, pane: &PaneHandle, lines: usize) -> Result<String, TerminalError> {
        let start = format!("-{}", lines.max(1));
        let out = self
            .tmux(&["capture-pane", "-t", &pane.pane_id, "-p", "-S", &start], None)
            .await?;
        Ok(strip_ansi(&out))
    }

    async fn exists(&self, pane: &PaneHandle) -> Result<bool, TerminalError> {
        match self.display(&pane.pane_id, "#{pane_dead}").await {
            Ok(dead) => Ok(dead == "0"),
            Err(TerminalError::CommandFailed { stderr, .. }) if target_missing(&stderr) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn build_args(socket: Option<&str>, rest: &[&str]) -> Vec<String> {
    let mut args = Vec::with_capacity(rest.len() + 2);
    if let Some(socket) = socket {
        args.push("-L".to_string());
        args.push(socket.to_string());
    }
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

/// First pane id from `list-panes -F '#{pane_id}\t#{pane_title}'` whose title
/// starts with `marker`
fn find_by_title(listing: &str, marker: &str) -> Option<String> {
    let marker = marker.trim();
    if marker.is_empty() {
        return None;
    }
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (id, title) = line
                .split_once('\t')
                .or_else(|| line.split_once(' '))
                .unwrap_or((line, ""));
            let id = id.trim();
            (title.starts_with(marker) && looks_like_pane_id(id)).then(|| id.to_string())
        })
        .next()
}

/// Whether tmux stderr says the pane (or its whole server) is gone
fn target_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["can't find", "no such", "no server running", "error connecting to"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn looks_like_pane_id(value: &str) -> bool {
    value
        .strip_prefix('%')
        .map(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}
