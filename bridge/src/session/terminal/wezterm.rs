// WezTerm implementation of the Terminal Backend, driven through `wezterm cli`

use super::{
    run_command, sanitize_payload, strip_ansi, tail_lines, PaneHandle, PaneTarget,
    TerminalBackend, TerminalError, TerminalKind, TerminalSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Single-line payloads longer than this go through stdin instead of argv
const ARGV_TEXT_LIMIT: usize = 200;

pub struct WeztermTerminal {
    bin: PathBuf,
    class: Option<String>,
    paste_delay: Duration,
    timeout: Duration,
}

/// One entry of `wezterm cli list --format json`
#[derive(Debug, Deserialize)]
struct PaneEntry {
    pane_id: u64,
    #[serde(default)]
    title: String,
}

impl WeztermTerminal {
    pub fn new(settings: &TerminalSettings) -> Self {
        Self {
            bin: settings.wezterm_bin.clone(),
            class: settings.wezterm_class.clone(),
            paste_delay: settings.wezterm_paste_delay,
            timeout: settings.command_timeout,
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["cli".to_string()];
        if let Some(class) = &self.class {
            args.push("--class".to_string());
            args.push(class.clone());
        }
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    async fn cli(&self, rest: &[&str], input: Option<&str>) -> Result<String, TerminalError> {
        let action = rest.first().copied().unwrap_or("cli");
        let output = run_command(&self.bin, self.args(rest), input, action, self.timeout).await?;
        Ok(output.stdout)
    }

    async fn list(&self) -> Result<Vec<PaneEntry>, TerminalError> {
        let out = self.cli(&["list", "--format", "json"], None).await?;
        parse_list(&out)
    }

    async fn submit(&self, pane_id: &str) -> Result<(), TerminalError> {
        self.cli(&["send-text", "--pane-id", pane_id, "--no-paste"], Some("\r"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TerminalBackend for WeztermTerminal {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Wezterm
    }

    async fn open(&self, target: &PaneTarget) -> Result<PaneHandle, TerminalError> {
        let panes = self.list().await?;
        let found = match &target.pane_id {
            Some(id) if panes.iter().any(|p| p.pane_id.to_string() == *id) => Some(id.clone()),
            _ => find_by_title(&panes, &target.title_marker),
        };
        match found {
            Some(pane_id) => Ok(PaneHandle {
                terminal: TerminalKind::Wezterm,
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
        let pane_id = pane.pane_id.as_str();

        if !text.contains('\n') {
            // Paste mode makes some assistants collapse input into a "[Pasted Content]" chip
            if text.len() <= ARGV_TEXT_LIMIT {
                self.cli(&["send-text", "--pane-id", pane_id, "--no-paste", &text], None)
                    .await?;
            } else {
                self.cli(&["send-text", "--pane-id", pane_id, "--no-paste"], Some(&text))
                    .await?;
            }
        } else {
            self.cli(&["send-text", "--pane-id", pane_id], Some(&text))
                .await?;
            if !self.paste_delay.is_zero() {
                tokio::time::sleep(self.paste_delay).await;
            }
        }

        if submit {
            self.submit(pane_id).await?;
        }
        Ok(())
    }

    async fn capture(&self, pane: &PaneHandle, lines: usize) -> Result<String, TerminalError> {
        let out = self
            .cli(&["get-text", "--pane-id", &pane.pane_id], None)
            .await?;
        Ok(tail_lines(&strip_ansi(&out), lines.max(1)))
    }

    async fn exists(&self, pane: &PaneHandle) -> Result<bool, TerminalError> {
        let panes = self.list().await?;
        Ok(panes.iter().any(|p| p.pane_id.to_string() == pane.pane_id))
    }
}

fn parse_list(json: &str) -> Result<Vec<PaneEntry>, TerminalError> {
    serde_json::from_str(json).map_err(|e| TerminalError::Parse {
        program: "wezterm".to_string(),
        detail: e.to_string(),
    })
}

fn find_by_title(panes: &[PaneEntry], marker: &str) -> Option<String> {
    if marker.trim().is_empty() {
        return None;
    }
    panes
        .iter()
        .find(|p| p.title.starts_with(marker))
        .map(|p| p.pane_id.to_string())
}
