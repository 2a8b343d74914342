// Scripted in-memory Terminal Backend for tests and dry runs.
// Never talks to a real multiplexer.

use super::{tail_lines, PaneHandle, PaneTarget, TerminalBackend, TerminalError, TerminalKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Produces the frames a pane shows after `payload` is submitted.
/// Receives the screen as it was before the send.
pub type Responder = Arc<dyn Fn(&str, &str) -> Vec<String> + Send + Sync>;

#[derive(Default)]
struct PaneState {
    title: String,
    alive: bool,
    screen: String,
    frames: VecDeque<String>,
    sends: Vec<String>,
    responder: Option<Responder>,
    /// Die after this many captures
    dies_after_captures: Option<usize>,
    /// Captures and liveness checks time out while set
    stalled: bool,
}

#[derive(Default)]
struct State {
    panes: HashMap<String, PaneState>,
}

/// A pane simulator whose screen advances one scripted frame per capture
pub struct MemoryTerminal {
    kind: TerminalKind,
    state: Mutex<State>,
    send_delay: Duration,
    active_sends: AtomicUsize,
    peak_sends: AtomicUsize,
    captures: AtomicUsize,
}

impl Default for MemoryTerminal {
    fn default() -> Self {
        Self::new(TerminalKind::Tmux)
    }
}

impl MemoryTerminal {
    pub fn new(kind: TerminalKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
            send_delay: Duration::from_millis(5),
            active_sends: AtomicUsize::new(0),
            peak_sends: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Time a `send` takes, widening the window in which overlap would show
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_pane(&self, pane_id: &str, title: &str) {
        self.lock().panes.insert(
            pane_id.to_string(),
            PaneState {
                title: title.to_string(),
                alive: true,
                ..PaneState::default()
            },
        );
    }

    pub fn set_screen(&self, pane_id: &str, screen: &str) {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.screen = screen.to_string();
        }
    }

    /// Queue frames shown by the next captures, regardless of sends
    pub fn push_frames<I, S>(&self, pane_id: &str, frames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.frames.extend(frames.into_iter().map(Into::into));
        }
    }

    pub fn respond_with<F>(&self, pane_id: &str, responder: F)
    where
        F: Fn(&str, &str) -> Vec<String> + Send + Sync + 'static,
    {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.responder = Some(Arc::new(responder));
        }
    }

    pub fn kill(&self, pane_id: &str) {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.alive = false;
        }
    }

    /// Make the pane disappear once it has been captured `captures` times
    pub fn kill_after_captures(&self, pane_id: &str, captures: usize) {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.dies_after_captures = Some(captures);
        }
    }

    /// Make captures and liveness checks fail as if the multiplexer hung
    pub fn set_stalled(&self, pane_id: &str, stalled: bool) {
        if let Some(pane) = self.lock().panes.get_mut(pane_id) {
            pane.stalled = stalled;
        }
    }

    /// Payloads submitted to a pane, in order
    pub fn sends(&self, pane_id: &str) -> Vec<String> {
        self.lock()
            .panes
            .get(pane_id)
            .map(|p| p.sends.clone())
            .unwrap_or_default()
    }

    /// Highest number of `send` calls that were ever in progress at once
    pub fn peak_concurrent_sends(&self) -> usize {
        self.peak_sends.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    fn missing(pane: &PaneHandle) -> TerminalError {
        TerminalError::PaneMissing(pane.pane_id.clone())
    }

    fn stall(action: &str) -> TerminalError {
        TerminalError::Timeout {
            program: "memory".to_string(),
            action: action.to_string(),
            after: Duration::ZERO,
        }
    }
}

#[async_trait]
impl TerminalBackend for MemoryTerminal {
    fn kind(&self) -> TerminalKind {
        self.kind
    }

    async fn open(&self, target: &PaneTarget) -> Result<PaneHandle, TerminalError> {
        let state = self.lock();
        let by_id = target
            .pane_id
            .as_ref()
            .filter(|id| state.panes.get(id.as_str()).map(|p| p.alive).unwrap_or(false))
            .cloned();
        let found = by_id.or_else(|| {
            let mut ids: Vec<&String> = state
                .panes
                .iter()
                .filter(|(_, p)| p.alive && p.title.starts_with(&target.title_marker))
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            ids.first().map(|id| id.to_string())
        });
        found
            .map(|pane_id| PaneHandle {
                terminal: self.kind,
                pane_id,
            })
            .ok_or_else(|| {
                TerminalError::NotFound(
                    target
                        .pane_id
                        .clone()
                        .unwrap_or_else(|| target.title_marker.clone()),
                )
            })
    }

    async fn send(&self, pane: &PaneHandle, text: &str, submit: bool) -> Result<(), TerminalError> {
        let active = self.active_sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_sends.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.send_delay).await;
        self.active_sends.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        let state_pane = state
            .panes
            .get_mut(&pane.pane_id)
            .filter(|p| p.alive)
            .ok_or_else(|| Self::missing(pane))?;
        if !submit {
            state_pane.screen.push_str(text);
            return Ok(());
        }
        state_pane.sends.push(text.to_string());
        if let Some(responder) = state_pane.responder.clone() {
            // A new prompt replaces whatever was still scripted
            state_pane.frames = responder(&state_pane.screen, text).into();
        }
        Ok(())
    }

    async fn capture(&self, pane: &PaneHandle, lines: usize) -> Result<String, TerminalError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        let state_pane = state
            .panes
            .get_mut(&pane.pane_id)
            .filter(|p| p.alive)
            .ok_or_else(|| Self::missing(pane))?;
        if state_pane.stalled {
            return Err(Self::stall("capture"));
        }
        if let Some(remaining) = state_pane.dies_after_captures.as_mut() {
            if *remaining == 0 {
                state_pane.alive = false;
                return Err(Self::missing(pane));
            }
            *remaining -= 1;
        }
        if let Some(frame) = state_pane.frames.pop_front() {
            state_pane.screen = frame;
        }
        Ok(tail_lines(&state_pane.screen, lines))
    }

    async fn exists(&self, pane: &PaneHandle) -> Result<bool, TerminalError> {
        match self.lock().panes.get(&pane.pane_id) {
            Some(p) if p.stalled => Err(Self::stall("exists")),
            Some(p) => Ok(p.alive),
            None => Ok(false),
        }
    }
}

/// Frames of a well-behaved assistant: the echoed prompt, a busy frame, then
/// the answer held on screen.
pub fn answer_frames(screen: &str, payload: &str, busy_marker: &str, answer: &str) -> Vec<String> {
    let prefix = if screen.is_empty() {
        String::new()
    } else {
        format!("{}\n", screen)
    };
    let echoed = format!("{}> {}", prefix, payload);
    vec![
        format!("{}\n  Thinking ({})", echoed, busy_marker),
        format!("{}\n{}", echoed, answer),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(id: &str) -> PaneHandle {
        PaneHandle {
            terminal: TerminalKind::Tmux,
            pane_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_by_id_then_title() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "zsh");
        term.add_pane("%2", "BRIDGE:codex");

        let by_id = term.open(&PaneTarget::by_id("%1", "BRIDGE:codex")).await.unwrap();
        assert_eq!(by_id.pane_id, "%1");

        let by_title = term.open(&PaneTarget::by_title("BRIDGE:codex")).await.unwrap();
        assert_eq!(by_title.pane_id, "%2");

        term.kill("%2");
        let err = term.open(&PaneTarget::by_title("BRIDGE:codex")).await.unwrap_err();
        assert!(err.is_pane_missing());
    }

    #[tokio::test]
    async fn test_responder_frames_advance_per_capture() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "BRIDGE:codex");
        term.set_screen("%1", "ready");
        term.respond_with("%1", |screen, payload| {
            answer_frames(screen, payload, "esc to interrupt", "done")
        });

        term.send(&pane("%1"), "hi", true).await.unwrap();
        let first = term.capture(&pane("%1"), 80).await.unwrap();
        assert!(first.contains("esc to interrupt"));
        let second = term.capture(&pane("%1"), 80).await.unwrap();
        assert_eq!(second, "ready\n> hi\ndone");
        // The last frame stays on screen
        assert_eq!(term.capture(&pane("%1"), 80).await.unwrap(), second);
        assert_eq!(term.sends("%1"), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_dead_pane_reports_missing() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "");
        term.kill_after_captures("%1", 1);
        assert!(term.capture(&pane("%1"), 10).await.is_ok());
        assert!(term.capture(&pane("%1"), 10).await.unwrap_err().is_pane_missing());
        assert!(!term.exists(&pane("%1")).await.unwrap());
        assert!(!term.exists(&pane("%9")).await.unwrap());
    }
}
