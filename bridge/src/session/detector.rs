//! Completion Detector: decides from successive screen captures whether the
//! backend is still working, has finished its reply, or cancelled it.
//!
//! The detector compares each capture with the previous one. A reply is
//! complete once the screen has moved away from the pre-send baseline and
//! then held byte-identical for `K` consecutive polls with no busy marker in
//! the reply region. A cancellation marker in the reply region ends the round
//! as interrupted, keeping the text seen so far.

use crate::session::backend::BackendProfile;
use crate::session::protocol::ReplyStatus;
use crate::session::terminal::{PaneHandle, TerminalBackend, TerminalError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Anchor lengths tried, longest first, when locating the echoed payload.
/// Shorter anchors survive terminals that wrap long prompt lines.
const ANCHOR_LENGTHS: [usize; 2] = [32, 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Working,
    Complete,
    Interrupted,
}

pub struct CompletionDetector<'a> {
    profile: &'a BackendProfile,
    baseline: String,
    anchors: Vec<String>,
    baseline_interrupts: usize,
    /// End of the payload echo already on screen before sending, if any
    baseline_echo: Option<usize>,
    last: Option<String>,
    stable: u32,
    changed: bool,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(profile: &'a BackendProfile, baseline: &str, payload: &str) -> Self {
        let anchors = anchors_for(payload);
        let baseline_echo = find_echo(&anchors, baseline);
        Self {
            profile,
            baseline: baseline.to_string(),
            anchors,
            baseline_interrupts: profile.interrupt_markers.count(baseline),
            baseline_echo,
            last: None,
            stable: 0,
            changed: false,
        }
    }

    pub fn observe(&mut self, snapshot: &str) -> Observation {
        if snapshot != self.baseline {
            self.changed = true;
        }
        if self.last.as_deref() == Some(snapshot) {
            self.stable = self.stable.saturating_add(1);
        } else {
            self.stable = 1;
            self.last = Some(snapshot.to_string());
        }

        if !self.changed {
            return Observation::Working;
        }
        if self.interrupt_offset(snapshot).is_some() {
            return Observation::Interrupted;
        }

        let region = self.reply_region(snapshot);
        if self.stable >= self.profile.stable_polls
            && self.profile.busy_markers.find(region).is_none()
            && !region.trim().is_empty()
        {
            Observation::Complete
        } else {
            Observation::Working
        }
    }

    /// Reply text as of the latest capture; cut at the cancellation marker
    pub fn text(&self) -> String {
        let Some(snapshot) = self.last.as_deref() else {
            return String::new();
        };
        let region = self.reply_region(snapshot);
        let region = match self.interrupt_offset(snapshot) {
            Some(offset) => &region[..offset],
            None => region,
        };
        region.trim().to_string()
    }

    /// Offset of a cancellation marker within the reply region.
    ///
    /// Without a visible echo the whole tail is the region, so a marker only
    /// counts when there are more of them than in the baseline.
    fn interrupt_offset(&self, snapshot: &str) -> Option<usize> {
        let markers = &self.profile.interrupt_markers;
        if self.echo_end(snapshot).is_some() {
            return markers.find(self.reply_region(snapshot));
        }
        if markers.count(snapshot) > self.baseline_interrupts {
            markers.find_last(snapshot)
        } else {
            None
        }
    }

    fn reply_region<'s>(&self, snapshot: &'s str) -> &'s str {
        match self.echo_end(snapshot) {
            Some(end) => &snapshot[end..],
            None => snapshot,
        }
    }

    /// Byte offset just past the line holding this round's echoed payload.
    ///
    /// An echo sitting where the baseline already had one, under the same
    /// screen prefix, belongs to an earlier round with the same payload.
    fn echo_end(&self, snapshot: &str) -> Option<usize> {
        let end = find_echo(&self.anchors, snapshot)?;
        match self.baseline_echo {
            Some(old) if old == end && snapshot.get(..end) == self.baseline.get(..end) => None,
            _ => Some(end),
        }
    }
}

/// Byte offset just past the last line containing one of `anchors`
fn find_echo(anchors: &[String], text: &str) -> Option<usize> {
    anchors.iter().find_map(|anchor| {
        let at = text.rfind(anchor.as_str())?;
        let after = at + anchor.len();
        Some(match text[after..].find('\n') {
            Some(nl) => after + nl + 1,
            None => text.len(),
        })
    })
}

/// Tail fragments of the payload's last line, longest first
fn anchors_for(payload: &str) -> Vec<String> {
    let Some(last_line) = payload.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return Vec::new();
    };
    let chars: Vec<char> = last_line.chars().collect();
    let mut anchors: Vec<String> = Vec::new();
    for len in ANCHOR_LENGTHS {
        let start = chars.len().saturating_sub(len);
        let anchor: String = chars[start..].iter().collect();
        if !anchors.contains(&anchor) {
            anchors.push(anchor);
        }
    }
    anchors
}

/// Outcome of one bounded poll loop
#[derive(Debug, Clone)]
pub struct Detection {
    pub status: ReplyStatus,
    pub text: String,
    pub polls: u32,
    pub elapsed: Duration,
    /// The loop ended because the daemon is stopping
    pub cancelled: bool,
}

/// Poll `pane` until the reply completes, is interrupted, `T_max` elapses, or
/// `stop` turns true.
///
/// The pane's existence is re-checked on every poll; a vanished pane ends the
/// loop with [`TerminalError::PaneMissing`].
pub async fn wait_for_reply(
    terminal: &dyn TerminalBackend,
    pane: &PaneHandle,
    profile: &BackendProfile,
    baseline: &str,
    payload: &str,
    mut stop: watch::Receiver<bool>,
) -> Result<Detection, TerminalError> {
    let started = Instant::now();
    let deadline = started + profile.max_wait;
    let mut detector = CompletionDetector::new(profile, baseline, payload);
    let mut polls = 0u32;

    let finish = |detector: &CompletionDetector, status: ReplyStatus, polls: u32, cancelled: bool| {
        Detection {
            status,
            text: detector.text(),
            polls,
            elapsed: started.elapsed(),
            cancelled,
        }
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(finish(&detector, ReplyStatus::TimedOut, polls, false));
        }
        let nap = profile.poll_interval.min(deadline - now);

        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = stopped(&mut stop) => {
                return Ok(finish(&detector, ReplyStatus::TimedOut, polls, true));
            }
        }

        if !terminal.exists(pane).await? {
            return Err(TerminalError::PaneMissing(pane.pane_id.clone()));
        }
        let snapshot = terminal.capture(pane, profile.capture_lines).await?;
        polls += 1;

        match detector.observe(&snapshot) {
            Observation::Working => {}
            Observation::Complete => {
                return Ok(finish(&detector, ReplyStatus::Complete, polls, false));
            }
            Observation::Interrupted => {
                return Ok(finish(&detector, ReplyStatus::Interrupted, polls, false));
            }
        }
    }
}

/// Resolves once the stop flag is set. A dropped sender can never set it.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::{Backend, BackendProfile, MarkerSet};
    use crate::session::terminal::memory::{answer_frames, MemoryTerminal};
    use crate::session::terminal::{PaneTarget, TerminalKind};

    fn profile() -> BackendProfile {
        let mut profile = BackendProfile::defaults(Backend::Codex);
        profile.poll_interval = Duration::from_millis(5);
        profile.stable_polls = 3;
        profile.max_wait = Duration::from_secs(5);
        profile
    }

    #[test]
    fn test_complete_after_k_identical_polls() {
        let profile = profile();
        let mut detector = CompletionDetector::new(&profile, "$ ", "ONE");

        assert_eq!(detector.observe("$ ONE\nworking"), Observation::Working);
        assert_eq!(detector.observe("$ ONE\nanswer"), Observation::Working);
        assert_eq!(detector.observe("$ ONE\nanswer"), Observation::Working);
        assert_eq!(detector.observe("$ ONE\nanswer"), Observation::Complete);
        assert_eq!(detector.text(), "answer");
    }

    #[test]
    fn test_unchanged_baseline_is_never_complete() {
        let profile = profile();
        let mut detector = CompletionDetector::new(&profile, "idle prompt", "ONE");
        for _ in 0..10 {
            assert_eq!(detector.observe("idle prompt"), Observation::Working);
        }
    }

    #[test]
    fn test_busy_marker_blocks_completion() {
        let profile = profile();
        let mut detector = CompletionDetector::new(&profile, "", "ONE");
        for _ in 0..10 {
            assert_eq!(
                detector.observe("> ONE\nThinking (esc to interrupt)"),
                Observation::Working
            );
        }
    }

    #[test]
    fn test_stale_marker_above_echo_is_ignored() {
        let profile = profile();
        let baseline = "> OLD\nThinking (esc to interrupt)\n■ Conversation interrupted";
        let mut detector = CompletionDetector::new(&profile, baseline, "NEW");
        let screen = format!("{}\n> NEW\nfresh answer", baseline);
        assert_eq!(detector.observe(&screen), Observation::Working);
        assert_eq!(detector.observe(&screen), Observation::Working);
        assert_eq!(detector.observe(&screen), Observation::Complete);
        assert_eq!(detector.text(), "fresh answer");
    }

    #[test]
    fn test_interrupt_marker_keeps_text_before_it() {
        let profile = profile();
        let mut detector = CompletionDetector::new(&profile, "", "ONE");
        assert_eq!(detector.observe("> ONE\npartial line"), Observation::Working);
        assert_eq!(
            detector.observe("> ONE\npartial line\n■ Conversation interrupted"),
            Observation::Interrupted
        );
        assert_eq!(detector.text(), "partial line");
    }

    #[test]
    fn test_repeated_payload_ignores_earlier_interrupt() {
        let profile = profile();
        let baseline = "> continue\nold partial\n■ Conversation interrupted";
        let mut detector = CompletionDetector::new(&profile, baseline, "continue");

        // Nothing new on screen yet
        for _ in 0..5 {
            assert_eq!(detector.observe(baseline), Observation::Working);
        }

        let screen = format!("{}\n> continue\nsecond attempt", baseline);
        assert_eq!(detector.observe(&screen), Observation::Working);
        assert_eq!(detector.observe(&screen), Observation::Working);
        assert_eq!(detector.observe(&screen), Observation::Complete);
        assert_eq!(detector.text(), "second attempt");
    }

    #[test]
    fn test_repeated_payload_interrupted_again() {
        let profile = profile();
        let baseline = "> continue\nold partial\n■ Conversation interrupted";
        let mut detector = CompletionDetector::new(&profile, baseline, "continue");

        // Output before the new echo shows up still carries only the old marker
        let pending = format!("{}\n", baseline);
        assert_eq!(detector.observe(&pending), Observation::Working);

        let screen = format!("{}\n> continue\nhalf again\n■ Conversation interrupted", baseline);
        assert_eq!(detector.observe(&screen), Observation::Interrupted);
        assert_eq!(detector.text(), "half again");
    }

    #[test]
    fn test_interrupt_without_echo_needs_new_marker() {
        let mut profile = profile();
        profile.interrupt_markers = MarkerSet::new(["cancelled"]);
        let mut detector = CompletionDetector::new(&profile, "cancelled earlier", "ZZZ");
        assert_eq!(detector.observe("cancelled earlier\nnew text"), Observation::Working);
        assert_eq!(
            detector.observe("cancelled earlier\nnew text\ncancelled"),
            Observation::Interrupted
        );
    }

    #[test]
    fn test_anchor_uses_last_payload_line_tail() {
        let anchors = anchors_for("first line\n  a much longer second line that wraps around  \n\n");
        assert_eq!(anchors[0], "er second line that wraps around");
        assert_eq!(anchors[1], "wraps around");
        assert!(anchors_for("  ").is_empty());
        assert_eq!(anchors_for("hi"), vec!["hi".to_string()]);
    }

    fn pane() -> PaneHandle {
        PaneHandle {
            terminal: TerminalKind::Tmux,
            pane_id: "%1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_wait_for_reply_completes() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "BRIDGE:codex");
        term.set_screen("%1", "codex ready");
        term.respond_with("%1", |screen, payload| {
            answer_frames(screen, payload, "esc to interrupt", "42")
        });
        let profile = profile();
        let handle = term.open(&PaneTarget::by_id("%1", "")).await.unwrap();

        term.send(&handle, "what is six times seven", true).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let detection = wait_for_reply(&term, &handle, &profile, "codex ready", "what is six times seven", rx)
            .await
            .unwrap();
        assert_eq!(detection.status, ReplyStatus::Complete);
        assert_eq!(detection.text, "42");
        assert!(detection.polls >= profile.stable_polls);
    }

    #[tokio::test]
    async fn test_wait_for_reply_times_out_with_partial_text() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "");
        let mut profile = profile();
        profile.max_wait = Duration::from_millis(60);
        // Screen keeps changing, so it never stabilizes
        let frames: Vec<String> = (0..1000).map(|i| format!("> Q\nline {}", i)).collect();
        term.push_frames("%1", frames);

        let (_tx, rx) = watch::channel(false);
        let detection = wait_for_reply(&term, &pane(), &profile, "", "Q", rx).await.unwrap();
        assert_eq!(detection.status, ReplyStatus::TimedOut);
        assert!(detection.text.starts_with("line "));
        assert!(!detection.cancelled);
    }

    #[tokio::test]
    async fn test_wait_for_reply_is_cancellable() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "");
        let mut profile = profile();
        profile.max_wait = Duration::from_secs(30);
        term.push_frames("%1", ["> Q\nThinking (esc to interrupt)"]);

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).ok();
        });
        let detection = wait_for_reply(&term, &pane(), &profile, "", "Q", rx).await.unwrap();
        stopper.await.unwrap();
        assert!(detection.cancelled);
        assert_eq!(detection.status, ReplyStatus::TimedOut);
        assert!(detection.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_reply_reports_vanished_pane() {
        let term = MemoryTerminal::default();
        term.add_pane("%1", "");
        term.push_frames("%1", ["> Q\nThinking (esc to interrupt)"]);
        term.kill_after_captures("%1", 2);
        let (_tx, rx) = watch::channel(false);
        let err = wait_for_reply(&term, &pane(), &profile(), "", "Q", rx)
            .await
            .unwrap_err();
        assert!(err.is_pane_missing());
    }
}
