//! Request Queue Daemon core: one FIFO queue and one serial dispatcher per
//! (backend, directory) key.
//!
//! Producers call [`Dispatcher::enqueue`] from any connection task. A single
//! [`Dispatcher::run`] loop pops entries in submission order and drives the
//! pane, so at most one `send`/`capture` cycle is ever in flight. Finalized
//! rounds are broadcast to waiters and recorded in the session history.

use crate::session::backend::BackendProfile;
use crate::session::detector::{wait_for_reply, Detection};
use crate::session::error::{BridgeError, ErrorCode};
use crate::session::protocol::{DaemonPhase, DaemonStatus, Reply, Request, SessionKey};
use crate::session::registry::SessionRegistry;
use crate::session::terminal::{sanitize_payload, PaneHandle, TerminalBackend, TerminalError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};

/// Failed rounds remembered for late waiters
const MAX_REMEMBERED_FAILURES: usize = 256;

/// A request waiting in the FIFO
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub round: u64,
    pub request: Request,
}

/// Acknowledgment for an accepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queued {
    pub round: u64,
    pub request_id: String,
    /// Entries ahead of this one, including an in-flight dispatch
    pub ahead: usize,
}

/// How a round ended
#[derive(Debug, Clone)]
pub enum RoundOutcome {
    Replied(Reply),
    Failed { code: ErrorCode, message: String },
}

#[derive(Debug, Clone)]
pub struct RoundEvent {
    pub round: u64,
    pub outcome: RoundOutcome,
}

#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Reply(Reply),
    /// The wait elapsed; the round is still pending
    TimedOut,
}

/// Why [`Dispatcher::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Requested,
    PaneMissing,
}

#[derive(Debug, Clone)]
struct InFlight {
    round: u64,
    pane_id: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    in_flight: Option<InFlight>,
    stopping: Option<StopReason>,
}

pub struct Dispatcher {
    key: SessionKey,
    profile: BackendProfile,
    terminal: Arc<dyn TerminalBackend>,
    registry: Mutex<SessionRegistry>,
    queue: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<RoundEvent>,
    failures: Mutex<BTreeMap<u64, (ErrorCode, String)>>,
    phase: RwLock<DaemonPhase>,
    idle_deadline: RwLock<Option<DateTime<Utc>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    /// First round handed out by this process; lower unrecorded rounds
    /// belonged to a previous daemon and will never finish
    first_round: u64,
}

impl Dispatcher {
    /// Build a dispatcher for `key`. The registry should already hold the
    /// session (with its persisted history); otherwise one is discovered.
    pub fn new(
        key: SessionKey,
        profile: BackendProfile,
        terminal: Arc<dyn TerminalBackend>,
        mut registry: SessionRegistry,
    ) -> Self {
        registry.get_or_create(&key);
        let first_round = registry.next_round(&key);
        let (events, _) = broadcast::channel(100);
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            key,
            profile,
            terminal,
            registry: Mutex::new(registry),
            queue: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            events,
            failures: Mutex::new(BTreeMap::new()),
            phase: RwLock::new(DaemonPhase::Starting),
            idle_deadline: RwLock::new(None),
            stop_tx,
            stop_rx,
            first_round,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    /// Append a request to the FIFO and hand back its round number
    pub async fn enqueue(&self, mut request: Request, resume: bool) -> Result<Queued, BridgeError> {
        request.payload = sanitize_payload(&request.payload);
        if request.payload.is_empty() {
            return Err(BridgeError::InvalidRequest("payload is empty".to_string()));
        }

        // Round reservation and the push happen under one lock so queue order
        // always matches round order
        let mut queue = self.queue.lock().await;
        if queue.stopping.is_some() {
            return Err(BridgeError::DaemonStopping);
        }
        if let (Some(origin), Some(flight)) = (&request.origin_pane, &queue.in_flight) {
            if flight.pane_id.as_deref() == Some(origin.as_str()) {
                tracing::warn!(
                    key = %self.key,
                    pane = %origin,
                    round = flight.round,
                    "rejecting request from the pane being dispatched on"
                );
                return Err(BridgeError::RecursiveDispatch {
                    pane: origin.clone(),
                });
            }
        }

        let round = {
            let mut registry = self.registry.lock().await;
            if resume {
                if let Err(e) = registry.set_resume(&self.key, true) {
                    tracing::warn!(key = %self.key, error = %e, "failed to persist resume flag");
                }
            }
            registry
                .reserve_round(&self.key)
                .map_err(|e| BridgeError::Internal(format!("{:#}", e)))?
        };

        let ahead = queue.entries.len() + usize::from(queue.in_flight.is_some());
        let request_id = request.id.clone();
        tracing::info!(
            key = %self.key,
            round,
            request_id = %request_id,
            caller = request.caller.as_deref().unwrap_or("-"),
            ahead,
            "request queued"
        );
        queue.entries.push_back(QueueEntry { round, request });
        drop(queue);

        self.wake.notify_one();
        Ok(Queued {
            round,
            request_id,
            ahead,
        })
    }

    /// Wait up to `timeout` for `round` to be finalized.
    ///
    /// Subscribes before checking the store, so a reply recorded between the
    /// two steps is never missed.
    pub async fn wait_for(&self, round: u64, timeout: Duration) -> Result<WaitOutcome, BridgeError> {
        let mut events = self.events.subscribe();

        if let Some(outcome) = self.finished(round).await? {
            return outcome;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.round == round => return outcome_of(event.outcome),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(outcome) = self.finished(round).await? {
                            return outcome;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BridgeError::DaemonStopping);
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Outcome of an already finalized round, or an error for rounds that
    /// will never finish
    async fn finished(
        &self,
        round: u64,
    ) -> Result<Option<Result<WaitOutcome, BridgeError>>, BridgeError> {
        let (reply, next_round, last_round) = {
            let registry = self.registry.lock().await;
            (
                registry.find_reply(&self.key, round),
                registry.next_round(&self.key),
                registry.last_round(&self.key),
            )
        };
        if let Some(reply) = reply {
            return Ok(Some(Ok(WaitOutcome::Reply(reply))));
        }
        if let Some((code, message)) = self.failures.lock().await.get(&round).cloned() {
            return Ok(Some(Err(BridgeError::from_remote(code, message))));
        }
        if round == 0 || round >= next_round {
            return Err(BridgeError::InvalidRequest(format!(
                "round {} has not been issued",
                round
            )));
        }
        if round <= last_round || round < self.first_round {
            return Err(BridgeError::InvalidRequest(format!(
                "round {} is no longer available",
                round
            )));
        }
        Ok(None)
    }

    /// Last `count` replies, oldest first
    pub async fn pending(&self, count: usize) -> Vec<Reply> {
        self.registry.lock().await.history(&self.key, count)
    }

    pub async fn status(&self) -> DaemonStatus {
        let (queue_len, in_flight) = {
            let queue = self.queue.lock().await;
            (queue.entries.len(), queue.in_flight.as_ref().map(|f| f.round))
        };
        let (target, pane, resume, last_round) = {
            let registry = self.registry.lock().await;
            match registry.session(&self.key) {
                Some(s) => (Some(s.target.pane.clone()), s.pane.clone(), s.resume, s.last_round),
                None => (None, None, false, registry.last_round(&self.key)),
            }
        };

        let probe = match (pane, target) {
            (Some(pane), _) => self.terminal.exists(&pane).await.map(|alive| (pane, alive)),
            (None, Some(target)) => self.terminal.open(&target).await.map(|pane| (pane, true)),
            (None, None) => Err(TerminalError::NotFound(self.key.to_string())),
        };
        let (pane, pane_alive, pane_error) = match probe {
            Ok((pane, alive)) => (Some(pane.pane_id), alive, None),
            Err(e) => (None, false, Some(e.to_string())),
        };

        DaemonStatus {
            pid: std::process::id(),
            key: self.key.clone(),
            phase: *self.phase.read().await,
            pane,
            pane_alive,
            pane_error,
            resume,
            last_round,
            queue_len,
            in_flight,
            idle_deadline: *self.idle_deadline.read().await,
        }
    }

    /// Explicit stop: refuse new work, fail queued entries and cancel the
    /// in-flight dispatch
    pub async fn request_stop(&self) {
        let drained: Vec<QueueEntry> = {
            let mut queue = self.queue.lock().await;
            if queue.stopping.is_none() {
                queue.stopping = Some(StopReason::Requested);
            }
            queue.entries.drain(..).collect()
        };
        tracing::info!(key = %self.key, dropped = drained.len(), "stop requested");
        for entry in drained {
            self.fail_round(entry.round, ErrorCode::DaemonStopping, "daemon is stopping")
                .await;
        }
        self.stop_tx.send_replace(true);
        self.wake.notify_one();
    }

    pub async fn is_stopping(&self) -> bool {
        self.queue.lock().await.stopping.is_some()
    }

    /// Serve the queue until idle expiry, an explicit stop, or a vanished pane
    pub async fn run(&self) -> StopReason {
        let mut stop_rx = self.stop_rx.clone();
        let reason = loop {
            let next = {
                let mut queue = self.queue.lock().await;
                if let Some(reason) = queue.stopping {
                    break reason;
                }
                let next = queue.entries.pop_front();
                if let Some(entry) = &next {
                    queue.in_flight = Some(InFlight {
                        round: entry.round,
                        pane_id: None,
                    });
                }
                next
            };

            match next {
                Some(entry) => {
                    self.set_phase(DaemonPhase::Dispatching).await;
                    *self.idle_deadline.write().await = None;
                    let outcome = self.dispatch(entry).await;
                    self.queue.lock().await.in_flight = None;
                    if let Err(pane) = outcome {
                        self.abandon_session(&pane).await;
                        break StopReason::PaneMissing;
                    }
                }
                None => {
                    self.set_phase(DaemonPhase::Idle).await;
                    let idle = self.profile.idle_timeout;
                    *self.idle_deadline.write().await = chrono::Duration::from_std(idle)
                        .ok()
                        .map(|d| Utc::now() + d);

                    // The stop arm must not hold the watch guard across the
                    // queue lock below
                    let expired = tokio::select! {
                        _ = self.wake.notified() => false,
                        _ = tokio::time::sleep(idle) => true,
                        _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => false,
                    };
                    if expired {
                        let mut queue = self.queue.lock().await;
                        if queue.entries.is_empty() && queue.in_flight.is_none() && queue.stopping.is_none() {
                            queue.stopping = Some(StopReason::Idle);
                            tracing::info!(key = %self.key, idle_secs = idle.as_secs(), "idle timeout reached");
                        }
                    }
                }
            }
        };

        self.set_phase(DaemonPhase::Stopped).await;
        *self.idle_deadline.write().await = None;
        tracing::info!(key = %self.key, reason = ?reason, "dispatcher stopped");
        reason
    }

    async fn set_phase(&self, phase: DaemonPhase) {
        *self.phase.write().await = phase;
    }

    /// Run one round against the pane. `Err` carries the id of a pane that
    /// vanished, which ends the session.
    async fn dispatch(&self, entry: QueueEntry) -> Result<(), String> {
        let round = entry.round;
        let request_id = entry.request.id.clone();
        let started_at = Utc::now();
        tracing::info!(key = %self.key, round, request_id = %request_id, "dispatch started");

        match self.drive(&entry).await {
            Ok(detection) => {
                let reply = Reply {
                    round,
                    request_id: request_id.clone(),
                    status: detection.status,
                    text: detection.text,
                    started_at,
                    finished_at: Utc::now(),
                };
                tracing::info!(
                    key = %self.key,
                    round,
                    request_id = %request_id,
                    status = %reply.status,
                    polls = detection.polls,
                    elapsed_ms = detection.elapsed.as_millis() as u64,
                    cancelled = detection.cancelled,
                    "dispatch finished"
                );
                if let Err(e) = self.registry.lock().await.record_dispatch(&self.key, reply.clone()) {
                    tracing::error!(key = %self.key, round, error = %e, "failed to record reply");
                }
                let _ = self.events.send(RoundEvent {
                    round,
                    outcome: RoundOutcome::Replied(reply),
                });
                Ok(())
            }
            Err(e) => {
                let pane_gone = match (&e, self.current_pane().await) {
                    (e, _) if e.is_pane_missing() => true,
                    // A probe that fails says nothing about the pane
                    (_, Some(pane)) => matches!(self.terminal.exists(&pane).await, Ok(false)),
                    (_, None) => false,
                };
                let code = if pane_gone {
                    ErrorCode::BackendPaneMissing
                } else {
                    ErrorCode::Internal
                };
                tracing::error!(
                    key = %self.key,
                    round,
                    request_id = %request_id,
                    code = %code,
                    error = %e,
                    "dispatch failed"
                );
                self.fail_round(round, code, &e.to_string()).await;
                if pane_gone {
                    let pane = self
                        .current_pane()
                        .await
                        .map(|p| p.pane_id)
                        .unwrap_or_else(|| e.to_string());
                    Err(pane)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn drive(&self, entry: &QueueEntry) -> Result<Detection, TerminalError> {
        let pane = self.ensure_pane().await?;
        if !self.terminal.exists(&pane).await? {
            return Err(TerminalError::PaneMissing(pane.pane_id.clone()));
        }
        if let Some(flight) = self.queue.lock().await.in_flight.as_mut() {
            flight.pane_id = Some(pane.pane_id.clone());
        }

        let payload = &entry.request.payload;
        let baseline = self
            .terminal
            .capture(&pane, self.profile.capture_lines)
            .await?;
        self.terminal.send(&pane, payload, true).await?;
        wait_for_reply(
            self.terminal.as_ref(),
            &pane,
            &self.profile,
            &baseline,
            payload,
            self.stop_rx.clone(),
        )
        .await
    }

    /// The session's pane, opening its target on first use
    async fn ensure_pane(&self) -> Result<PaneHandle, TerminalError> {
        if let Some(pane) = self.current_pane().await {
            return Ok(pane);
        }
        let target = {
            let registry = self.registry.lock().await;
            registry
                .session(&self.key)
                .map(|s| s.target.pane.clone())
                .ok_or_else(|| TerminalError::NotFound(self.key.to_string()))?
        };
        let pane = self.terminal.open(&target).await?;
        tracing::info!(key = %self.key, pane = %pane, "pane resolved");
        if let Some(session) = self.registry.lock().await.session_mut(&self.key) {
            session.pane = Some(pane.clone());
        }
        Ok(pane)
    }

    async fn current_pane(&self) -> Option<PaneHandle> {
        self.registry
            .lock()
            .await
            .session(&self.key)
            .and_then(|s| s.pane.clone())
    }

    /// The pane is gone: fail everything still queued and stop taking work
    async fn abandon_session(&self, pane: &str) {
        let drained: Vec<QueueEntry> = {
            let mut queue = self.queue.lock().await;
            queue.stopping = Some(StopReason::PaneMissing);
            queue.entries.drain(..).collect()
        };
        tracing::error!(key = %self.key, pane, dropped = drained.len(), "pane missing, dropping session");
        let message = format!("terminal pane {} is gone", pane);
        for entry in drained {
            self.fail_round(entry.round, ErrorCode::BackendPaneMissing, &message)
                .await;
        }
        self.registry.lock().await.forget(&self.key);
    }

    /// Clear the history owner on the way out; a no-op once the session is gone
    pub async fn release_history(&self) {
        let mut registry = self.registry.lock().await;
        if registry.session(&self.key).is_none() {
            return;
        }
        if let Err(e) = registry.set_owner(&self.key, None) {
            tracing::warn!(key = %self.key, error = %e, "failed to clear history owner");
        }
    }

    async fn fail_round(&self, round: u64, code: ErrorCode, message: &str) {
        {
            let mut failures = self.failures.lock().await;
            failures.insert(round, (code, message.to_string()));
            while failures.len() > MAX_REMEMBERED_FAILURES {
                failures.pop_first();
            }
        }
        let _ = self.events.send(RoundEvent {
            round,
            outcome: RoundOutcome::Failed {
                code,
                message: message.to_string(),
            },
        });
    }
}

fn outcome_of(outcome: RoundOutcome) -> Result<WaitOutcome, BridgeError> {
    match outcome {
        RoundOutcome::Replied(reply) => Ok(WaitOutcome::Reply(reply)),
        RoundOutcome::Failed { code, message } => Err(BridgeError::from_remote(code, message)),
    }
}
