// --- Session registry ------------------------------------------------------
//
// owner -> at most one running transcoder.
//
// Each owner has its own async mutex. `start`, `stop` and exit reconciliation
// all take it, so the "is there a session already?" check and the insert
// happen as one step, while different owners never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{ProcessInvocation, StreamContext};
use crate::error::StreamError;
use crate::events::{EventKind, EventSink};
use crate::media::OwnerId;
use crate::supervisor::{ExitOutcome, ExitReport, ProcessHandle, ProcessSupervisor};

pub type SessionId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    /// Ended by a stop request.
    Stopped,
    /// Exited on its own with status 0 (end of non-looping media).
    Finished,
    /// Exited on its own with a failure status or signal.
    Crashed,
}

struct StreamSession {
    id: SessionId,
    invocation: ProcessInvocation,
    handle: ProcessHandle,
    started_at: Instant,
    started_at_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub owner: OwnerId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub started_at_ms: i64,
    pub uptime_sec: u64,
    pub stream: Option<StreamContext>,
}

/// How the owner's previous session ended.
#[derive(Clone, Debug, Serialize)]
pub struct ExitSummary {
    pub session_id: SessionId,
    pub state: SessionState,
    /// `None` while a stopped process is still shutting down.
    pub outcome: Option<ExitOutcome>,
    pub last_diagnostic: Option<String>,
    pub ended_at_ms: i64,
}

#[derive(Default)]
struct OwnerSlot {
    active: Option<StreamSession>,
    /// A stopped session whose process has not exited yet. The owner cannot
    /// start again until it has.
    terminating: Option<SessionId>,
    last_exit: Option<ExitSummary>,
}

struct RegistryInner {
    slots: Mutex<HashMap<OwnerId, Arc<tokio::sync::Mutex<OwnerSlot>>>>,
    supervisor: ProcessSupervisor,
    events: EventSink,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(supervisor: ProcessSupervisor, events: EventSink) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                supervisor,
                events,
            }),
        }
    }

    fn slot(&self, owner: OwnerId) -> Arc<tokio::sync::Mutex<OwnerSlot>> {
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(owner).or_default().clone()
    }

    /// Like `slot`, without creating one for an owner that never started.
    fn existing_slot(&self, owner: OwnerId) -> Option<Arc<tokio::sync::Mutex<OwnerSlot>>> {
        let slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(&owner).cloned()
    }

    fn all_slots(&self) -> Vec<(OwnerId, Arc<tokio::sync::Mutex<OwnerSlot>>)> {
        let slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.iter().map(|(o, s)| (*o, s.clone())).collect()
    }

    /// Spawns `invocation` for `owner` unless the owner already streams or a
    /// stopped transcoder is still exiting. There is no implicit replace: the
    /// caller has to `stop` first.
    pub async fn start(
        &self,
        owner: OwnerId,
        invocation: ProcessInvocation,
    ) -> Result<SessionId, StreamError> {
        let slot = self.slot(owner);
        let mut guard = slot.lock().await;
        if guard.active.is_some() || guard.terminating.is_some() {
            return Err(StreamError::SessionAlreadyActive(owner));
        }

        let (handle, exit_rx) = self.inner.supervisor.spawn(owner, &invocation)?;
        let id = Uuid::new_v4();
        let pid = handle.pid();

        info!(%owner, session = %id, ?pid, "transcoder started: {}", invocation.display_redacted());
        let message = match &invocation.context {
            Some(ctx) => format!(
                "streaming {} to {}{} (pid {})",
                ctx.mode,
                ctx.target,
                if ctx.looped { ", looping" } else { "" },
                pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
            ),
            None => format!("started {}", invocation.program_name()),
        };

        guard.active = Some(StreamSession {
            id,
            invocation,
            handle,
            started_at: Instant::now(),
            started_at_ms: now_ms(),
        });
        self.inner.events.append(owner, EventKind::Started, message);
        drop(guard);

        let registry = self.clone();
        tokio::spawn(async move {
            // A lost report still has to release the slot.
            let report = exit_rx.await.unwrap_or(ExitReport {
                pid,
                outcome: ExitOutcome { code: None, signal: None },
                requested: false,
                last_diagnostic: None,
            });
            registry.reconcile_exit(owner, id, report).await;
        });

        Ok(id)
    }

    /// Requests termination and returns right away. The session no longer
    /// shows as active, but the owner stays blocked for `start` until
    /// reconciliation confirms the process exit.
    pub async fn stop(&self, owner: OwnerId) -> Result<SessionId, StreamError> {
        let Some(slot) = self.existing_slot(owner) else {
            return Err(StreamError::NoActiveSession(owner));
        };
        let mut guard = slot.lock().await;
        let Some(mut session) = guard.active.take() else {
            return Err(StreamError::NoActiveSession(owner));
        };

        self.inner.supervisor.terminate(&mut session.handle);
        guard.terminating = Some(session.id);
        guard.last_exit = Some(ExitSummary {
            session_id: session.id,
            state: SessionState::Stopped,
            outcome: None,
            last_diagnostic: None,
            ended_at_ms: now_ms(),
        });
        self.inner
            .events
            .append(owner, EventKind::Stopped, "stream stopped by request");
        info!(%owner, session = %session.id, "stop requested");

        Ok(session.id)
    }

    pub async fn status(&self, owner: OwnerId) -> Option<SessionSnapshot> {
        let slot = self.existing_slot(owner)?;
        let guard = slot.lock().await;
        guard.active.as_ref().map(|s| SessionSnapshot {
            session_id: s.id,
            owner,
            state: SessionState::Running,
            pid: s.handle.pid(),
            started_at_ms: s.started_at_ms,
            uptime_sec: s.started_at.elapsed().as_secs(),
            stream: s.invocation.context.clone(),
        })
    }

    pub async fn last_exit(&self, owner: OwnerId) -> Option<ExitSummary> {
        let slot = self.existing_slot(owner)?;
        let guard = slot.lock().await;
        guard.last_exit.clone()
    }

    pub async fn active_count(&self) -> usize {
        let mut n = 0;
        for (_, slot) in self.all_slots() {
            if slot.lock().await.active.is_some() {
                n += 1;
            }
        }
        n
    }

    /// Stops every live session. Used on shutdown.
    pub async fn stop_all(&self) -> Vec<OwnerId> {
        let mut stopped = Vec::new();
        for (owner, _) in self.all_slots() {
            if self.stop(owner).await.is_ok() {
                stopped.push(owner);
            }
        }
        stopped
    }

    /// Waits until each of `owners` has a recorded exit outcome or `timeout`
    /// passes. Returns how many were still shutting down.
    pub async fn wait_for_exits(&self, owners: &[OwnerId], timeout: std::time::Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut pending = 0;
            for owner in owners {
                let exited = self
                    .last_exit(*owner)
                    .await
                    .is_some_and(|last| last.outcome.is_some());
                if !exited {
                    pending += 1;
                }
            }
            if pending == 0 || tokio::time::Instant::now() >= deadline {
                return pending;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn reconcile_exit(&self, owner: OwnerId, id: SessionId, report: ExitReport) {
        let slot = self.slot(owner);
        let mut guard = slot.lock().await;
        let events = &self.inner.events;

        if guard.terminating == Some(id) {
            guard.terminating = None;
        }

        let is_current = guard.active.as_ref().is_some_and(|s| s.id == id);
        if !is_current {
            // Already stopped; just record how it went down.
            if let Some(last) = guard.last_exit.as_mut().filter(|l| l.session_id == id) {
                last.outcome = Some(report.outcome);
                last.last_diagnostic = report.last_diagnostic.clone();
            }
            events.append(
                owner,
                EventKind::Diagnostic,
                format!("transcoder exited after stop ({})", report.outcome),
            );
            return;
        }

        guard.active = None;
        let state = if report.requested {
            SessionState::Stopped
        } else if report.outcome.success() {
            SessionState::Finished
        } else {
            SessionState::Crashed
        };

        match state {
            SessionState::Crashed => {
                let mut message = StreamError::ProcessCrashed(report.outcome).to_string();
                if let Some(last) = &report.last_diagnostic {
                    message.push_str(": ");
                    message.push_str(last);
                }
                warn!(%owner, session = %id, pid = ?report.pid, outcome = %report.outcome, "transcoder crashed");
                events.append(owner, EventKind::Error, message);
            }
            _ => {
                info!(%owner, session = %id, pid = ?report.pid, outcome = %report.outcome, "stream ended");
                events.append(
                    owner,
                    EventKind::Stopped,
                    format!("stream ended ({})", report.outcome),
                );
            }
        }

        guard.last_exit = Some(ExitSummary {
            session_id: id,
            state,
            outcome: Some(report.outcome),
            last_diagnostic: report.last_diagnostic,
            ended_at_ms: now_ms(),
        });
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
