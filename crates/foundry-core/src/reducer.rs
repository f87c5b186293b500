//! Derived workflow state.
//!
//! [`WorkflowState`] is the single source of truth for "what does the session
//! look like right now". It is folded from the event stream plus command
//! acknowledgements; everything else reads it.
//!
//! Rules:
//! - every event for the active thread is appended to the log, in order
//! - a non-empty snapshot artifact replaces the previous one
//! - `Interrupted` / "Waiting for Approval" sets `paused`
//! - `Finished` / "Rejected" sets `terminal`; nothing un-terminates a thread
//! - inputs tagged with any other thread id are ignored

use std::fmt;

use tracing::{debug, warn};

use crate::errors::ClientError;
use crate::events::{ControlSignal, LoopCounters, StateSnapshot, WorkflowEvent, WorkflowStatus};
use crate::ids::ThreadId;

/// Control commands whose acceptance changes derived state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Approve,
    Revise,
}

/// Lifecycle transitions surfaced to whoever drives the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Milestone {
    /// The workflow is waiting for approve or revise.
    Paused,
    /// The workflow reached its end node.
    Completed,
    /// The workflow refused the request.
    Rejected,
}

impl Milestone {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

/// Result of feeding one input to the reducer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    /// Input accepted. `milestone` is set only on the transition itself.
    Applied { milestone: Option<Milestone> },
    /// Input belongs to a thread that is no longer active.
    Stale,
}

/// Session lifecycle as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    WaitingForApproval,
    Completed,
    Rejected,
    Unknown,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::WaitingForApproval => write!(f, "waiting for approval"),
            Self::Completed => write!(f, "completed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WorkflowState {
    thread_id: Option<ThreadId>,
    artifact: String,
    paused: bool,
    outcome: Option<Milestone>,
    status: Option<WorkflowStatus>,
    loops: LoopCounters,
    log: Vec<WorkflowEvent>,
    last_violation: Option<ClientError>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_thread(thread_id: ThreadId) -> Self {
        Self {
            thread_id: Some(thread_id),
            ..Self::default()
        }
    }

    /// Drop all derived state and bind to `thread_id` (or to nothing).
    pub fn reset(&mut self, thread_id: Option<ThreadId>) {
        *self = Self {
            thread_id,
            ..Self::default()
        };
    }

    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// `Completed` or `Rejected` once terminal.
    pub fn outcome(&self) -> Option<Milestone> {
        self.outcome
    }

    /// Last status string reported by a snapshot.
    pub fn status(&self) -> Option<&WorkflowStatus> {
        self.status.as_ref()
    }

    pub fn loops(&self) -> LoopCounters {
        self.loops
    }

    pub fn log(&self) -> &[WorkflowEvent] {
        &self.log
    }

    /// Most recent input that contradicted the derived state. It was ignored.
    pub fn last_violation(&self) -> Option<&ClientError> {
        self.last_violation.as_ref()
    }

    pub fn session_status(&self) -> SessionStatus {
        if self.thread_id.is_none() {
            return SessionStatus::Unknown;
        }
        match self.outcome {
            Some(Milestone::Rejected) => SessionStatus::Rejected,
            Some(_) => SessionStatus::Completed,
            None if self.paused => SessionStatus::WaitingForApproval,
            None => SessionStatus::Active,
        }
    }

    fn is_current(&self, thread_id: &ThreadId) -> bool {
        self.thread_id.as_ref() == Some(thread_id)
    }

    /// Append an event delivered for `thread_id` and fold it into the state.
    pub fn apply(&mut self, thread_id: &ThreadId, event: WorkflowEvent) -> Reduction {
        if !self.is_current(thread_id) {
            debug!(
                thread_id = %thread_id,
                event_type = event.event_type(),
                "dropping event for inactive thread"
            );
            return Reduction::Stale;
        }

        let milestone = match &event {
            WorkflowEvent::Control { content, state } => self.apply_control(content, state),
            WorkflowEvent::Unknown => {
                debug!(thread_id = %thread_id, "unknown event type appended to log");
                None
            }
            _ => None,
        };

        self.log.push(event);
        Reduction::Applied { milestone }
    }

    fn apply_control(
        &mut self,
        content: &ControlSignal,
        snapshot: &StateSnapshot,
    ) -> Option<Milestone> {
        let rejected = snapshot.status == Some(WorkflowStatus::Rejected);
        let finished = *content == ControlSignal::Finished;
        let pause = *content == ControlSignal::Interrupted
            || snapshot.status == Some(WorkflowStatus::WaitingForApproval);

        if let Some(outcome) = self.outcome {
            if pause {
                self.record_violation(format!("pause signal after {outcome:?}"));
            } else {
                debug!(thread_id = ?self.thread_id, "control event after terminal state ignored");
            }
            return None;
        }

        if let Some(artifact) = snapshot.non_empty_artifact() {
            self.artifact = artifact.to_string();
        }
        if let Some(status) = &snapshot.status {
            self.status = Some(status.clone());
        }
        self.loops = snapshot.loops;

        if rejected || finished {
            let outcome = if rejected {
                Milestone::Rejected
            } else {
                Milestone::Completed
            };
            self.outcome = Some(outcome);
            return Some(outcome);
        }

        if pause && !self.paused {
            self.paused = true;
            return Some(Milestone::Paused);
        }

        None
    }

    /// Record that the service accepted an approve or revise for `thread_id`.
    pub fn acknowledge(&mut self, thread_id: &ThreadId, command: CommandKind) -> Reduction {
        if !self.is_current(thread_id) {
            return Reduction::Stale;
        }
        if let Some(outcome) = self.outcome {
            self.record_violation(format!("{command:?} acknowledged after {outcome:?}"));
        } else {
            self.paused = false;
        }
        Reduction::Applied { milestone: None }
    }

    fn record_violation(&mut self, detail: String) {
        let err = ClientError::ProtocolViolation(detail);
        warn!(
            thread_id = ?self.thread_id,
            error = %err,
            error_kind = err.error_kind(),
            "ignoring input inconsistent with session state"
        );
        self.last_violation = Some(err);
    }
}
