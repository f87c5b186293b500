use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;

/// Events pushed by the workflow service over the session stream.
///
/// The service tags each message with `type`; `kind` is accepted as an alias
/// by [`parse_event`]. Unrecognised tags decode to [`WorkflowEvent::Unknown`]
/// so newer servers do not break older clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentLabel>,
        #[serde(default)]
        content: String,
    },

    AgentStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentLabel>,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visit_count: Option<u32>,
        #[serde(default)]
        is_bidirectional: bool,
    },

    AgentOutput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentLabel>,
        #[serde(default)]
        content: String,
    },

    AgentEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentLabel>,
        #[serde(default)]
        content: String,
    },

    /// Lifecycle signal plus a snapshot of the workflow state.
    Control {
        #[serde(default)]
        content: ControlSignal,
        #[serde(default)]
        state: StateSnapshot,
    },

    Error {
        #[serde(default)]
        content: String,
    },

    #[serde(other)]
    Unknown,
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::AgentStart { .. } => "agent_start",
            Self::AgentOutput { .. } => "agent_output",
            Self::AgentEnd { .. } => "agent_end",
            Self::Control { .. } => "control",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn agent(&self) -> Option<&AgentLabel> {
        match self {
            Self::Status { agent, .. }
            | Self::AgentStart { agent, .. }
            | Self::AgentOutput { agent, .. }
            | Self::AgentEnd { agent, .. } => agent.as_ref(),
            Self::Control { .. } | Self::Error { .. } | Self::Unknown => None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Status { content, .. }
            | Self::AgentStart { content, .. }
            | Self::AgentOutput { content, .. }
            | Self::AgentEnd { content, .. }
            | Self::Error { content } => content,
            Self::Control { content, .. } => content.as_str(),
            Self::Unknown => "",
        }
    }

    /// Local notice appended when the stream drops and a reconnect is scheduled.
    pub fn reconnect_notice(attempt: u32, max_attempts: u32) -> Self {
        Self::Status {
            agent: Some(AgentLabel::System),
            content: format!("Connection lost. Reconnecting ({attempt}/{max_attempts})..."),
        }
    }

    /// Local notice appended once reconnection has been given up.
    pub fn connection_failed() -> Self {
        Self::Error {
            content: "Connection closed. Max reconnection attempts reached.".into(),
        }
    }
}

/// Decode one stream message into a [`WorkflowEvent`].
///
/// Accepts `kind` in place of `type` as the discriminator. Anything that is
/// not a JSON object with a string discriminator is a parse error.
pub fn parse_event(data: &str) -> Result<WorkflowEvent, ClientError> {
    let mut value: Value =
        serde_json::from_str(data).map_err(|e| ClientError::Parse(e.to_string()))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| ClientError::Parse("event is not a JSON object".into()))?;

    if !obj.contains_key("type") {
        match obj.remove("kind") {
            Some(kind) => {
                let _ = obj.insert("type".into(), kind);
            }
            None => return Err(ClientError::Parse("event has no type".into())),
        }
    }
    if !obj.get("type").is_some_and(Value::is_string) {
        return Err(ClientError::Parse("event type is not a string".into()));
    }

    serde_json::from_value(value).map_err(|e| ClientError::Parse(e.to_string()))
}

/// Which agent produced an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentLabel {
    System,
    Filter,
    Drafter,
    Safety,
    Critic,
    Interrupt,
    Rejection,
    User,
    Other(String),
}

impl AgentLabel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "System",
            Self::Filter => "Filter",
            Self::Drafter => "Drafter",
            Self::Safety => "Safety",
            Self::Critic => "Critic",
            Self::Interrupt => "Interrupt",
            Self::Rejection => "Rejection",
            Self::User => "User",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for AgentLabel {
    fn from(s: String) -> Self {
        match s.as_str() {
            "System" => Self::System,
            "Filter" => Self::Filter,
            "Drafter" => Self::Drafter,
            "Safety" => Self::Safety,
            "Critic" => Self::Critic,
            "Interrupt" => Self::Interrupt,
            "Rejection" => Self::Rejection,
            "User" => Self::User,
            _ => Self::Other(s),
        }
    }
}

impl From<AgentLabel> for String {
    fn from(label: AgentLabel) -> Self {
        match label {
            AgentLabel::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for AgentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `content` of a control event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControlSignal {
    /// The run stopped at a checkpoint and is waiting for a human.
    Interrupted,
    /// The run reached its end node.
    Finished,
    Other(String),
}

impl ControlSignal {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Interrupted => "Interrupted",
            Self::Finished => "Finished",
            Self::Other(s) => s,
        }
    }
}

impl Default for ControlSignal {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for ControlSignal {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Interrupted" => Self::Interrupted,
            "Finished" => Self::Finished,
            _ => Self::Other(s),
        }
    }
}

impl From<ControlSignal> for String {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

/// The `status` field of a state snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowStatus {
    WaitingForApproval,
    Rejected,
    Finalized,
    /// Intermediate progress strings ("Drafting", "Safety Check", ...).
    Other(String),
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WaitingForApproval => "Waiting for Approval",
            Self::Rejected => "Rejected",
            Self::Finalized => "Approved and Finalized",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for WorkflowStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Waiting for Approval" => Self::WaitingForApproval,
            "Rejected" => Self::Rejected,
            "Approved and Finalized" => Self::Finalized,
            _ => Self::Other(s),
        }
    }
}

impl From<WorkflowStatus> for String {
    fn from(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow state carried by a control event (chat history excluded).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scratchpad: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub loops: LoopCounters,
}

impl StateSnapshot {
    /// The artifact, if the snapshot carries a non-empty one.
    pub fn non_empty_artifact(&self) -> Option<&str> {
        self.artifact.as_deref().filter(|a| !a.is_empty())
    }
}

/// Revision loop counters maintained by the workflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounters {
    #[serde(default)]
    pub revision_count: u32,
    #[serde(default)]
    pub filter_safety_iterations: u32,
    #[serde(default)]
    pub critic_drafter_iterations: u32,
    #[serde(default)]
    pub critic_safety_iterations: u32,
}

impl LoopCounters {
    pub fn any(&self) -> bool {
        self.filter_safety_iterations > 0
            || self.critic_drafter_iterations > 0
            || self.critic_safety_iterations > 0
    }
}
