//! Plain-text rendering of workflow events for the terminal.

use foundry_core::{
    ControlSignal, LoopCounters, SessionStatus, StateSnapshot, WorkflowEvent, WorkflowState,
};

/// Per-loop iteration cap the workflow enforces; shown next to each counter.
const LOOP_LIMIT: u32 = 2;

/// One transcript line for `event`, or `None` for events with nothing to show.
pub fn format_event(event: &WorkflowEvent) -> Option<String> {
    let agent = event.agent().map(|a| a.as_str()).unwrap_or("System");
    match event {
        WorkflowEvent::Status { content, .. } => Some(format!("[{agent}] {content}")),
        WorkflowEvent::AgentStart {
            content,
            emoji,
            visit_count,
            is_bidirectional,
            ..
        } => {
            let arrow = if *is_bidirectional { "🔄" } else { "→" };
            let mut line = format!("{arrow} {agent}");
            if let Some(emoji) = emoji {
                line = format!("{arrow} {emoji} {agent}");
            }
            if let Some(n) = (*visit_count).filter(|n| *n > 1) {
                line.push_str(&format!(" (visit #{n})"));
            }
            if !content.is_empty() {
                line.push_str(&format!(": {content}"));
            }
            Some(line)
        }
        WorkflowEvent::AgentOutput { content, .. } => {
            Some(indent(&format!("{agent}: {content}")))
        }
        WorkflowEvent::AgentEnd { content, .. } if content.is_empty() => {
            Some(format!("✓ {agent} done"))
        }
        WorkflowEvent::AgentEnd { content, .. } => Some(format!("✓ {agent}: {content}")),
        WorkflowEvent::Control { content, state } => Some(format_control(content, state)),
        WorkflowEvent::Error { content } => Some(format!("✗ {content}")),
        WorkflowEvent::Unknown => None,
    }
}

fn format_control(signal: &ControlSignal, state: &StateSnapshot) -> String {
    let mut line = match (signal, &state.status) {
        (_, Some(status)) => format!("■ {status}"),
        (ControlSignal::Other(s), None) if s.is_empty() => "■ checkpoint".to_string(),
        (signal, None) => format!("■ {}", signal.as_str()),
    };
    if let Some(loops) = format_loops(&state.loops) {
        line.push_str(&format!(" ({loops})"));
    }
    line
}

/// `Filter↔Safety=1/2, Critic↔Drafter=2/2` for the non-zero loop counters.
pub fn format_loops(loops: &LoopCounters) -> Option<String> {
    if !loops.any() {
        return None;
    }
    let parts: Vec<String> = [
        ("Filter↔Safety", loops.filter_safety_iterations),
        ("Critic↔Drafter", loops.critic_drafter_iterations),
        ("Critic↔Safety", loops.critic_safety_iterations),
    ]
    .into_iter()
    .filter(|(_, n)| *n > 0)
    .map(|(name, n)| format!("{name}={n}/{LOOP_LIMIT}"))
    .collect();
    Some(parts.join(", "))
}

/// Multi-line summary used by `status` and on pause.
pub fn format_summary(state: &WorkflowState) -> String {
    let mut out = String::new();
    if let Some(thread_id) = state.thread_id() {
        out.push_str(&format!("session: {thread_id}\n"));
    }
    out.push_str(&format!("status:  {}\n", state.session_status()));
    if let Some(status) = state.status() {
        out.push_str(&format!("stage:   {status}\n"));
    }
    if let Some(loops) = format_loops(&state.loops()) {
        out.push_str(&format!("loops:   {loops}\n"));
    }
    if let Some(err) = state.last_violation() {
        out.push_str(&format!("warning: {err}\n"));
    }
    out
}

pub fn format_artifact(artifact: &str) -> String {
    if artifact.is_empty() {
        return "(no artifact yet)\n".to_string();
    }
    let rule = "─".repeat(60);
    format!("{rule}\n{}\n{rule}\n", artifact.trim_end())
}

pub fn review_help(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::WaitingForApproval => {
            "Review: `approve`, `revise <feedback>`, or `detach` to decide later."
        }
        _ => "Commands: `status`, `detach`.",
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|l| format!("    {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
