/// Typed error hierarchy for the workflow client.
///
/// Transport and parse errors stay local to the stream consumer; command
/// errors are returned to whoever issued the command. Nothing here is meant
/// to cross a component boundary as a panic.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    // Stream plumbing
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed event: {0}")]
    Parse(String),

    // Control commands
    #[error("{command} failed: {message}")]
    Command {
        command: &'static str,
        status: Option<u16>,
        message: String,
    },

    // Local guards
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ClientError {
    /// A command that never got a response (connection refused, timeout).
    pub fn command_network(command: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Command {
            command,
            status: None,
            message: err.to_string(),
        }
    }

    /// Classify a non-2xx response to a control command.
    pub fn from_status(command: &'static str, status: u16, body: String) -> Self {
        let message = match status {
            404 => format!("thread not found ({status}): {body}"),
            400..=499 => format!("rejected by server ({status}): {body}"),
            _ => format!("server error {status}: {body}"),
        };
        Self::Command {
            command,
            status: Some(status),
            message,
        }
    }

    /// Whether re-issuing the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Command { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            _ => false,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Parse(_) => "parse",
            Self::Command { .. } => "command",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}
