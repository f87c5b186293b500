use std::fmt;
use std::time::Duration;

/// Lifecycle of the event stream for the active session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session adopted, or the stream was torn down.
    #[default]
    Idle,
    Connecting,
    Open,
    /// The stream dropped; `attempt` (1-indexed) opens after `next_delay`.
    Reconnecting { attempt: u32, next_delay: Duration },
    /// Reconnect attempts exhausted. Only reopening the session recovers.
    Failed,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Reconnecting {
                attempt,
                next_delay,
            } => write!(
                f,
                "reconnecting (attempt {attempt} in {}ms)",
                next_delay.as_millis()
            ),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness() {
        assert!(!ConnectionState::Idle.is_live());
        assert!(ConnectionState::Open.is_live());
        assert!(ConnectionState::Reconnecting {
            attempt: 1,
            next_delay: Duration::from_secs(1)
        }
        .is_live());
        assert!(!ConnectionState::Failed.is_live());
    }

    #[test]
    fn display_reconnecting() {
        let state = ConnectionState::Reconnecting {
            attempt: 3,
            next_delay: Duration::from_millis(4000),
        };
        assert_eq!(state.to_string(), "reconnecting (attempt 3 in 4000ms)");
    }
}
