pub mod connection;
pub mod errors;
pub mod events;
pub mod ids;
pub mod reducer;

pub use connection::ConnectionState;
pub use errors::ClientError;
pub use events::{
    parse_event, AgentLabel, ControlSignal, LoopCounters, StateSnapshot, WorkflowEvent,
    WorkflowStatus,
};
pub use ids::ThreadId;
pub use reducer::{CommandKind, Milestone, Reduction, SessionStatus, WorkflowState};
