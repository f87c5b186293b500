//! Client side of the human-in-the-loop workflow service: HTTP control
//! commands, the resilient event stream, startup resume negotiation, and
//! the session controller tying them to a single derived state.

pub mod api;
pub mod backoff;
pub mod consumer;
pub mod mock;
pub mod negotiator;
pub mod session;
pub mod sse;
pub mod transport;

pub use api::{CommandAck, HttpWorkflowApi, ResumeStatus, StartResponse, ThreadCheck, WorkflowApi};
pub use backoff::{Backoff, ReconnectPolicy};
pub use consumer::{StreamConsumer, StreamHandle, StreamUpdate, UpdateKind};
pub use negotiator::{negotiate, ClearReason, Negotiation};
pub use session::{ResumeOutcome, SessionController, SessionUpdate};
pub use transport::{HttpStreamTransport, MessageStream, StreamTransport};
