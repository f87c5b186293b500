//! Scripted stand-ins for [`StreamTransport`] and [`WorkflowApi`] for
//! deterministic tests without a running service.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use foundry_core::{ClientError, ThreadId};

use crate::api::{CommandAck, ResumeStatus, StartResponse, ThreadCheck, WorkflowApi};
use crate::transport::{MessageStream, StreamTransport};

/// What one `open` call produces.
pub enum MockConnection {
    /// `open` itself fails.
    Refuse(ClientError),
    /// Yield these items, then end (a clean server close).
    Messages(Vec<Result<String, ClientError>>),
    /// Yield these messages, then stay open until cancelled.
    Hold(Vec<String>),
    /// Forward whatever the test pushes into the paired sender.
    Live(mpsc::UnboundedReceiver<Result<String, ClientError>>),
}

impl MockConnection {
    pub fn refused() -> Self {
        Self::Refuse(ClientError::Transport("connection refused".into()))
    }

    /// Deliver `messages`, then fail with a read error.
    pub fn dropped_after(messages: &[&str]) -> Self {
        let mut items: Vec<_> = messages.iter().map(|m| Ok(m.to_string())).collect();
        items.push(Err(ClientError::Transport("connection reset".into())));
        Self::Messages(items)
    }

    pub fn hold(messages: &[&str]) -> Self {
        Self::Hold(messages.iter().map(|m| m.to_string()).collect())
    }

    /// A connection driven by the returned sender.
    pub fn live() -> (mpsc::UnboundedSender<Result<String, ClientError>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::Live(rx))
    }
}

/// Transport that replays scripted connections in order. Once the script
/// runs out every `open` is refused.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockConnection>>,
    opens: Mutex<Vec<(ThreadId, Instant)>>,
}

impl MockTransport {
    pub fn new(script: Vec<MockConnection>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Every `open` call so far, with the (tokio) time it happened.
    pub fn opens(&self) -> Vec<(ThreadId, Instant)> {
        self.opens.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn open(&self, thread_id: &ThreadId) -> Result<MessageStream, ClientError> {
        self.opens.lock().push((thread_id.clone(), Instant::now()));
        let next = self.script.lock().pop_front();
        match next.unwrap_or_else(MockConnection::refused) {
            MockConnection::Refuse(err) => Err(err),
            MockConnection::Messages(items) => Ok(futures::stream::iter(items).boxed()),
            MockConnection::Hold(messages) => Ok(futures::stream::iter(
                messages.into_iter().map(Ok::<String, ClientError>),
            )
            .chain(futures::stream::pending())
            .boxed()),
            MockConnection::Live(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
        }
    }
}

/// A recorded [`WorkflowApi`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Start(String),
    Approve(ThreadId),
    Revise(ThreadId, String),
    Resume(ThreadId),
    CheckThread(ThreadId),
}

/// Workflow API answering from per-command queues of canned replies.
#[derive(Default)]
pub struct MockWorkflowApi {
    starts: Mutex<VecDeque<Result<StartResponse, ClientError>>>,
    approvals: Mutex<VecDeque<Result<CommandAck, ClientError>>>,
    revisions: Mutex<VecDeque<Result<CommandAck, ClientError>>>,
    resumes: Mutex<VecDeque<Result<ResumeStatus, ClientError>>>,
    checks: Mutex<VecDeque<Result<ThreadCheck, ClientError>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockWorkflowApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(self, reply: Result<StartResponse, ClientError>) -> Self {
        self.starts.lock().push_back(reply);
        self
    }

    /// Shorthand for a successful start returning `thread_id`.
    pub fn starts(self, thread_id: &str) -> Self {
        self.on_start(Ok(StartResponse {
            thread_id: ThreadId::from_raw(thread_id),
            status: "Started".into(),
        }))
    }

    pub fn on_approve(self, reply: Result<CommandAck, ClientError>) -> Self {
        self.approvals.lock().push_back(reply);
        self
    }

    pub fn on_revise(self, reply: Result<CommandAck, ClientError>) -> Self {
        self.revisions.lock().push_back(reply);
        self
    }

    pub fn on_resume(self, reply: Result<ResumeStatus, ClientError>) -> Self {
        self.resumes.lock().push_back(reply);
        self
    }

    pub fn on_check(self, reply: Result<ThreadCheck, ClientError>) -> Self {
        self.checks.lock().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

fn next_reply<T>(
    queue: &Mutex<VecDeque<Result<T, ClientError>>>,
    command: &'static str,
) -> Result<T, ClientError> {
    queue.lock().pop_front().unwrap_or_else(|| {
        Err(ClientError::Command {
            command,
            status: None,
            message: "no scripted reply".into(),
        })
    })
}

#[async_trait]
impl WorkflowApi for MockWorkflowApi {
    async fn start(&self, query: &str) -> Result<StartResponse, ClientError> {
        self.record(MockCall::Start(query.to_string()));
        next_reply(&self.starts, "start")
    }

    async fn approve(&self, thread_id: &ThreadId) -> Result<CommandAck, ClientError> {
        self.record(MockCall::Approve(thread_id.clone()));
        next_reply(&self.approvals, "approve")
    }

    async fn revise(
        &self,
        thread_id: &ThreadId,
        feedback: &str,
    ) -> Result<CommandAck, ClientError> {
        self.record(MockCall::Revise(thread_id.clone(), feedback.to_string()));
        next_reply(&self.revisions, "revise")
    }

    async fn resume(&self, thread_id: &ThreadId) -> Result<ResumeStatus, ClientError> {
        self.record(MockCall::Resume(thread_id.clone()));
        next_reply(&self.resumes, "resume")
    }

    async fn check_thread(&self, thread_id: &ThreadId) -> Result<ThreadCheck, ClientError> {
        self.record(MockCall::CheckThread(thread_id.clone()));
        next_reply(&self.checks, "check_thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_replays_script_then_refuses() {
        let transport = MockTransport::new(vec![MockConnection::Messages(vec![Ok("a".into())])]);
        let thread = ThreadId::from_raw("t1");

        let items: Vec<_> = transport.open(&thread).await.unwrap().collect().await;
        assert_eq!(items, vec![Ok("a".to_string())]);
        assert!(transport.open(&thread).await.is_err());
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn api_records_calls_and_runs_dry() {
        let api = MockWorkflowApi::new().starts("t1");
        assert_eq!(api.start("q").await.unwrap().thread_id.as_str(), "t1");
        let err = api.start("q").await.unwrap_err();
        assert!(matches!(err, ClientError::Command { command: "start", .. }));
        assert_eq!(
            api.calls(),
            vec![MockCall::Start("q".into()), MockCall::Start("q".into())]
        );
    }
}
