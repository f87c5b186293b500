//! Session controller: the single owner of derived workflow state.
//!
//! Commands (`start`, `resume`, `approve`, `request_revision`) go to the
//! service; their replies only confirm acceptance. State transitions come
//! from stream events, applied one at a time by [`SessionController::next_update`]
//! and guarded by the active thread id.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use foundry_core::{
    ClientError, CommandKind, ConnectionState, Milestone, Reduction, ThreadId, WorkflowEvent,
    WorkflowState,
};
use foundry_store::{SavedSession, SessionStore};

use crate::api::{CommandAck, ResumeStatus, WorkflowApi};
use crate::backoff::ReconnectPolicy;
use crate::consumer::{StreamConsumer, StreamHandle, StreamUpdate, UpdateKind};
use crate::negotiator::{negotiate, Negotiation};
use crate::transport::StreamTransport;

const UPDATE_BUFFER: usize = 256;

/// Result of resuming a stored session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Stream reopened for this thread.
    Resumed(ThreadId),
    /// Nothing left to run; the store has been cleared.
    AlreadyCompleted(ThreadId),
}

/// What [`SessionController::next_update`] applied.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    Event {
        event: WorkflowEvent,
        milestone: Option<Milestone>,
    },
    Connection(ConnectionState),
    /// Belonged to a session that is no longer active.
    Stale,
}

pub struct SessionController {
    api: Arc<dyn WorkflowApi>,
    consumer: StreamConsumer,
    store: SessionStore,
    state: WorkflowState,
    connection: ConnectionState,
    query: Option<String>,
    stream: Option<StreamHandle>,
    updates_tx: mpsc::Sender<StreamUpdate>,
    updates_rx: mpsc::Receiver<StreamUpdate>,
}

impl SessionController {
    pub fn new(
        api: Arc<dyn WorkflowApi>,
        transport: Arc<dyn StreamTransport>,
        policy: ReconnectPolicy,
        store: SessionStore,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        Self {
            api,
            consumer: StreamConsumer::new(transport, policy),
            store,
            state: WorkflowState::new(),
            connection: ConnectionState::Idle,
            query: None,
            stream: None,
            updates_tx,
            updates_rx,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.state.thread_id()
    }

    /// Query text of the active session, when known.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Check for a stored session that can be resumed.
    pub async fn check_for_interrupted(&self) -> Negotiation {
        negotiate(&self.store, self.api.as_ref()).await
    }

    /// Start a new workflow run and begin streaming it.
    ///
    /// Local state is reset before the request goes out, so a failed start
    /// leaves no session active.
    #[instrument(skip_all)]
    pub async fn start(&mut self, query: &str) -> Result<ThreadId, ClientError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ClientError::InvalidInput("query must not be empty".into()));
        }

        self.detach();
        let resp = self.api.start(query).await?;
        let thread_id = resp.thread_id;

        if let Err(e) = self.store.save(&thread_id, query) {
            warn!(thread_id = %thread_id, error = %e, "failed to persist session");
        }
        info!(thread_id = %thread_id, "workflow started");
        self.adopt(thread_id.clone(), query.to_string());
        Ok(thread_id)
    }

    /// Resume a stored session. Errors leave the store untouched so the
    /// user can retry.
    #[instrument(skip_all, fields(thread_id = %saved.thread_id))]
    pub async fn resume(&mut self, saved: SavedSession) -> Result<ResumeOutcome, ClientError> {
        match self.api.resume(&saved.thread_id).await? {
            ResumeStatus::Resumed => {
                info!("session resumed");
                let thread_id = saved.thread_id.clone();
                self.adopt(saved.thread_id, saved.query);
                Ok(ResumeOutcome::Resumed(thread_id))
            }
            ResumeStatus::AlreadyCompleted => {
                info!("session already completed");
                self.clear_store();
                Ok(ResumeOutcome::AlreadyCompleted(saved.thread_id))
            }
        }
    }

    /// Forget the stored session without contacting the service.
    pub fn discard(&mut self) {
        self.clear_store();
    }

    /// Approve the artifact the workflow paused on.
    #[instrument(skip_all)]
    pub async fn approve(&mut self) -> Result<CommandAck, ClientError> {
        let thread_id = self.awaiting_review()?;
        let ack = self.api.approve(&thread_id).await?;
        let _ = self.state.acknowledge(&thread_id, CommandKind::Approve);
        Ok(ack)
    }

    /// Send the artifact back for another pass with reviewer feedback.
    #[instrument(skip_all)]
    pub async fn request_revision(&mut self, feedback: &str) -> Result<CommandAck, ClientError> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(ClientError::InvalidInput("feedback must not be empty".into()));
        }
        let thread_id = self.awaiting_review()?;
        let ack = self.api.revise(&thread_id, feedback).await?;
        let _ = self.state.acknowledge(&thread_id, CommandKind::Revise);
        Ok(ack)
    }

    /// Wait for the next stream update and apply it.
    ///
    /// Pending forever while no stream is attached.
    pub async fn next_update(&mut self) -> SessionUpdate {
        // the controller keeps a sender for the current channel, so it never closes
        match self.updates_rx.recv().await {
            Some(update) => self.apply_update(update),
            None => SessionUpdate::Stale,
        }
    }

    /// Apply one update if it belongs to the active session.
    pub fn apply_update(&mut self, update: StreamUpdate) -> SessionUpdate {
        if self.state.thread_id() != Some(&update.thread_id) {
            debug!(thread_id = %update.thread_id, "dropping update for inactive session");
            return SessionUpdate::Stale;
        }

        match update.kind {
            UpdateKind::Connection(state) => {
                self.connection = state.clone();
                SessionUpdate::Connection(state)
            }
            UpdateKind::Event(event) => {
                match self.state.apply(&update.thread_id, event.clone()) {
                    Reduction::Stale => SessionUpdate::Stale,
                    Reduction::Applied { milestone } => {
                        if milestone.is_some_and(Milestone::is_terminal) {
                            info!(thread_id = %update.thread_id, ?milestone, "workflow finished");
                            self.clear_store();
                        }
                        SessionUpdate::Event { event, milestone }
                    }
                }
            }
        }
    }

    /// Close the stream and drop the active session from memory. The store
    /// is left as is so an unfinished session can be resumed later.
    ///
    /// The update channel is replaced, so whatever the closed stream already
    /// queued is never applied, even if the same thread is adopted again.
    pub fn detach(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(thread_id = %stream.thread_id(), "closing event stream");
            stream.close();
        }
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        self.updates_tx = updates_tx;
        self.updates_rx = updates_rx;
        self.state.reset(None);
        self.connection = ConnectionState::Idle;
        self.query = None;
    }

    fn adopt(&mut self, thread_id: ThreadId, query: String) {
        self.detach();
        self.state.reset(Some(thread_id.clone()));
        self.query = Some(query);
        self.stream = Some(self.consumer.spawn(thread_id, self.updates_tx.clone()));
    }

    fn awaiting_review(&self) -> Result<ThreadId, ClientError> {
        let thread_id = self
            .state
            .thread_id()
            .cloned()
            .ok_or_else(|| ClientError::InvalidState("no active session".into()))?;
        if self.state.is_terminal() {
            return Err(ClientError::InvalidState("session already finished".into()));
        }
        if !self.state.is_paused() {
            return Err(ClientError::InvalidState("session is not waiting for approval".into()));
        }
        Ok(thread_id)
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear stored session");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::ThreadCheck;
    use crate::mock::{MockCall, MockConnection, MockTransport, MockWorkflowApi};
    use foundry_core::{AgentLabel, SessionStatus};
    use foundry_store::Database;

    const QUERY: &str = "Exposure hierarchy for social anxiety";
    const DRAFTER_START: &str = r#"{"kind":"agent_start","agent":"Drafter","content":"Executing..."}"#;
    const PAUSE: &str = r##"{"kind":"control","content":"Interrupted","state":{"status":"Waiting for Approval","artifact":"# Draft"}}"##;
    const REJECTED: &str = r#"{"type":"control","content":"Finished","state":{"status":"Rejected"}}"#;
    const FINISHED: &str = r##"{"type":"control","content":"Finished","state":{"status":"Approved and Finalized","artifact":"# Final"}}"##;

    struct Harness {
        controller: SessionController,
        api: Arc<MockWorkflowApi>,
        transport: Arc<MockTransport>,
        store: SessionStore,
    }

    fn harness(api: MockWorkflowApi, script: Vec<MockConnection>) -> Harness {
        let api = Arc::new(api);
        let transport = Arc::new(MockTransport::new(script));
        let store = SessionStore::new(Database::in_memory().unwrap());
        let controller = SessionController::new(
            api.clone(),
            transport.clone(),
            ReconnectPolicy::default(),
            store.clone(),
        );
        Harness {
            controller,
            api,
            transport,
            store,
        }
    }

    fn thread(id: &str) -> ThreadId {
        ThreadId::from_raw(id)
    }

    /// Pump updates until `n` events have been applied.
    async fn pump_events(controller: &mut SessionController, n: usize) -> Vec<SessionUpdate> {
        let mut applied = Vec::new();
        let mut events = 0;
        while events < n {
            let update = controller.next_update().await;
            if matches!(update, SessionUpdate::Event { .. }) {
                events += 1;
            }
            applied.push(update);
        }
        applied
    }

    #[tokio::test(start_paused = true)]
    async fn start_streams_to_pause() {
        let mut h = harness(
            MockWorkflowApi::new().starts("t1"),
            vec![MockConnection::hold(&[DRAFTER_START, PAUSE])],
        );

        let thread_id = h.controller.start(QUERY).await.unwrap();
        assert_eq!(thread_id, thread("t1"));
        let saved = h.store.load().unwrap().unwrap();
        assert_eq!(saved.thread_id, thread("t1"));
        assert_eq!(saved.query, QUERY);

        let updates = pump_events(&mut h.controller, 2).await;
        assert!(updates.contains(&SessionUpdate::Connection(ConnectionState::Open)));
        assert!(matches!(
            updates.last(),
            Some(SessionUpdate::Event { milestone: Some(Milestone::Paused), .. })
        ));

        let state = h.controller.state();
        assert!(state.is_paused());
        assert!(!state.is_terminal());
        assert_eq!(state.artifact(), "# Draft");
        assert_eq!(state.log()[0].agent(), Some(&AgentLabel::Drafter));
        assert_eq!(state.session_status(), SessionStatus::WaitingForApproval);
        assert_eq!(h.controller.connection(), &ConnectionState::Open);
        assert_eq!(h.controller.query(), Some(QUERY));
    }

    #[tokio::test]
    async fn blank_query_is_rejected_locally() {
        let mut h = harness(MockWorkflowApi::new(), vec![]);
        let err = h.controller.start("   ").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput(_)));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_start_leaves_no_session() {
        let mut h = harness(
            MockWorkflowApi::new().on_start(Err(ClientError::from_status("start", 500, "boom".into()))),
            vec![],
        );
        assert!(h.controller.start(QUERY).await.is_err());
        assert_eq!(h.controller.thread_id(), None);
        assert_eq!(h.store.load().unwrap(), None);
        assert_eq!(h.transport.open_count(), 0);
    }

    #[tokio::test]
    async fn interrupted_session_prompts_with_saved_query() {
        let h = harness(
            MockWorkflowApi::new().on_check(Ok(ThreadCheck {
                exists: true,
                completed: false,
                ..Default::default()
            })),
            vec![],
        );
        h.store.save(&thread("t1"), QUERY).unwrap();

        match h.controller.check_for_interrupted().await {
            Negotiation::Prompt(saved) => {
                assert_eq!(saved.thread_id, thread("t1"));
                assert_eq!(saved.query, QUERY);
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_session_rejected_clears_store() {
        let mut h = harness(
            MockWorkflowApi::new().on_resume(Ok(ResumeStatus::Resumed)),
            vec![MockConnection::hold(&[REJECTED])],
        );
        h.store.save(&thread("t1"), QUERY).unwrap();
        let saved = h.store.load().unwrap().unwrap();

        let outcome = h.controller.resume(saved).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed(thread("t1")));
        assert_eq!(h.api.calls(), vec![MockCall::Resume(thread("t1"))]);

        let updates = pump_events(&mut h.controller, 1).await;
        assert!(matches!(
            updates.last(),
            Some(SessionUpdate::Event { milestone: Some(Milestone::Rejected), .. })
        ));
        assert_eq!(h.transport.opens()[0].0, thread("t1"));
        assert!(h.controller.state().is_terminal());
        assert_eq!(h.controller.state().session_status(), SessionStatus::Rejected);
        assert_eq!(h.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn already_completed_resume_clears_store_without_stream() {
        let mut h = harness(
            MockWorkflowApi::new().on_resume(Ok(ResumeStatus::AlreadyCompleted)),
            vec![],
        );
        h.store.save(&thread("t1"), QUERY).unwrap();
        let saved = h.store.load().unwrap().unwrap();

        let outcome = h.controller.resume(saved).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::AlreadyCompleted(thread("t1")));
        assert_eq!(h.store.load().unwrap(), None);
        assert_eq!(h.controller.thread_id(), None);
        tokio::task::yield_now().await;
        assert_eq!(h.transport.open_count(), 0);
    }

    #[tokio::test]
    async fn failed_resume_keeps_store() {
        let mut h = harness(
            MockWorkflowApi::new().on_resume(Err(ClientError::from_status(
                "resume",
                404,
                "Thread not found".into(),
            ))),
            vec![],
        );
        h.store.save(&thread("t1"), QUERY).unwrap();
        let saved = h.store.load().unwrap().unwrap();

        assert!(h.controller.resume(saved).await.is_err());
        assert!(h.store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn discard_clears_store() {
        let mut h = harness(MockWorkflowApi::new(), vec![]);
        h.store.save(&thread("t1"), QUERY).unwrap();
        h.controller.discard();
        assert_eq!(h.store.load().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn approve_then_finished_completes() {
        let (live_tx, live) = MockConnection::live();
        let mut h = harness(
            MockWorkflowApi::new().starts("t1").on_approve(Ok(CommandAck {
                status: "Approved".into(),
                saved_to: None,
            })),
            vec![live],
        );
        h.controller.start(QUERY).await.unwrap();
        live_tx.send(Ok(PAUSE.to_string())).unwrap();
        let _ = pump_events(&mut h.controller, 1).await;
        assert!(h.controller.state().is_paused());

        let ack = h.controller.approve().await.unwrap();
        assert_eq!(ack.status, "Approved");
        assert!(!h.controller.state().is_paused());
        assert_eq!(h.api.calls()[1], MockCall::Approve(thread("t1")));

        live_tx.send(Ok(FINISHED.to_string())).unwrap();
        let updates = pump_events(&mut h.controller, 1).await;
        assert!(matches!(
            updates.last(),
            Some(SessionUpdate::Event { milestone: Some(Milestone::Completed), .. })
        ));
        assert!(h.controller.state().is_terminal());
        assert_eq!(h.controller.state().artifact(), "# Final");
        assert_eq!(h.store.load().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn approve_requires_pause() {
        let mut h = harness(
            MockWorkflowApi::new().starts("t1"),
            vec![MockConnection::hold(&[])],
        );
        let err = h.controller.approve().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));

        h.controller.start(QUERY).await.unwrap();
        let err = h.controller.approve().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
        assert_eq!(h.api.calls(), vec![MockCall::Start(QUERY.into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn revision_validates_and_trims_feedback() {
        let mut h = harness(
            MockWorkflowApi::new().starts("t1").on_revise(Ok(CommandAck {
                status: "Revision Requested".into(),
                saved_to: None,
            })),
            vec![MockConnection::hold(&[PAUSE])],
        );
        h.controller.start(QUERY).await.unwrap();
        let _ = pump_events(&mut h.controller, 1).await;

        let err = h.controller.request_revision("  ").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput(_)));
        assert!(h.controller.state().is_paused());

        h.controller.request_revision("  add more steps ").await.unwrap();
        assert!(!h.controller.state().is_paused());
        assert_eq!(
            h.api.calls().last(),
            Some(&MockCall::Revise(thread("t1"), "add more steps".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_approve_keeps_pause_and_store() {
        let mut h = harness(
            MockWorkflowApi::new().starts("t1").on_approve(Err(ClientError::command_network(
                "approve",
                "connection refused",
            ))),
            vec![MockConnection::hold(&[PAUSE])],
        );
        h.controller.start(QUERY).await.unwrap();
        let _ = pump_events(&mut h.controller, 1).await;

        let err = h.controller.approve().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(h.controller.state().is_paused());
        assert!(h.store.load().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_updates_never_touch_new_session() {
        let (a_tx, a_live) = MockConnection::live();
        let mut h = harness(
            MockWorkflowApi::new().starts("A").starts("B"),
            vec![a_live, MockConnection::hold(&[])],
        );

        h.controller.start("first").await.unwrap();
        h.controller.start("second").await.unwrap();
        assert_eq!(h.controller.thread_id(), Some(&thread("B")));

        // A's consumer is cancelled; anything it sends is never delivered
        let _ = a_tx.send(Ok(PAUSE.to_string()));

        // an update already queued for A is dropped by the id guard
        let stale = h.controller.apply_update(StreamUpdate {
            thread_id: thread("A"),
            kind: UpdateKind::Event(foundry_core::parse_event(PAUSE).unwrap()),
        });
        assert_eq!(stale, SessionUpdate::Stale);
        let stale = h.controller.apply_update(StreamUpdate {
            thread_id: thread("A"),
            kind: UpdateKind::Connection(ConnectionState::Failed),
        });
        assert_eq!(stale, SessionUpdate::Stale);

        let state = h.controller.state();
        assert!(!state.is_paused());
        assert_eq!(state.artifact(), "");
        assert!(state.log().is_empty());
        assert_ne!(h.controller.connection(), &ConnectionState::Failed);
        assert_eq!(h.store.load().unwrap().unwrap().thread_id, thread("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_stream_failure_is_logged_once() {
        let mut h = harness(MockWorkflowApi::new().starts("t1"), vec![]);
        h.controller.start(QUERY).await.unwrap();

        loop {
            let update = h.controller.next_update().await;
            if update == SessionUpdate::Connection(ConnectionState::Failed) {
                break;
            }
        }
        let _ = pump_events(&mut h.controller, 1).await;

        let log = h.controller.state().log();
        assert_eq!(log.len(), 6, "five reconnect notices and one failure");
        assert_eq!(log.last(), Some(&WorkflowEvent::connection_failed()));
        assert_eq!(h.transport.open_count(), 6);

        // failure does not end the session; it can be resumed later
        assert!(h.store.load().unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_same_thread_drops_old_stream_updates() {
        let mut script: Vec<MockConnection> = (0..6).map(|_| MockConnection::refused()).collect();
        script.push(MockConnection::hold(&[DRAFTER_START]));
        let mut h = harness(
            MockWorkflowApi::new().starts("t1").on_resume(Ok(ResumeStatus::Resumed)),
            script,
        );
        h.controller.start(QUERY).await.unwrap();

        // let the first stream exhaust its reconnects without draining anything
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 6);

        let saved = h.store.load().unwrap().unwrap();
        let outcome = h.controller.resume(saved).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Resumed(thread("t1")));
        assert!(h.controller.state().log().is_empty());

        let updates = pump_events(&mut h.controller, 1).await;
        assert_eq!(
            updates[..2],
            [
                SessionUpdate::Connection(ConnectionState::Connecting),
                SessionUpdate::Connection(ConnectionState::Open),
            ]
        );
        assert!(!updates.iter().any(|u| matches!(
            u,
            SessionUpdate::Connection(ConnectionState::Reconnecting { .. } | ConnectionState::Failed)
        )));

        let log = h.controller.state().log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].agent(), Some(&AgentLabel::Drafter));
        assert_eq!(h.controller.connection(), &ConnectionState::Open);
        assert_eq!(h.transport.open_count(), 7);
    }
}
