//! Event stream consumer.
//!
//! One task per session id. It opens the stream, decodes each message into
//! a [`WorkflowEvent`], and forwards it tagged with the session id. Failed or
//! closed connections are retried on the [`ReconnectPolicy`] schedule; a
//! message that decodes successfully resets the schedule. When the budget is
//! spent the task reports [`ConnectionState::Failed`], emits one synthetic
//! error event, and exits.
//!
//! Cancellation (explicit or by dropping the [`StreamHandle`]) interrupts
//! the task at any await point, including a pending reconnect delay.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foundry_core::{parse_event, ConnectionState, ThreadId, WorkflowEvent};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::transport::StreamTransport;

/// Something the consumer observed for `thread_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamUpdate {
    pub thread_id: ThreadId,
    pub kind: UpdateKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateKind {
    Event(WorkflowEvent),
    Connection(ConnectionState),
}

/// Spawns per-session consumer tasks over a shared transport.
#[derive(Clone)]
pub struct StreamConsumer {
    transport: Arc<dyn StreamTransport>,
    policy: ReconnectPolicy,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn StreamTransport>, policy: ReconnectPolicy) -> Self {
        Self { transport, policy }
    }

    /// Start consuming `thread_id`'s stream, sending updates into `updates`.
    pub fn spawn(&self, thread_id: ThreadId, updates: mpsc::Sender<StreamUpdate>) -> StreamHandle {
        let cancel = CancellationToken::new();
        let emitter = Emitter {
            thread_id: thread_id.clone(),
            updates,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run(
            self.transport.clone(),
            self.policy.clone(),
            emitter,
        ));
        StreamHandle {
            thread_id,
            cancel,
            task: Some(task),
        }
    }
}

/// Owns a running consumer task. Dropping the handle cancels the task.
pub struct StreamHandle {
    thread_id: ThreadId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited (cancelled or failed permanently).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(thread_id = %self.thread_id, error = %e, "stream consumer task panicked");
                }
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Emitter {
    thread_id: ThreadId,
    updates: mpsc::Sender<StreamUpdate>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Returns `false` once the task should stop (cancelled or receiver gone).
    async fn emit(&self, kind: UpdateKind) -> bool {
        let update = StreamUpdate {
            thread_id: self.thread_id.clone(),
            kind,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.updates.send(update) => sent.is_ok(),
        }
    }

    async fn connection(&self, state: ConnectionState) -> bool {
        self.emit(UpdateKind::Connection(state)).await
    }

    async fn event(&self, event: WorkflowEvent) -> bool {
        self.emit(UpdateKind::Event(event)).await
    }
}

async fn run(transport: Arc<dyn StreamTransport>, policy: ReconnectPolicy, out: Emitter) {
    let thread_id = out.thread_id.clone();
    let max_attempts = policy.max_attempts;
    let mut backoff = Backoff::new(policy);

    loop {
        if !out.connection(ConnectionState::Connecting).await {
            return;
        }

        let opened = tokio::select! {
            _ = out.cancel.cancelled() => return,
            opened = transport.open(&thread_id) => opened,
        };

        match opened {
            Ok(mut messages) => {
                if !out.connection(ConnectionState::Open).await {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = out.cancel.cancelled() => return,
                        next = messages.next() => next,
                    };
                    match next {
                        Some(Ok(data)) => match parse_event(&data) {
                            Ok(event) => {
                                backoff.reset();
                                if !out.event(event).await {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    thread_id = %thread_id,
                                    error = %e,
                                    error_kind = e.error_kind(),
                                    "dropping malformed event"
                                );
                            }
                        },
                        Some(Err(e)) => {
                            warn!(
                                thread_id = %thread_id,
                                error = %e,
                                error_kind = e.error_kind(),
                                "event stream failed"
                            );
                            break;
                        }
                        None => {
                            info!(thread_id = %thread_id, "event stream closed by server");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    thread_id = %thread_id,
                    error = %e,
                    error_kind = e.error_kind(),
                    "failed to open event stream"
                );
            }
        }

        let Some((attempt, delay)) = backoff.next_delay() else {
            warn!(thread_id = %thread_id, max_attempts, "giving up on event stream");
            if out.connection(ConnectionState::Failed).await {
                let _ = out.event(WorkflowEvent::connection_failed()).await;
            }
            return;
        };

        debug!(thread_id = %thread_id, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        if !out
            .connection(ConnectionState::Reconnecting {
                attempt,
                next_delay: delay,
            })
            .await
            || !out
                .event(WorkflowEvent::reconnect_notice(attempt, max_attempts))
                .await
        {
            return;
        }

        tokio::select! {
            _ = out.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
