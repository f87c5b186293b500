//! Startup check for a session left behind by a previous run.

use tracing::{info, instrument, warn};

use foundry_core::{ClientError, ThreadId};
use foundry_store::{SavedSession, SessionStore};

use crate::api::WorkflowApi;

/// Outcome of [`negotiate`].
#[derive(Clone, Debug, PartialEq)]
pub enum Negotiation {
    /// Nothing stored.
    NoSession,
    /// A stored session was stale and has been forgotten.
    Cleared {
        thread_id: ThreadId,
        reason: ClearReason,
    },
    /// The stored session can be resumed or discarded.
    Prompt(SavedSession),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClearReason {
    NotFound,
    Completed,
    /// The status query failed; stale state is dropped rather than retried.
    CheckFailed(ClientError),
}

/// Inspect the session store and ask the service whether the stored session
/// is still resumable. Anything other than "exists and not completed" clears
/// the store.
#[instrument(skip_all)]
pub async fn negotiate(store: &SessionStore, api: &dyn WorkflowApi) -> Negotiation {
    let saved = match store.load() {
        Ok(Some(saved)) => saved,
        Ok(None) => return Negotiation::NoSession,
        Err(e) => {
            warn!(error = %e, "session store unreadable, treating as empty");
            return Negotiation::NoSession;
        }
    };

    let reason = match api.check_thread(&saved.thread_id).await {
        Ok(check) if check.is_resumable() => {
            info!(thread_id = %saved.thread_id, "interrupted session found");
            return Negotiation::Prompt(saved);
        }
        Ok(check) if !check.exists => ClearReason::NotFound,
        Ok(_) => ClearReason::Completed,
        Err(e) => {
            warn!(
                thread_id = %saved.thread_id,
                error = %e,
                error_kind = e.error_kind(),
                "session check failed, discarding"
            );
            ClearReason::CheckFailed(e)
        }
    };

    if let Err(e) = store.clear() {
        warn!(error = %e, "failed to clear stale session");
    }
    info!(thread_id = %saved.thread_id, ?reason, "stored session cleared");
    Negotiation::Cleared {
        thread_id: saved.thread_id,
        reason,
    }
}
