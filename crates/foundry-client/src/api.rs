use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use foundry_core::{ClientError, ThreadId, WorkflowStatus};

/// Reply to `POST /start`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StartResponse {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub status: String,
}

/// Acceptance of an approve or revise. Carries no workflow state; the
/// resulting transition arrives on the event stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CommandAck {
    #[serde(default)]
    pub status: String,
    /// Where the service stored the approved artifact, if it did.
    #[serde(default)]
    pub saved_to: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStatus {
    Resumed,
    AlreadyCompleted,
}

impl ResumeStatus {
    fn from_wire(status: &str) -> Option<Self> {
        match status {
            "Resumed" => Some(Self::Resumed),
            "Already completed" => Some(Self::AlreadyCompleted),
            _ => None,
        }
    }
}

/// Reply to `GET /check_thread/{id}`. An unknown thread comes back as just
/// `{"exists": false}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ThreadCheck {
    pub exists: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub next_node: Option<String>,
}

impl ThreadCheck {
    pub fn is_resumable(&self) -> bool {
        self.exists && !self.completed
    }
}

#[derive(Deserialize)]
struct ResumeReply {
    status: String,
}

/// Request/response commands against the workflow service.
#[async_trait]
pub trait WorkflowApi: Send + Sync + 'static {
    async fn start(&self, query: &str) -> Result<StartResponse, ClientError>;
    async fn approve(&self, thread_id: &ThreadId) -> Result<CommandAck, ClientError>;
    async fn revise(&self, thread_id: &ThreadId, feedback: &str)
        -> Result<CommandAck, ClientError>;
    async fn resume(&self, thread_id: &ThreadId) -> Result<ResumeStatus, ClientError>;
    async fn check_thread(&self, thread_id: &ThreadId) -> Result<ThreadCheck, ClientError>;
}

/// [`WorkflowApi`] over JSON/HTTP.
pub struct HttpWorkflowApi {
    client: Client,
    base_url: String,
}

impl HttpWorkflowApi {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, command: &'static str, path: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::command_network(command, e))?;
        decode(command, resp).await
    }

    async fn get<R: DeserializeOwned>(&self, command: &'static str, path: &str) -> Result<R, ClientError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| ClientError::command_network(command, e))?;
        decode(command, resp).await
    }
}

async fn decode<R: DeserializeOwned>(command: &'static str, resp: Response) -> Result<R, ClientError> {
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::from_status(command, status, body));
    }
    resp.json::<R>().await.map_err(|e| ClientError::Command {
        command,
        status: Some(status),
        message: format!("invalid response body: {e}"),
    })
}

#[async_trait]
impl WorkflowApi for HttpWorkflowApi {
    #[instrument(skip_all)]
    async fn start(&self, query: &str) -> Result<StartResponse, ClientError> {
        let resp: StartResponse = self.post("start", "/start", &json!({ "query": query })).await?;
        debug!(thread_id = %resp.thread_id, status = %resp.status, "workflow started");
        Ok(resp)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn approve(&self, thread_id: &ThreadId) -> Result<CommandAck, ClientError> {
        self.post("approve", "/approve", &json!({ "thread_id": thread_id }))
            .await
    }

    #[instrument(skip(self, feedback), fields(thread_id = %thread_id))]
    async fn revise(
        &self,
        thread_id: &ThreadId,
        feedback: &str,
    ) -> Result<CommandAck, ClientError> {
        self.post(
            "revise",
            "/revise",
            &json!({ "thread_id": thread_id, "feedback": feedback }),
        )
        .await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn resume(&self, thread_id: &ThreadId) -> Result<ResumeStatus, ClientError> {
        let reply: ResumeReply = self
            .post("resume", "/resume", &json!({ "thread_id": thread_id }))
            .await?;
        ResumeStatus::from_wire(&reply.status).ok_or_else(|| ClientError::Command {
            command: "resume",
            status: None,
            message: format!("unexpected resume status {:?}", reply.status),
        })
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn check_thread(&self, thread_id: &ThreadId) -> Result<ThreadCheck, ClientError> {
        self.get("check_thread", &format!("/check_thread/{thread_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_status_from_wire() {
        assert_eq!(ResumeStatus::from_wire("Resumed"), Some(ResumeStatus::Resumed));
        assert_eq!(
            ResumeStatus::from_wire("Already completed"),
            Some(ResumeStatus::AlreadyCompleted)
        );
        assert_eq!(ResumeStatus::from_wire("resumed"), None);
    }

    #[test]
    fn thread_check_missing_thread() {
        let check: ThreadCheck = serde_json::from_str(r#"{"exists": false}"#).unwrap();
        assert!(!check.exists);
        assert!(!check.is_resumable());
        assert_eq!(check.status, None);
    }

    #[test]
    fn thread_check_full_reply() {
        let check: ThreadCheck = serde_json::from_str(
            r##"{"exists": true, "completed": false, "status": "Waiting for Approval",
                "artifact": "# Draft", "next_node": "HumanReview"}"##,
        )
        .unwrap();
        assert!(check.is_resumable());
        assert_eq!(check.status, Some(WorkflowStatus::WaitingForApproval));
        assert_eq!(check.artifact.as_deref(), Some("# Draft"));
        assert_eq!(check.next_node.as_deref(), Some("HumanReview"));
    }

    #[test]
    fn thread_check_null_next_node() {
        let check: ThreadCheck =
            serde_json::from_str(r#"{"exists": true, "completed": true, "next_node": null}"#)
                .unwrap();
        assert!(!check.is_resumable());
        assert_eq!(check.next_node, None);
    }

    #[test]
    fn approve_ack_with_saved_path() {
        let ack: CommandAck =
            serde_json::from_str(r#"{"status": "Approved", "saved_to": "/tmp/p.md"}"#).unwrap();
        assert_eq!(ack.status, "Approved");
        assert_eq!(ack.saved_to.as_deref(), Some("/tmp/p.md"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let api = HttpWorkflowApi::new(
            "http://localhost:8000/",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(api.base_url(), "http://localhost:8000");
    }
}
