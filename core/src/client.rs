//! Authenticated HTTP client for the farmhand manager.
//!
//! One thin, typed method per endpoint the worker consumes. Credentials are
//! installed after registration (or loading a stored identity) and carried as
//! HTTP Basic auth on every authenticated call; they live behind a lock so a
//! forced re-registration can swap them without racing in-flight calls into a
//! torn id/secret pair.
//!
//! The client only reports outcomes. Retry loops, backoff and the decision
//! whether a failure is fatal belong to the callers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use crate::documents::{
    MayKeepRunning, RegistrationReply, RegistrationRequest, SignOnRequest, StatusChangeRequest,
    StatusUpdate, Task, WorkerIdentity,
};
use crate::error::{CoreError, CoreResult};

/// Header carrying the durable queue sequence number of a status update, so
/// the manager can deduplicate re-sent updates (delivery is at-least-once).
pub const UPDATE_SEQ_HEADER: &str = "X-Farmhand-Update-Seq";

/// Outcome of a task fetch.
#[derive(Debug, Clone)]
pub enum TaskFetch {
    /// The manager assigned us a task.
    Assigned(Task),
    /// No work available right now (204).
    NoWork,
    /// The manager wants us in a different state instead (423).
    StateChange(StatusChangeRequest),
}

/// HTTP client for the manager, cheap to clone.
#[derive(Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<RwLock<Option<WorkerIdentity>>>,
}

impl ManagerClient {
    /// Create a client for the given manager base URL.
    ///
    /// `timeout` bounds every individual call; the retry-forever behaviour
    /// around failed calls is the caller's business.
    pub fn new(base_url: &str, timeout: Duration) -> CoreResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| CoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::InvalidUrl(base_url.to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("farmhand-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            credentials: Arc::new(RwLock::new(None)),
        })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Install the credential pair used for authenticated calls.
    pub fn set_credentials(&self, identity: WorkerIdentity) {
        *self.credentials.write() = Some(identity);
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.read().is_some()
    }

    fn url(&self, path: &str) -> CoreResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| CoreError::InvalidUrl(format!("{path}: {e}")))
    }

    fn authenticated(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.credentials.read().as_ref() {
            Some(identity) => {
                builder.basic_auth(&identity.worker_id, Some(&identity.worker_secret))
            }
            None => builder,
        }
    }

    async fn expect_2xx(response: Response) -> CoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CoreError::Status { status, body })
    }

    /// `POST /register-worker`: announce ourselves and obtain a worker id.
    ///
    /// Unauthenticated: the secret in the request body becomes our password.
    pub async fn register_worker(&self, request: &RegistrationRequest) -> CoreResult<String> {
        let response = self
            .http
            .post(self.url("/register-worker")?)
            .json(request)
            .send()
            .await?;
        let reply: RegistrationReply = Self::expect_2xx(response).await?.json().await?;
        debug!(worker_id = %reply.id, "manager accepted registration");
        Ok(reply.id)
    }

    /// `POST /sign-on`: announce an existing identity and our task types.
    pub async fn sign_on(&self, request: &SignOnRequest) -> CoreResult<()> {
        let response = self
            .authenticated(self.http.post(self.url("/sign-on")?))
            .json(request)
            .send()
            .await?;
        Self::expect_2xx(response).await?;
        Ok(())
    }

    /// `POST /sign-off`: notify clean shutdown.
    pub async fn sign_off(&self) -> CoreResult<()> {
        let response = self
            .authenticated(self.http.post(self.url("/sign-off")?))
            .send()
            .await?;
        Self::expect_2xx(response).await?;
        Ok(())
    }

    /// `POST /task`: request the next task.
    pub async fn fetch_task(&self) -> CoreResult<TaskFetch> {
        let response = self
            .authenticated(self.http.post(self.url("/task")?))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(TaskFetch::NoWork),
            StatusCode::LOCKED => {
                let request: StatusChangeRequest = response.json().await?;
                Ok(TaskFetch::StateChange(request))
            }
            _ => {
                let task: Task = Self::expect_2xx(response).await?.json().await?;
                Ok(TaskFetch::Assigned(task))
            }
        }
    }

    /// `POST /tasks/{task_id}/update`: deliver one status update.
    ///
    /// `seq` is the durable queue sequence number; it rides along in a header
    /// so the manager can treat re-delivery as idempotent.
    pub async fn send_task_update(
        &self,
        task_id: &str,
        seq: i64,
        update: &StatusUpdate,
    ) -> CoreResult<()> {
        let response = self
            .authenticated(self.http.post(self.url(&format!("/tasks/{task_id}/update"))?))
            .header(UPDATE_SEQ_HEADER, seq)
            .json(update)
            .send()
            .await?;
        Self::expect_2xx(response).await?;
        Ok(())
    }

    /// `GET /may-i-run/{task_id}`: ask whether we may keep running a task.
    pub async fn may_i_run(&self, task_id: &str) -> CoreResult<MayKeepRunning> {
        let response = self
            .authenticated(self.http.get(self.url(&format!("/may-i-run/{task_id}"))?))
            .send()
            .await?;
        let reply = Self::expect_2xx(response).await?.json().await?;
        Ok(reply)
    }

    /// `GET /status-change`: poll for a requested state change while asleep.
    ///
    /// Returns `None` on 204 (no change requested).
    pub async fn check_status_change(&self) -> CoreResult<Option<StatusChangeRequest>> {
        let response = self
            .authenticated(self.http.get(self.url("/status-change")?))
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let request = Self::expect_2xx(response).await?.json().await?;
        Ok(Some(request))
    }

    /// `POST /ack-status-change/{status}`: confirm we reached a state.
    pub async fn ack_status_change(&self, status: &str) -> CoreResult<()> {
        let response = self
            .authenticated(
                self.http
                    .post(self.url(&format!("/ack-status-change/{status}"))?),
            )
            .send()
            .await?;
        Self::expect_2xx(response).await?;
        Ok(())
    }

    /// `POST /tasks/{task_id}/return`: hand a task back for re-scheduling.
    pub async fn return_task(&self, task_id: &str) -> CoreResult<()> {
        let response = self
            .authenticated(self.http.post(self.url(&format!("/tasks/{task_id}/return"))?))
            .send()
            .await?;
        Self::expect_2xx(response).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_credentials", &self.has_credentials())
            .finish()
    }
}
