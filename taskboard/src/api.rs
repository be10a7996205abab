//! REST access to the task board.
//!
//! [`TaskApi`] is the narrow seam the retry and conflict layers talk to: read
//! one record, write one versioned patch. [`HttpTaskApi`] implements it over
//! reqwest and also carries the rest of the board's HTTP surface (tasks,
//! activity, groups) for the CLI.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use taskboard_proto::activity::ActivityLogEntry;
use taskboard_proto::api::{
    ActivityQuery, ConflictBody, ConflictError, DeletedBody, ErrorBody, TaskListQuery,
    USER_HEADER, UpdateTaskRequest,
};
use taskboard_proto::group::{CreateGroupRequest, Group, JoinGroupRequest};
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{NewTask, Task, TaskPatch};

/// Errors surfaced by board API calls, one per server outcome class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The expected version was stale; carries the current server record.
    #[error(transparent)]
    VersionConflict(#[from] ConflictError),

    /// The task or group does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request body.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The server failed to persist or read the record.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Missing identity, or the caller is not a member of the group.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The request never produced a usable response.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    /// Returns `true` for failures where the server state is unknown and a
    /// caller may reasonably try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Versioned read/write access to single tasks.
pub trait TaskApi: Send + Sync + 'static {
    /// Fetches the authoritative current record.
    fn fetch(&self, task_id: &TaskId) -> impl Future<Output = Result<Task, ApiError>> + Send;

    /// Submits `patch` against `expected_version`.
    fn update(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
        expected_version: u64,
    ) -> impl Future<Output = Result<Task, ApiError>> + Send;
}

/// HTTP client for a board server.
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    client: Client,
    base_url: String,
    user: UserId,
}

impl HttpTaskApi {
    /// Creates a client for `base_url` acting as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, user: UserId, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
        })
    }

    /// The identity sent with every request.
    #[must_use]
    pub const fn user(&self) -> UserId {
        self.user
    }

    /// The server base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header(USER_HEADER, self.user.to_string())
    }

    /// Lists every task on a group's board.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn list(&self, group_id: &GroupId) -> Result<Vec<Task>, ApiError> {
        let query = TaskListQuery {
            group_id: Some(*group_id),
        };
        let response = send(self.request(reqwest::Method::GET, "/tasks").query(&query)).await?;
        parse(response).await
    }

    /// Creates a task.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn create(&self, draft: &NewTask) -> Result<Task, ApiError> {
        let response = send(self.request(reqwest::Method::POST, "/tasks").json(draft)).await?;
        parse(response).await
    }

    /// Deletes a task.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn delete(&self, task_id: &TaskId) -> Result<TaskId, ApiError> {
        let path = format!("/tasks/{task_id}");
        let response = send(self.request(reqwest::Method::DELETE, &path)).await?;
        let body: DeletedBody = parse(response).await?;
        Ok(body.task_id)
    }

    /// Reads a page of the activity ledger, newest first.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn activity(&self, query: &ActivityQuery) -> Result<Vec<ActivityLogEntry>, ApiError> {
        let response = send(self.request(reqwest::Method::GET, "/actions").query(query)).await?;
        parse(response).await
    }

    /// Creates a group owned by the caller.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn create_group(&self, name: &str) -> Result<Group, ApiError> {
        let body = CreateGroupRequest {
            name: name.to_string(),
        };
        let response = send(self.request(reqwest::Method::POST, "/groups").json(&body)).await?;
        parse(response).await
    }

    /// Joins the group holding `token`.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn join_group(&self, token: &str) -> Result<Group, ApiError> {
        let body = JoinGroupRequest {
            token: token.to_string(),
        };
        let response =
            send(self.request(reqwest::Method::POST, "/groups/join").json(&body)).await?;
        parse(response).await
    }

    /// Lists the caller's groups.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn my_groups(&self) -> Result<Vec<Group>, ApiError> {
        let response = send(self.request(reqwest::Method::GET, "/groups/my")).await?;
        parse(response).await
    }

    /// Leaves a group.
    ///
    /// # Errors
    ///
    /// See [`ApiError`].
    pub async fn leave_group(&self, group_id: &GroupId) -> Result<(), ApiError> {
        let path = format!("/groups/{group_id}");
        let response = send(self.request(reqwest::Method::DELETE, &path)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from(response).await)
        }
    }
}

impl TaskApi for HttpTaskApi {
    async fn fetch(&self, task_id: &TaskId) -> Result<Task, ApiError> {
        let path = format!("/tasks/{task_id}");
        let response = send(self.request(reqwest::Method::GET, &path)).await?;
        parse(response).await
    }

    async fn update(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
        expected_version: u64,
    ) -> Result<Task, ApiError> {
        let path = format!("/tasks/{task_id}");
        let body = UpdateTaskRequest {
            patch: patch.clone(),
            version: expected_version,
        };
        let response = send(self.request(reqwest::Method::PUT, &path).json(&body)).await?;
        let task: Task = parse(response).await?;
        tracing::debug!(task_id = %task_id, version = task.version, "update accepted");
        Ok(task)
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    request.send().await.map_err(|e| {
        tracing::warn!(err = %e, "request failed");
        ApiError::Transport(e.to_string())
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    if response.status().is_success() {
        response
            .json()
            .await
            .map_err(|e| ApiError::Transport(format!("failed to parse response: {e}")))
    } else {
        Err(error_from(response).await)
    }
}

/// Maps a non-success response onto an [`ApiError`].
async fn error_from(response: Response) -> ApiError {
    let status = response.status();
    if status == StatusCode::CONFLICT {
        return match response.json::<ConflictBody>().await {
            Ok(body) => ConflictError::new(body.server_task).into(),
            Err(e) => ApiError::Transport(format!("malformed conflict body: {e}")),
        };
    }

    let text = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ErrorBody>(&text).map_or(text, |body| body.error);
    classify(status, reason)
}

fn classify(status: StatusCode, reason: String) -> ApiError {
    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(reason),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation(reason),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(reason),
        s if s.is_server_error() => ApiError::Storage(reason),
        s => ApiError::Transport(format!("unexpected status {s}: {reason}")),
    }
}
