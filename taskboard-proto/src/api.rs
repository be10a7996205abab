//! REST request and response bodies shared by the server and the client.
//!
//! All bodies are JSON. Field names follow the board's HTTP surface
//! (`serverTask`, `groupId`, `pageSize`), everything else stays snake case.

use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, TaskId};
use crate::task::{Task, TaskPatch};

/// Header carrying the caller's user id. Session issuance happens upstream;
/// the board trusts whatever identity arrives here.
pub const USER_HEADER: &str = "x-user-id";

/// Default page size for activity queries.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// A mutation was rejected because the caller's expected version is stale.
///
/// Carries the record as currently persisted so the caller can diff
/// against it. The caller must not assume which fields differ.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "version conflict on task {}: server is at version {}",
    .server_task.id,
    .server_task.version
)]
pub struct ConflictError {
    /// The current persisted record.
    pub server_task: Box<Task>,
}

impl ConflictError {
    /// Wraps the current persisted record.
    #[must_use]
    pub fn new(server_task: Task) -> Self {
        Self {
            server_task: Box::new(server_task),
        }
    }
}

/// `PUT /tasks/{id}` body: patch fields plus the version the caller last saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    /// Fields to change.
    #[serde(flatten)]
    pub patch: TaskPatch,
    /// Expected persisted version.
    pub version: u64,
}

/// `409 Conflict` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBody {
    /// The current persisted record.
    #[serde(rename = "serverTask")]
    pub server_task: Task,
}

/// Body of any other error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason.
    pub error: String,
}

/// `DELETE /tasks/{id}` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedBody {
    /// The removed task.
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
}

/// Query string of `GET /tasks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListQuery {
    /// Group whose board to list.
    #[serde(rename = "groupId")]
    pub group_id: Option<GroupId>,
}

/// Query string of `GET /actions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityQuery {
    /// Restrict to one group's entries.
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: usize,
    /// Entries per page.
    #[serde(rename = "pageSize", default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ActivityQuery {
    fn default() -> Self {
        Self {
            group_id: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

const fn default_page() -> usize {
    1
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
