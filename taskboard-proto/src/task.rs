//! The versioned task record and its partial-update patch.
//!
//! A [`Task`] carries a monotonic `version` used for optimistic concurrency:
//! a mutation names the version it last observed and is accepted only if
//! that is still the persisted version. The version itself is owned by the
//! server-side coordinator; nothing in this module increments it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{GroupId, TaskId, UserId};

/// Version stamped on a freshly created task.
pub const INITIAL_VERSION: u64 = 1;

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Maximum allowed task description length in characters.
pub const MAX_TASK_DESCRIPTION_LENGTH: usize = 4096;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Errors raised when a create body or patch is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Task title cannot be empty.
    #[error("task title cannot be empty")]
    TitleEmpty,
    /// Task title exceeds the maximum length.
    #[error("task title too long (max {MAX_TASK_TITLE_LENGTH} characters)")]
    TitleTooLong,
    /// Task description exceeds the maximum length.
    #[error("task description too long (max {MAX_TASK_DESCRIPTION_LENGTH} characters)")]
    DescriptionTooLong,
    /// The patch does not change any field.
    #[error("patch does not change any field")]
    EmptyPatch,
    /// The patch names an assignee and also asks for auto-assignment.
    #[error("patch cannot both name an assignee and auto-assign")]
    ConflictingAssignee,
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Can wait.
    Low,
    /// Normal priority.
    #[default]
    Medium,
    /// Needs attention first.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Board column a task sits in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Todo,
    /// Actively being worked on.
    #[serde(rename = "In Progress", alias = "InProgress")]
    InProgress,
    /// Finished.
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "Todo"),
            Self::InProgress => write!(f, "In Progress"),
            Self::Done => write!(f, "Done"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "todo" => Ok(Self::Todo),
            "inprogress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// A task on the shared board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Group that owns this task.
    pub group_id: GroupId,
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Priority.
    pub priority: Priority,
    /// Current column.
    pub status: TaskStatus,
    /// Assigned user, resolved through the user directory for display only.
    pub assignee: Option<UserId>,
    /// User who created the task.
    pub created_by: UserId,
    /// Optimistic concurrency version, starts at [`INITIAL_VERSION`].
    pub version: u64,
    /// Creation time (milliseconds since epoch).
    pub created_at: u64,
    /// Time of the last accepted mutation (milliseconds since epoch).
    pub updated_at: u64,
}

/// Body of a task creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Group the task will belong to.
    pub group_id: GroupId,
    /// Task title.
    pub title: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Optional priority (defaults to medium).
    #[serde(default)]
    pub priority: Priority,
    /// Optional initial column (defaults to todo).
    #[serde(default)]
    pub status: TaskStatus,
    /// Optional assignee.
    #[serde(default)]
    pub assignee: Option<UserId>,
}

impl NewTask {
    /// Checks title and description limits.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_description(&self.description)
    }

    /// Builds the initial record for this draft.
    #[must_use]
    pub fn into_task(self, created_by: UserId, now: u64) -> Task {
        Task {
            id: TaskId::new(),
            group_id: self.group_id,
            title: self.title.trim().to_string(),
            description: self.description,
            priority: self.priority,
            status: self.status,
            assignee: self.assignee,
            created_by,
            version: INITIAL_VERSION,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update to a task. Absent fields are left untouched.
///
/// `assignee` is tri-state: absent leaves the assignment alone, `null`
/// unassigns, and a user id assigns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// New column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// New assignment.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub assignee: Option<Option<UserId>>,
    /// Let the server assign the group member with the fewest open tasks.
    #[serde(
        default,
        rename = "autoAssign",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub auto_assign: bool,
}

/// Maps any present JSON value (including `null`) to `Some`, so a missing
/// field and an explicit `null` stay distinguishable.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TaskPatch {
    /// A patch that only moves the task to another column.
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A patch that only changes the assignee.
    #[must_use]
    pub fn assignee(assignee: Option<UserId>) -> Self {
        Self {
            assignee: Some(assignee),
            ..Self::default()
        }
    }

    /// A patch that asks the server to pick the assignee.
    #[must_use]
    pub fn auto_assign() -> Self {
        Self {
            auto_assign: true,
            ..Self::default()
        }
    }

    /// A patch carrying every editable field of `task` verbatim.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            title: Some(task.title.clone()),
            description: Some(task.description.clone()),
            priority: Some(task.priority),
            status: Some(task.status),
            assignee: Some(task.assignee),
            auto_assign: false,
        }
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.assignee.is_none()
            && !self.auto_assign
    }

    /// Returns `true` if only the status is set.
    #[must_use]
    pub const fn is_status_only(&self) -> bool {
        self.status.is_some()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && !self.auto_assign
    }

    /// Returns `true` if only the assignee is set, explicitly or by
    /// auto-assignment.
    #[must_use]
    pub const fn is_assignee_only(&self) -> bool {
        (self.assignee.is_some() || self.auto_assign)
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.status.is_none()
    }

    /// Checks the patch before any version comparison takes place.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyPatch`] for a patch with no fields,
    /// [`ValidationError::ConflictingAssignee`] when an explicit assignee
    /// is combined with auto-assignment, or the title/description limit
    /// that was violated.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        if self.auto_assign && self.assignee.is_some() {
            return Err(ValidationError::ConflictingAssignee);
        }
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        Ok(())
    }

    /// Merges the patch onto `task`, returning the new field values.
    ///
    /// The returned record keeps `task.version` and `task.updated_at`; the
    /// caller that commits it stamps both. `auto_assign` is ignored here
    /// because only the server knows the group's workload.
    #[must_use]
    pub fn apply_to(&self, task: &Task) -> Task {
        let mut next = task.clone();
        if let Some(title) = &self.title {
            next.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            next.description.clone_from(description);
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(assignee) = self.assignee {
            next.assignee = assignee;
        }
        next
    }
}

fn validate_title(title: &str) -> Result<(), ValidationError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::TitleEmpty);
    }
    if trimmed.chars().count() > MAX_TASK_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong);
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), ValidationError> {
    if description.chars().count() > MAX_TASK_DESCRIPTION_LENGTH {
        return Err(ValidationError::DescriptionTooLong);
    }
    Ok(())
}
