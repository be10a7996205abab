//! Activity ledger entries.
//!
//! An entry is an immutable fact once appended; the ledger's eviction is
//! the only thing that ever removes one.

use serde::{Deserialize, Serialize};

use crate::ids::{ActivityId, GroupId, TaskId, UserId};

/// The fixed set of actions the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityAction {
    /// A task was created.
    TaskCreated,
    /// Task fields were edited.
    TaskUpdated,
    /// A task changed column and nothing else.
    TaskMoved,
    /// A task's assignee changed and nothing else.
    TaskAssigned,
    /// A task was deleted.
    TaskDeleted,
}

impl ActivityAction {
    /// Human-readable tag shown in the activity feed.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::TaskCreated => "Task created",
            Self::TaskUpdated => "Task updated",
            Self::TaskMoved => "Task moved",
            Self::TaskAssigned => "Task assigned",
            Self::TaskDeleted => "Task deleted",
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    /// Entry identifier (time-ordered).
    pub id: ActivityId,
    /// User who performed the action.
    pub actor: UserId,
    /// What happened.
    pub action: ActivityAction,
    /// Task the action touched, if any.
    pub task_id: Option<TaskId>,
    /// Group the action happened in.
    pub group_id: GroupId,
    /// Free-text detail.
    pub detail: String,
    /// When the action was recorded (milliseconds since epoch).
    pub timestamp: u64,
}

impl ActivityLogEntry {
    /// Creates an entry stamped with a fresh id and the given time.
    #[must_use]
    pub fn new(
        actor: UserId,
        action: ActivityAction,
        task_id: Option<TaskId>,
        group_id: GroupId,
        detail: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: ActivityId::new(),
            actor,
            action,
            task_id,
            group_id,
            detail: detail.into(),
            timestamp,
        }
    }
}
