//! Versioned task mutations.
//!
//! [`UpdateCoordinator`] is the only writer of task records. An update names
//! the version the caller last observed; the coordinator merges the patch,
//! stamps `expected_version + 1`, and commits through the store's
//! compare-and-swap. Two callers racing with the same expected version get
//! exactly one commit; the other receives the winner's record in a
//! [`ConflictError`].
//!
//! A patch that asks for auto-assignment is resolved here, against the
//! persisted record, to the group member holding the fewest tasks that are
//! not `Done`. Ties go to the member who joined first. The resolved
//! assignee rides the same compare-and-swap as any other edit.
//!
//! After a commit the coordinator appends one activity entry (best effort)
//! and publishes to the task's group channel. Neither side effect can fail
//! the mutation that triggered it.

use std::sync::Arc;

use taskboard_proto::activity::{ActivityAction, ActivityLogEntry};
use taskboard_proto::api::ConflictError;
use taskboard_proto::channel::BoardEvent;
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{self, NewTask, Task, TaskPatch, TaskStatus, ValidationError};

use crate::groups::GroupRegistry;
use crate::hub::BroadcastHub;
use crate::ledger::ActivityLedger;
use crate::store::{CasOutcome, StoreError, TaskStore};

/// Errors returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The expected version is stale. Carries the persisted record.
    #[error(transparent)]
    VersionConflict(#[from] ConflictError),

    /// No task with this id exists.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The request body is malformed.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Serializes mutations on each task through the store's conditional write.
pub struct UpdateCoordinator<S> {
    store: Arc<S>,
    hub: Arc<BroadcastHub>,
    ledger: Arc<ActivityLedger>,
    groups: Arc<GroupRegistry>,
}

impl<S: TaskStore> UpdateCoordinator<S> {
    /// Creates a coordinator over the given collaborators.
    pub const fn new(
        store: Arc<S>,
        hub: Arc<BroadcastHub>,
        ledger: Arc<ActivityLedger>,
        groups: Arc<GroupRegistry>,
    ) -> Self {
        Self {
            store,
            hub,
            ledger,
            groups,
        }
    }

    /// The registry auto-assignment draws members from.
    #[must_use]
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// The hub events are published to.
    #[must_use]
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// The ledger actions are recorded in.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ActivityLedger> {
        &self.ledger
    }

    /// Creates a task at the initial version.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Validation`] for a malformed draft or
    /// [`CoordinatorError::Storage`] if the insert fails.
    pub async fn create(&self, actor: UserId, draft: NewTask) -> Result<Task, CoordinatorError> {
        draft.validate()?;
        let task = draft.into_task(actor, task::now_millis());
        self.store.insert(task.clone()).await?;

        tracing::info!(task_id = %task.id, group_id = %task.group_id, actor = %actor, "task created");
        let detail = format!("Created \"{}\"", task.title);
        self.record(actor, ActivityAction::TaskCreated, Some(task.id), task.group_id, detail)
            .await;
        self.hub.publish(&task.group_id, BoardEvent::TaskCreated(task.clone()));
        Ok(task)
    }

    /// Applies `patch` to a task iff its persisted version equals
    /// `expected_version`. On success the committed record carries
    /// `expected_version + 1`.
    ///
    /// Validation runs before any version comparison, so a malformed patch
    /// is rejected even when the version is stale.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::Validation`] for a malformed or empty patch.
    /// - [`CoordinatorError::NotFound`] if the task does not exist.
    /// - [`CoordinatorError::VersionConflict`] with the current record if the
    ///   expected version is stale, including when a concurrent writer won.
    /// - [`CoordinatorError::Storage`] if the store fails.
    pub async fn apply(
        &self,
        actor: UserId,
        task_id: &TaskId,
        patch: &TaskPatch,
        expected_version: u64,
    ) -> Result<Task, CoordinatorError> {
        patch.validate()?;

        let current = self
            .store
            .get(task_id)
            .await?
            .ok_or(CoordinatorError::NotFound(*task_id))?;
        if current.version != expected_version {
            tracing::info!(
                task_id = %task_id,
                expected = expected_version,
                current = current.version,
                "rejecting stale update"
            );
            return Err(ConflictError::new(current).into());
        }

        let mut next = patch.apply_to(&current);
        if patch.auto_assign {
            next.assignee = self.least_loaded_member(&current).await?;
        }
        next.version = expected_version + 1;
        next.updated_at = task::now_millis().max(current.updated_at);

        let committed = match self.store.compare_and_swap(task_id, expected_version, next).await? {
            CasOutcome::Committed(task) => task,
            CasOutcome::Stale(winner) => {
                tracing::info!(
                    task_id = %task_id,
                    expected = expected_version,
                    current = winner.version,
                    "lost update race"
                );
                return Err(ConflictError::new(winner).into());
            }
            CasOutcome::Missing => return Err(CoordinatorError::NotFound(*task_id)),
        };

        tracing::info!(task_id = %task_id, version = committed.version, actor = %actor, "task updated");
        let (action, detail) = describe(patch, &committed);
        self.record(actor, action, Some(committed.id), committed.group_id, detail)
            .await;
        self.hub
            .publish(&committed.group_id, BoardEvent::TaskUpdated(committed.clone()));
        Ok(committed)
    }

    /// Removes a task.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotFound`] or [`CoordinatorError::Storage`].
    pub async fn delete(&self, actor: UserId, task_id: &TaskId) -> Result<Task, CoordinatorError> {
        let removed = self
            .store
            .remove(task_id)
            .await?
            .ok_or(CoordinatorError::NotFound(*task_id))?;

        tracing::info!(task_id = %task_id, group_id = %removed.group_id, actor = %actor, "task deleted");
        let detail = format!("Deleted \"{}\"", removed.title);
        self.record(actor, ActivityAction::TaskDeleted, Some(removed.id), removed.group_id, detail)
            .await;
        self.hub.publish(
            &removed.group_id,
            BoardEvent::TaskDeleted {
                task_id: removed.id,
                group_id: removed.group_id,
            },
        );
        Ok(removed)
    }

    /// Loads one task.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::NotFound`] or [`CoordinatorError::Storage`].
    pub async fn get(&self, task_id: &TaskId) -> Result<Task, CoordinatorError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(CoordinatorError::NotFound(*task_id))
    }

    /// Lists a group's tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Storage`] if the store fails.
    pub async fn list(&self, group_id: &GroupId) -> Result<Vec<Task>, CoordinatorError> {
        Ok(self.store.list_group(group_id).await?)
    }

    /// The member of `task`'s group with the fewest open tasks, not counting
    /// `task` itself. `None` when the group has no members left.
    async fn least_loaded_member(&self, task: &Task) -> Result<Option<UserId>, CoordinatorError> {
        let Some(group) = self.groups.get(&task.group_id).await else {
            return Ok(None);
        };
        let open: Vec<Task> = self
            .store
            .list_group(&task.group_id)
            .await?
            .into_iter()
            .filter(|t| t.id != task.id && t.status != TaskStatus::Done)
            .collect();
        let picked = group
            .members
            .iter()
            .copied()
            .min_by_key(|member| open.iter().filter(|t| t.assignee == Some(*member)).count());
        tracing::debug!(task_id = %task.id, group_id = %task.group_id, assignee = ?picked, "auto-assigned");
        Ok(picked)
    }

    /// Appends an activity entry and announces it. Ledger failures are
    /// logged and swallowed.
    async fn record(
        &self,
        actor: UserId,
        action: ActivityAction,
        task_id: Option<TaskId>,
        group_id: GroupId,
        detail: String,
    ) {
        let entry =
            ActivityLogEntry::new(actor, action, task_id, group_id, detail, task::now_millis());
        match self.ledger.append(entry.clone()).await {
            Ok(evicted) => {
                tracing::debug!(group_id = %group_id, action = %action, evicted, "activity recorded");
                self.hub.publish(&group_id, BoardEvent::ActivityAppended(entry));
            }
            Err(e) => {
                tracing::warn!(group_id = %group_id, action = %action, error = %e, "failed to record activity");
            }
        }
    }
}

/// Picks the ledger action and detail text for a committed patch.
fn describe(patch: &TaskPatch, committed: &Task) -> (ActivityAction, String) {
    if patch.is_status_only() {
        (
            ActivityAction::TaskMoved,
            format!("Moved \"{}\" to {}", committed.title, committed.status),
        )
    } else if patch.is_assignee_only() {
        let detail = committed.assignee.map_or_else(
            || format!("Unassigned \"{}\"", committed.title),
            |user| format!("Assigned \"{}\" to {user}", committed.title),
        );
        (ActivityAction::TaskAssigned, detail)
    } else {
        (
            ActivityAction::TaskUpdated,
            format!("Updated \"{}\"", committed.title),
        )
    }
}
