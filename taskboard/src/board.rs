//! Local replica of one group's board.
//!
//! `LocalBoard` is seeded from a task listing and then kept current by the
//! group's live events. Events for a task are applied only when they carry a
//! newer version than the replica holds, so a late or duplicated
//! announcement can never roll a task back. The most recently deleted tasks
//! are remembered so a straggling update cannot resurrect them.

use std::collections::{HashMap, HashSet, VecDeque};

use taskboard_proto::activity::ActivityLogEntry;
use taskboard_proto::api::DEFAULT_PAGE_SIZE;
use taskboard_proto::channel::BoardEvent;
use taskboard_proto::ids::{GroupId, TaskId};
use taskboard_proto::task::{Task, TaskStatus};

/// Deleted task ids the replica remembers.
pub const TOMBSTONE_LIMIT: usize = 256;

/// What applying an event did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A task the replica did not hold was added.
    Inserted,
    /// A held task moved to a newer version.
    Replaced,
    /// A task was removed.
    Removed,
    /// An activity entry was recorded.
    Activity,
    /// The event was stale, duplicated or for another group.
    Ignored,
}

/// Version-monotonic view of a group's tasks and recent activity.
#[derive(Debug, Clone)]
pub struct LocalBoard {
    group_id: GroupId,
    tasks: HashMap<TaskId, Task>,
    deleted: HashSet<TaskId>,
    deleted_order: VecDeque<TaskId>,
    activity: VecDeque<ActivityLogEntry>,
    activity_limit: usize,
}

impl LocalBoard {
    /// Creates an empty replica for `group_id`.
    #[must_use]
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            tasks: HashMap::new(),
            deleted: HashSet::new(),
            deleted_order: VecDeque::new(),
            activity: VecDeque::new(),
            activity_limit: DEFAULT_PAGE_SIZE,
        }
    }

    /// The group this replica mirrors.
    #[must_use]
    pub const fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Seeds the replica from a listing; tasks of other groups are skipped.
    pub fn load(&mut self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.upsert(task);
        }
    }

    /// Seeds the activity feed from a newest-first page.
    pub fn load_activity(&mut self, newest_first: impl IntoIterator<Item = ActivityLogEntry>) {
        self.activity = newest_first
            .into_iter()
            .filter(|e| e.group_id == self.group_id)
            .take(self.activity_limit)
            .collect();
    }

    /// Applies one live event.
    pub fn apply(&mut self, event: &BoardEvent) -> Applied {
        if event.group_id() != &self.group_id {
            return Applied::Ignored;
        }

        let applied = match event {
            BoardEvent::TaskCreated(task) | BoardEvent::TaskUpdated(task) => {
                self.upsert(task.clone())
            }
            BoardEvent::TaskDeleted { task_id, .. } => {
                self.remember_deleted(*task_id);
                if self.tasks.remove(task_id).is_some() {
                    Applied::Removed
                } else {
                    Applied::Ignored
                }
            }
            BoardEvent::ActivityAppended(entry) => {
                self.activity.push_front(entry.clone());
                self.activity.truncate(self.activity_limit);
                Applied::Activity
            }
        };

        if applied == Applied::Ignored {
            tracing::debug!(event = event.name(), task_id = ?event.task_id(), "ignored stale board event");
        }
        applied
    }

    fn remember_deleted(&mut self, task_id: TaskId) {
        if self.deleted.insert(task_id) {
            self.deleted_order.push_back(task_id);
        }
        while self.deleted_order.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = self.deleted_order.pop_front() {
                self.deleted.remove(&oldest);
            }
        }
    }

    fn upsert(&mut self, task: Task) -> Applied {
        if task.group_id != self.group_id || self.deleted.contains(&task.id) {
            return Applied::Ignored;
        }
        match self.tasks.get(&task.id) {
            Some(held) if held.version >= task.version => Applied::Ignored,
            Some(_) => {
                self.tasks.insert(task.id, task);
                Applied::Replaced
            }
            None => {
                self.tasks.insert(task.id, task);
                Applied::Inserted
            }
        }
    }

    /// Looks up one task.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Tasks in one status column, oldest first.
    #[must_use]
    pub fn column(&self, status: TaskStatus) -> Vec<&Task> {
        let mut column: Vec<&Task> = self.tasks.values().filter(|t| t.status == status).collect();
        column.sort_by_key(|t| (t.created_at, t.id));
        column
    }

    /// Recent activity, newest first.
    pub fn activity(&self) -> impl Iterator<Item = &ActivityLogEntry> {
        self.activity.iter()
    }

    /// Number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when the board holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
