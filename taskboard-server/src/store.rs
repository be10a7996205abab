//! Task persistence behind a single conditional write.
//!
//! The [`TaskStore`] trait is the seam to whatever backs task fields. The
//! coordinator only ever changes a persisted task through
//! [`TaskStore::compare_and_swap`], which writes the new record only if the
//! stored version still equals the caller's expected version. That check and
//! write are one atomic step scoped to a single record.
//!
//! [`InMemoryTaskStore`] keeps each record in its own cell, so swaps on
//! different tasks never contend and there is no store-wide lock held across
//! a mutation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use taskboard_proto::ids::{GroupId, TaskId};
use taskboard_proto::task::Task;

/// Errors raised by the backing store for reasons other than a version
/// mismatch.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend is unreachable or refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write failed part way; nothing was persisted.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A record with this id already exists.
    #[error("task {0} already exists")]
    Duplicate(TaskId),
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected version matched and the new record is now persisted.
    Committed(Task),
    /// The expected version did not match. Carries the record as persisted
    /// at the moment of the comparison.
    Stale(Task),
    /// No record with this id exists.
    Missing,
}

/// Persistence of task records.
pub trait TaskStore: Send + Sync + 'static {
    /// Persists a new record.
    fn insert(&self, task: Task) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Loads a record.
    fn get(&self, id: &TaskId) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;

    /// Loads every record owned by a group, oldest first.
    fn list_group(
        &self,
        group_id: &GroupId,
    ) -> impl Future<Output = Result<Vec<Task>, StoreError>> + Send;

    /// Replaces the record with `next` iff its persisted version equals
    /// `expected_version`.
    fn compare_and_swap(
        &self,
        id: &TaskId,
        expected_version: u64,
        next: Task,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    /// Removes a record, returning it if it existed.
    fn remove(&self, id: &TaskId) -> impl Future<Output = Result<Option<Task>, StoreError>> + Send;
}

/// One record slot. `None` marks a removed record so that a swap racing a
/// removal sees `Missing` instead of resurrecting it.
type Cell = Arc<Mutex<Option<Task>>>;

/// In-memory [`TaskStore`] with per-record cells.
#[derive(Default)]
pub struct InMemoryTaskStore {
    cells: RwLock<HashMap<TaskId, Cell>>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    /// Returns `true` if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    fn cell(&self, id: &TaskId) -> Option<Cell> {
        self.cells.read().get(id).cloned()
    }
}

impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut cells = self.cells.write();
        if cells.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        cells.insert(task.id, Arc::new(Mutex::new(Some(task))));
        drop(cells);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.cell(id).and_then(|cell| cell.lock().clone()))
    }

    async fn list_group(&self, group_id: &GroupId) -> Result<Vec<Task>, StoreError> {
        let cells: Vec<Cell> = self.cells.read().values().cloned().collect();
        let mut tasks: Vec<Task> = cells
            .iter()
            .filter_map(|cell| cell.lock().clone())
            .filter(|task| task.group_id == *group_id)
            .collect();
        tasks.sort_by_key(|task| (task.created_at, task.id));
        Ok(tasks)
    }

    async fn compare_and_swap(
        &self,
        id: &TaskId,
        expected_version: u64,
        next: Task,
    ) -> Result<CasOutcome, StoreError> {
        let Some(cell) = self.cell(id) else {
            return Ok(CasOutcome::Missing);
        };
        let mut slot = cell.lock();
        let outcome = match slot.as_mut() {
            None => CasOutcome::Missing,
            Some(current) if current.version != expected_version => {
                CasOutcome::Stale(current.clone())
            }
            Some(current) => {
                *current = next;
                CasOutcome::Committed(current.clone())
            }
        };
        drop(slot);
        Ok(outcome)
    }

    async fn remove(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let Some(cell) = self.cells.write().remove(id) else {
            return Ok(None);
        };
        let removed = cell.lock().take();
        Ok(removed)
    }
}
