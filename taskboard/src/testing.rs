//! In-memory [`TaskApi`] double with scripted interference from a second
//! writer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use taskboard_proto::api::ConflictError;
use taskboard_proto::ids::{GroupId, TaskId, UserId};
use taskboard_proto::task::{NewTask, Priority, Task, TaskPatch, TaskStatus};

use crate::api::{ApiError, TaskApi};
use crate::retry::CancelHandle;

pub struct FakeApi {
    task: Mutex<Task>,
    fetches: AtomicUsize,
    updates: AtomicUsize,
    submitted: Mutex<Vec<u64>>,
    interfere_after_fetch: AtomicU32,
    race_updates: AtomicU32,
    cancel_on_fetch: Mutex<Option<CancelHandle>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let task = NewTask {
            group_id: GroupId::new(),
            title: "Draft release notes".to_string(),
            description: "cover the sync changes".to_string(),
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            assignee: None,
        }
        .into_task(UserId::new(), 1_000);
        Self {
            task: Mutex::new(task),
            fetches: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            interfere_after_fetch: AtomicU32::new(0),
            race_updates: AtomicU32::new(0),
            cancel_on_fetch: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Task {
        self.task.lock().unwrap().clone()
    }

    pub async fn current(&self) -> Task {
        self.snapshot()
    }

    /// Commits a title change as some other writer.
    pub async fn bump(&self, title: &str) {
        self.bump_sync(title);
    }

    fn bump_sync(&self, title: &str) {
        let mut task = self.task.lock().unwrap();
        task.title = title.to_string();
        task.version += 1;
    }

    /// Another writer commits right after each of the next `n` fetches.
    pub fn interfere_after_fetch(&self, n: u32) {
        self.interfere_after_fetch.store(n, Ordering::SeqCst);
    }

    /// Another writer commits right before each of the next `n` updates.
    pub fn race_next_updates(&self, n: u32) {
        self.race_updates.store(n, Ordering::SeqCst);
    }

    pub fn cancel_on_fetch(&self, handle: CancelHandle) {
        *self.cancel_on_fetch.lock().unwrap() = Some(handle);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub async fn submitted_versions(&self) -> Vec<u64> {
        self.submitted.lock().unwrap().clone()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TaskApi for FakeApi {
    async fn fetch(&self, task_id: &TaskId) -> Result<Task, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.cancel_on_fetch.lock().unwrap().take() {
            handle.cancel();
        }
        let current = self.snapshot();
        if current.id != *task_id {
            return Err(ApiError::NotFound(format!("task {task_id}")));
        }
        if Self::take_one(&self.interfere_after_fetch) {
            self.bump_sync("interfering edit");
        }
        Ok(current)
    }

    async fn update(
        &self,
        task_id: &TaskId,
        patch: &TaskPatch,
        expected_version: u64,
    ) -> Result<Task, ApiError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(expected_version);
        if Self::take_one(&self.race_updates) {
            self.bump_sync("racing edit");
        }

        let mut task = self.task.lock().unwrap();
        if task.id != *task_id {
            return Err(ApiError::NotFound(format!("task {task_id}")));
        }
        patch
            .validate()
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        if task.version != expected_version {
            return Err(ConflictError::new(task.clone()).into());
        }
        let mut next = patch.apply_to(&task);
        next.version = expected_version + 1;
        *task = next.clone();
        Ok(next)
    }
}
