//! Integration tests for conflicting edits over the real HTTP surface.
//!
//! Two users edit the same task through their own [`HttpTaskApi`]. Covers
//! silent convergence through [`RetryClient`], manual resolution through
//! [`ConflictResolver`], and the non-conflict error classes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use taskboard::api::{ApiError, HttpTaskApi, TaskApi};
use taskboard::resolver::{self, ConflictResolver, Field, MergeDraft, Resolution};
use taskboard::retry::{CancelToken, MutateError, RetryClient};
use taskboard_proto::ids::{TaskId, UserId};
use taskboard_proto::task::{NewTask, Priority, Task, TaskPatch, TaskStatus};
use taskboard_server::http::{self, AppState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Board {
    alice: Arc<HttpTaskApi>,
    bob: Arc<HttpTaskApi>,
    task: Task,
}

fn client(base: &str) -> Arc<HttpTaskApi> {
    Arc::new(HttpTaskApi::new(base, UserId::new(), Duration::from_secs(5)).unwrap())
}

/// Starts a server, puts Alice and Bob in one group and creates a task at
/// version 1.
async fn shared_task() -> Board {
    let (addr, _handle) = http::start_server_with_state("127.0.0.1:0", Arc::new(AppState::new()))
        .await
        .unwrap();
    let base = format!("http://{addr}");
    let alice = client(&base);
    let bob = client(&base);

    let group = alice.create_group("Launch").await.unwrap();
    bob.join_group(&group.invite_token).await.unwrap();

    let task = alice
        .create(&NewTask {
            group_id: group.id,
            title: "Write launch post".to_string(),
            description: "announce the board".to_string(),
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            assignee: None,
        })
        .await
        .unwrap();
    assert_eq!(task.version, 1);

    Board { alice, bob, task }
}

// ---------------------------------------------------------------------------
// Silent convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflict_then_convergence() {
    let Board { alice, bob, task } = shared_task().await;

    let done = alice
        .update(&task.id, &TaskPatch::status(TaskStatus::Done), 1)
        .await
        .unwrap();
    assert_eq!(done.version, 2);

    let in_progress = TaskPatch::status(TaskStatus::InProgress);
    let err = bob.update(&task.id, &in_progress, 1).await.unwrap_err();
    let ApiError::VersionConflict(conflict) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(conflict.server_task.version, 2);
    assert_eq!(conflict.server_task.status, TaskStatus::Done);

    let retry = RetryClient::new(Arc::clone(&bob));
    let converged = retry
        .mutate(&task.id, &in_progress, 1, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(converged.version, 3);
    assert_eq!(converged.status, TaskStatus::InProgress);

    let server = alice.fetch(&task.id).await.unwrap();
    assert_eq!(server, converged);
}

#[tokio::test]
async fn auto_assign_lands_on_the_idle_member_through_retries() {
    let Board { alice, bob, task } = shared_task().await;

    alice
        .create(&NewTask {
            group_id: task.group_id,
            title: "Book the venue".to_string(),
            description: String::new(),
            priority: Priority::High,
            status: TaskStatus::InProgress,
            assignee: Some(alice.user()),
        })
        .await
        .unwrap();
    alice
        .update(&task.id, &TaskPatch::status(TaskStatus::InProgress), 1)
        .await
        .unwrap();

    let assigned = RetryClient::new(Arc::clone(&alice))
        .mutate(&task.id, &TaskPatch::auto_assign(), 1, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(assigned.version, 3);
    assert_eq!(assigned.assignee, Some(bob.user()));
    assert_eq!(assigned.status, TaskStatus::InProgress);
}

#[tokio::test]
async fn retry_keeps_other_fields_of_the_winner() {
    let Board { alice, bob, task } = shared_task().await;

    let patch = TaskPatch {
        title: Some("Write launch post v2".to_string()),
        ..TaskPatch::default()
    };
    alice.update(&task.id, &patch, 1).await.unwrap();

    let assign = TaskPatch::assignee(Some(bob.user()));
    let merged = RetryClient::new(Arc::clone(&bob))
        .mutate(&task.id, &assign, 1, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(merged.title, "Write launch post v2");
    assert_eq!(merged.assignee, Some(bob.user()));
    assert_eq!(merged.version, 3);
}

// ---------------------------------------------------------------------------
// Manual resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_hand_over_to_overwrite() {
    let Board { alice, bob, task } = shared_task().await;

    alice
        .update(
            &task.id,
            &TaskPatch {
                title: Some("Alice's title".to_string()),
                ..TaskPatch::default()
            },
            1,
        )
        .await
        .unwrap();

    let bobs_patch = TaskPatch {
        title: Some("Bob's title".to_string()),
        priority: Some(Priority::High),
        ..TaskPatch::default()
    };
    let local = bobs_patch.apply_to(&task);

    let err = RetryClient::new(Arc::clone(&bob))
        .with_max_attempts(1)
        .mutate(&task.id, &bobs_patch, 1, &CancelToken::never())
        .await
        .unwrap_err();
    let MutateError::Conflict(conflict) = err else {
        panic!("expected conflict, got {err:?}");
    };

    let fields: Vec<Field> = resolver::diff(&local, &conflict.server_task)
        .iter()
        .map(|d| d.field)
        .collect();
    assert_eq!(fields, vec![Field::Title, Field::Priority]);

    let resolved = ConflictResolver::new(Arc::clone(&bob))
        .resolve(&local, &conflict, &Resolution::Overwrite)
        .await
        .unwrap();
    assert_eq!(resolved.version, 3);
    assert_eq!(resolved.title, "Bob's title");
    assert_eq!(resolved.priority, Priority::High);
}

#[tokio::test]
async fn merge_resolution_survives_a_second_conflict() {
    let Board { alice, bob, task } = shared_task().await;

    alice
        .update(
            &task.id,
            &TaskPatch {
                description: Some("alice rewrote this".to_string()),
                ..TaskPatch::default()
            },
            1,
        )
        .await
        .unwrap();

    let bobs_patch = TaskPatch {
        title: Some("Bob's title".to_string()),
        description: Some("bob's notes".to_string()),
        ..TaskPatch::default()
    };
    let local = bobs_patch.apply_to(&task);
    let err = bob.update(&task.id, &bobs_patch, 1).await.unwrap_err();
    let ApiError::VersionConflict(conflict) = err else {
        panic!("expected conflict");
    };

    // Alice commits again before Bob submits his resolution.
    alice
        .update(&task.id, &TaskPatch::status(TaskStatus::Done), 2)
        .await
        .unwrap();

    let resolver = ConflictResolver::new(Arc::clone(&bob));
    let mut seen = Vec::new();
    let resolved = resolver
        .resolve_with(&local, conflict, |local, server, _| {
            seen.push(server.version);
            Some(Resolution::Merge(
                MergeDraft::from_local(local).take_server(Field::Description, server),
            ))
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![2, 3]);
    assert_eq!(resolved.version, 4);
    assert_eq!(resolved.title, "Bob's title");
    assert_eq!(resolved.description, "alice rewrote this");
    assert_eq!(resolved.status, TaskStatus::Done);
}

// ---------------------------------------------------------------------------
// Other error classes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_task_is_not_found() {
    let Board { alice, .. } = shared_task().await;
    let err = alice
        .update(&TaskId::new(), &TaskPatch::status(TaskStatus::Done), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn invalid_patch_is_rejected_before_version_check() {
    let Board { alice, task, .. } = shared_task().await;
    let blank = TaskPatch {
        title: Some("   ".to_string()),
        ..TaskPatch::default()
    };
    let err = alice.update(&task.id, &blank, 99).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
    assert_eq!(alice.fetch(&task.id).await.unwrap().version, 1);
}

#[tokio::test]
async fn outsiders_are_unauthorized() {
    let Board { alice, task, .. } = shared_task().await;
    let outsider = client(alice.base_url());
    let err = outsider.fetch(&task.id).await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized(_)));
    let err = outsider
        .update(&task.id, &TaskPatch::status(TaskStatus::Done), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized(_)));
}
